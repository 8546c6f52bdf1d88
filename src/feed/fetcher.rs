use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Default per-request timeout.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Default response body cap.
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 10 * 1024 * 1024; // 10MB

/// Errors produced by a single fetch attempt.
///
/// These map onto the update engine's error taxonomy: all of them are
/// transient from the scheduler's point of view — the feed goes to `Error`
/// and is retried on its normal schedule.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Request exceeded the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// DNS/connection failure.
    #[error("host unreachable: {0}")]
    UnknownHost(String),
    /// The resource does not exist.
    #[error("not found (HTTP 404)")]
    NotFound,
    /// Any other non-2xx HTTP response.
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    /// Network-level error (TLS, protocol, connection reset).
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Response body exceeded the size limit.
    #[error("response too large")]
    ResponseTooLarge,
    /// A redirect response without a usable Location header.
    #[error("redirect without Location header")]
    MissingLocation,
}

/// Outcome of a fetch that did not error.
///
/// Redirects are *surfaced*, never followed: the transport reports where the
/// server pointed and whether following would downgrade https to http. The
/// caller decides whether to follow and owns the hop budget, so redirect
/// ping-pong between two servers cannot loop inside the transport.
#[derive(Debug)]
pub enum FetchOutcome {
    /// 2xx response body, size-capped.
    Document(Vec<u8>),
    /// 3xx response; `insecure` is set when the target downgrades https→http.
    Redirect { location: Url, insecure: bool },
}

/// HTTP transport for feed sources.
///
/// Cheap to clone; wraps a shared [`reqwest::Client`] configured to never
/// follow redirects on its own.
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: usize,
}

impl Fetcher {
    /// Build a transport with the given timeout and body cap.
    ///
    /// # Errors
    ///
    /// Fails only if the underlying TLS backend cannot initialize.
    pub fn new(timeout: Duration, max_bytes: usize) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self {
            client,
            timeout,
            max_bytes,
        })
    }

    /// Fetch one URL.
    ///
    /// Returns the body for 2xx responses, a surfaced [`FetchOutcome::Redirect`]
    /// for 3xx, and an error otherwise. Cancellation is the caller's concern:
    /// dropping the returned future aborts the in-flight request.
    pub async fn fetch(&self, url: &Url) -> Result<FetchOutcome, FetchError> {
        let response = tokio::time::timeout(self.timeout, self.client.get(url.clone()).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(classify_send_error)?;

        let status = response.status();

        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(FetchError::MissingLocation)?;
            // Location may be relative; resolve against the request URL.
            let target = url.join(location).map_err(|_| FetchError::MissingLocation)?;
            let insecure = url.scheme() == "https" && target.scheme() == "http";
            return Ok(FetchOutcome::Redirect {
                location: target,
                insecure,
            });
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }

        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        let bytes = read_limited_bytes(response, self.max_bytes).await?;
        Ok(FetchOutcome::Document(bytes))
    }
}

fn classify_send_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::Timeout;
    }
    if err.is_connect() {
        let host = err
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or("<unknown>")
            .to_owned();
        return FetchError::UnknownHost(host);
    }
    FetchError::Network(err)
}

/// Reads a response body with a streaming size cap.
async fn read_limited_bytes(response: reqwest::Response, limit: usize) -> Result<Vec<u8>, FetchError> {
    // Fast path: check Content-Length header
    if let Some(len) = response.content_length() {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    Ok(bytes)
}
