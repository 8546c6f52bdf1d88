//! The per-feed update state machine.
//!
//! One cycle: fetch → parse → (discovery retry) → merge → finish. Redirects
//! and discovery retries share a single hop budget so two servers pointing at
//! each other cannot loop an update forever. Exactly one cycle per feed is in
//! flight at a time; [`Feed::request_update`] is a safe no-op while updating,
//! so the scheduler sweep and a manual refresh may race freely.

use std::sync::Arc;

use tokio::sync::Notify;

use url::Url;

use crate::feed::{discovery, parser, Feed, FeedEvent, LoadStatus};
use crate::feed::fetcher::FetchOutcome;
use crate::storage::{Article, ArticleHeaders, FeedPatch, NewArticle, Storage};

/// Ephemeral per-cycle state, reconstructed with every `Feed`.
pub(crate) struct UpdateCycle {
    active: bool,
    started_at: i64,
    cancel: Option<Arc<Notify>>,
}

impl UpdateCycle {
    pub(crate) fn new() -> Self {
        Self {
            active: false,
            started_at: 0,
            cancel: None,
        }
    }
}

impl Feed {
    /// Begin a refresh cycle with `now` as the update-start timestamp.
    ///
    /// Returns `false` (and changes nothing, including the recorded start
    /// time) if a cycle is already in flight — callers may invoke this
    /// speculatively.
    ///
    /// The feed transitions to `Updating` and emits `StatusChanged` before
    /// this returns; the fetch pipeline runs on a spawned task.
    pub fn request_update(self: &Arc<Self>, now: i64) -> bool {
        let cancel = {
            let mut cycle = self.lock_cycle();
            if cycle.active {
                return false;
            }
            cycle.active = true;
            cycle.started_at = now;
            let cancel = Arc::new(Notify::new());
            cycle.cancel = Some(Arc::clone(&cancel));
            cancel
        };

        {
            let mut state = self.locked();
            state.status = LoadStatus::Updating;
        }
        self.listeners
            .emit(&FeedEvent::StatusChanged(LoadStatus::Updating));

        let feed = Arc::clone(self);
        tokio::spawn(async move {
            run_cycle(feed, cancel, now).await;
        });
        true
    }

    /// Best-effort cancellation of the in-flight fetch.
    ///
    /// If the fetch already completed, the cycle finishes normally and the
    /// abort is superseded. On a successful abort the feed returns to `Idle`
    /// with neither an error message nor an advanced last-update time.
    pub fn abort_update(&self) {
        let cancel = {
            let cycle = self.lock_cycle();
            if cycle.active {
                cycle.cancel.clone()
            } else {
                None
            }
        };
        if let Some(cancel) = cancel {
            // notify_one stores a permit: an abort issued between suspension
            // points is observed at the next cancellation check.
            cancel.notify_one();
        }
    }

    /// Start timestamp of the in-flight cycle, if one is active.
    pub fn update_started_at(&self) -> Option<i64> {
        let cycle = self.lock_cycle();
        cycle.active.then_some(cycle.started_at)
    }

    fn lock_cycle(&self) -> std::sync::MutexGuard<'_, UpdateCycle> {
        self.cycle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Syntactic URL check for the fetch loop.
///
/// Full SSRF validation (private ranges, localhost) runs once at the
/// subscription boundary (add-feed, OPML import); the pipeline only needs a
/// well-formed http(s) URL.
fn parse_fetch_url(raw: &str) -> Result<Url, String> {
    if raw.trim().is_empty() {
        return Err("empty URL".to_owned());
    }
    let url = Url::parse(raw).map_err(|e| e.to_string())?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(format!("unsupported scheme: {other}")),
    }
}

async fn run_cycle(feed: Arc<Feed>, cancel: Arc<Notify>, started_at: i64) {
    let source = feed.source_url();

    // Invariant violation, not a network failure: bad source URLs error out
    // before any request is made.
    let mut url = match parse_fetch_url(&source) {
        Ok(url) => url,
        Err(e) => {
            finish_error(&feed, format!("invalid feed source: {e}"));
            return;
        }
    };

    let max_hops = feed.deps.max_hops;
    let mut hops = 0u32;

    // Fetch loop: redirects and discovery retries share one hop budget.
    let document = loop {
        let fetched = tokio::select! {
            result = feed.deps.fetcher.fetch(&url) => result,
            _ = cancel.notified() => {
                finish_aborted(&feed);
                return;
            }
        };

        match fetched {
            Ok(FetchOutcome::Document(bytes)) => match parser::parse_feed(&bytes) {
                Ok(document) => break document,
                Err(parse_err) => {
                    // Not a feed document. Ask discovery for a candidate URL
                    // and retry against it.
                    hops += 1;
                    if hops > max_hops {
                        finish_error(
                            &feed,
                            format!("no feed found after {max_hops} discovery attempts"),
                        );
                        return;
                    }
                    let candidate = discovery::discover_feed_url(url.as_str(), &bytes);
                    if candidate == url.as_str() {
                        finish_error(&feed, format!("invalid feed format: {parse_err}"));
                        return;
                    }
                    match parse_fetch_url(&candidate) {
                        Ok(next) => {
                            tracing::debug!(
                                feed_id = feed.id(),
                                from = %url,
                                to = %next,
                                "retrying via discovered feed URL"
                            );
                            url = next;
                        }
                        Err(e) => {
                            finish_error(&feed, format!("discovered feed URL rejected: {e}"));
                            return;
                        }
                    }
                }
            },
            Ok(FetchOutcome::Redirect { location, insecure }) => {
                hops += 1;
                if hops > max_hops {
                    finish_error(&feed, format!("redirect ceiling of {max_hops} exceeded"));
                    return;
                }
                if insecure {
                    // The transport refuses to downgrade silently; following
                    // is this state machine's explicit decision.
                    tracing::warn!(
                        feed_id = feed.id(),
                        from = %url,
                        to = %location,
                        "following insecure redirect (https -> http)"
                    );
                }
                match parse_fetch_url(location.as_str()) {
                    Ok(next) => url = next,
                    Err(e) => {
                        finish_error(&feed, format!("redirect target rejected: {e}"));
                        return;
                    }
                }
            }
            Err(e) => {
                finish_error(&feed, e.to_string());
                return;
            }
        }
    };

    merge_and_finish(&feed, document, started_at).await;
}

/// Merge parsed items into storage, expire old articles, refresh feed
/// metadata, and complete the cycle.
async fn merge_and_finish(feed: &Arc<Feed>, document: parser::FeedDocument, started_at: i64) {
    let storage = &feed.deps.storage;
    let feed_id = feed.id();
    let mut new_articles: Vec<Article> = Vec::new();

    for item in &document.items {
        // Undated items are stamped with the update-start time, once, at
        // ingest. The stamp persists; it is never re-derived.
        let date = item.date.unwrap_or(started_at);

        match storage.find_article(feed_id, &item.local_id).await {
            Ok(Some(_)) => {
                let headers = ArticleHeaders {
                    title: item.title.clone(),
                    author: item.author.clone(),
                    url: item.url.clone(),
                    date,
                    content: item.content.clone(),
                };
                if let Err(e) = storage.update_article(feed_id, &item.local_id, &headers).await {
                    finish_error(feed, format!("storage error during merge: {e}"));
                    return;
                }
            }
            Ok(None) => {
                // Absence confirmed; safe to insert.
                match storage
                    .insert_article(&NewArticle {
                        feed_id,
                        local_id: item.local_id.clone(),
                        title: item.title.clone(),
                        author: item.author.clone(),
                        url: item.url.clone(),
                        date,
                        content: item.content.clone(),
                    })
                    .await
                {
                    Ok(article) => new_articles.push(article),
                    Err(e) => {
                        finish_error(feed, format!("storage error during merge: {e}"));
                        return;
                    }
                }
            }
            Err(e) => {
                // Cannot confirm absence — abandon the cycle rather than risk
                // a duplicate; the feed stays due and retries next sweep.
                finish_error(feed, format!("storage error during merge: {e}"));
                return;
            }
        }
    }

    // Expiration, anchored to the update-start timestamp so the sweep is
    // deterministic relative to the cycle that triggered it.
    let mut expired_unread: i64 = 0;
    let expire_age = feed.expire_age();
    if expire_age > 0 {
        let cutoff = started_at - expire_age;
        match storage.expire_articles(feed_id, cutoff).await {
            Ok(expired) => {
                expired_unread = expired.deleted_unread as i64;
                if expired.deleted > 0 {
                    tracing::debug!(feed_id, deleted = expired.deleted, "expired old articles");
                }
            }
            Err(e) => {
                tracing::warn!(feed_id, error = %e, "expiration sweep failed");
            }
        }
    }

    // Metadata refresh: name only when unset, link/icon when changed.
    let new_name = {
        let current = feed.name();
        if current.trim().is_empty() {
            document.title.clone().filter(|t| !t.is_empty())
        } else {
            None
        }
    };
    let new_link = document.link.clone().filter(|l| feed.link_url().as_deref() != Some(l));
    let new_icon = document.icon.clone().filter(|i| feed.icon_url().as_deref() != Some(i));

    let mut patch = FeedPatch::default();
    if let Some(name) = &new_name {
        patch.name = Some(name.clone());
    }
    if let Some(link) = &new_link {
        patch.link_url = Some(Some(link.clone()));
    }
    if let Some(icon) = &new_icon {
        patch.icon_url = Some(Some(icon.clone()));
    }
    if !patch.is_empty() {
        if let Err(e) = storage.update_feed(feed_id, &patch).await {
            tracing::warn!(feed_id, error = %e, "failed to persist feed metadata");
        }
    }
    if let Err(e) = storage.touch_last_update(feed_id, started_at).await {
        // Non-fatal: the feed will simply look due again after a restart.
        tracing::warn!(feed_id, error = %e, "failed to persist last-update timestamp");
    }

    let unread_delta = new_articles.len() as i64 - expired_unread;

    {
        let mut state = feed.locked();
        state.status = LoadStatus::Idle;
        state.error = None;
        state.last_update = Some(started_at);
        state.unread_count += unread_delta;
        if let Some(name) = &new_name {
            state.name = name.clone();
        }
        if let Some(link) = &new_link {
            state.link_url = Some(link.clone());
        }
        if let Some(icon) = &new_icon {
            state.icon_url = Some(icon.clone());
        }
    }
    clear_cycle(feed);

    if let Some(name) = new_name {
        feed.listeners.emit(&FeedEvent::NameChanged(name));
    }
    if let Some(link) = new_link {
        feed.listeners.emit(&FeedEvent::UrlChanged(Some(link)));
    }
    for article in new_articles {
        feed.listeners.emit(&FeedEvent::ArticleAdded(article));
    }
    if unread_delta != 0 {
        feed.listeners
            .emit(&FeedEvent::UnreadCountChanged { delta: unread_delta });
    }
    feed.listeners.emit(&FeedEvent::LastUpdateChanged(started_at));
    // Status last: by the time schedulers reposition, last_update is final.
    feed.listeners
        .emit(&FeedEvent::StatusChanged(LoadStatus::Idle));
}

/// Complete the cycle in `Error` without touching last-update, so the feed
/// remains due and retries on the next sweep.
fn finish_error(feed: &Arc<Feed>, message: String) {
    tracing::warn!(feed_id = feed.id(), error = %message, "feed update failed");
    {
        let mut state = feed.locked();
        state.status = LoadStatus::Error;
        state.error = Some(message);
    }
    clear_cycle(feed);
    feed.listeners
        .emit(&FeedEvent::StatusChanged(LoadStatus::Error));
}

/// Abort is not an error: back to `Idle`, no message, no last-update.
fn finish_aborted(feed: &Arc<Feed>) {
    tracing::debug!(feed_id = feed.id(), "feed update aborted");
    {
        let mut state = feed.locked();
        state.status = LoadStatus::Idle;
    }
    clear_cycle(feed);
    feed.listeners
        .emit(&FeedEvent::StatusChanged(LoadStatus::Idle));
}

fn clear_cycle(feed: &Feed) {
    let mut cycle = feed.cycle.lock().unwrap_or_else(|e| e.into_inner());
    cycle.active = false;
    cycle.cancel = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::test_support::{make_feed, test_deps};
    use std::time::Duration;
    use wiremock::matchers::{any, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const VALID_RSS: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
    <title>Wire Feed</title>
    <link>https://example.com</link>
    <item><guid>1</guid><title>Test</title><pubDate>Mon, 01 Jan 2024 00:00:00 GMT</pubDate></item>
</channel></rss>"#;

    async fn wait_not_updating(feed: &Arc<Feed>) {
        for _ in 0..500 {
            if feed.status() != LoadStatus::Updating {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("update cycle did not finish");
    }

    #[tokio::test]
    async fn successful_cycle_merges_and_records_last_update() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;

        assert!(feed.request_update(1_000_000));
        assert_eq!(feed.status(), LoadStatus::Updating);
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Idle);
        assert_eq!(feed.last_update(), Some(1_000_000));
        assert!(feed.error().is_none());
        assert_eq!(feed.unread_count(), 1);
        assert_eq!(feed.articles().await.len(), 1);
        assert_eq!(feed.link_url().as_deref(), Some("https://example.com/"));
    }

    #[tokio::test]
    async fn reingest_is_idempotent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;

        feed.request_update(1_000_000);
        wait_not_updating(&feed).await;
        feed.request_update(1_000_100);
        wait_not_updating(&feed).await;

        assert_eq!(feed.articles().await.len(), 1, "same item stored once");
        assert_eq!(feed.unread_count(), 1);
        assert_eq!(feed.last_update(), Some(1_000_100));
    }

    #[tokio::test]
    async fn reentrant_start_is_a_noop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;

        assert!(feed.request_update(111));
        assert_eq!(feed.update_started_at(), Some(111));
        assert!(!feed.request_update(222), "second start while updating is refused");
        assert_eq!(feed.update_started_at(), Some(111), "start time untouched");

        wait_not_updating(&feed).await;
        assert_eq!(feed.last_update(), Some(111));
    }

    #[tokio::test]
    async fn network_error_sets_error_without_touching_last_update() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;

        feed.request_update(1000);
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Error);
        assert!(feed.error().unwrap().contains("500"));
        assert_eq!(feed.last_update(), None, "errors never advance last-update");
    }

    #[tokio::test]
    async fn not_found_is_a_distinct_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;
        feed.request_update(1000);
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Error);
        assert!(feed.error().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn invalid_source_url_errors_without_network() {
        let deps = test_deps().await;
        let record = deps
            .storage
            .store_feed(&crate::storage::FeedDescriptor::new("Bad", "file:///etc/passwd"))
            .await
            .unwrap();
        let feed = Feed::from_record(record, 3600, true, 0, Arc::clone(&deps));

        feed.request_update(1000);
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Error);
        assert!(feed.error().unwrap().contains("invalid feed source"));
    }

    #[tokio::test]
    async fn html_page_recovers_via_discovery() {
        let server = MockServer::start().await;
        let html = format!(
            r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="{}/real-feed">
            </head><body></body></html>"#,
            server.uri()
        );
        Mock::given(method("GET"))
            .and(path("/page"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(html)
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/real-feed"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/page", server.uri())).await;
        feed.request_update(1000);
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Idle);
        assert_eq!(feed.articles().await.len(), 1);
    }

    #[tokio::test]
    async fn redirects_are_followed_up_to_the_ceiling() {
        let server = MockServer::start().await;
        // /a and /b redirect to each other forever.
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/b"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/b"))
            .respond_with(ResponseTemplate::new(301).insert_header("Location", "/a"))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/a", server.uri())).await;
        feed.request_update(1000);
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Error);
        assert!(feed.error().unwrap().contains("redirect ceiling"));
    }

    #[tokio::test]
    async fn discovery_that_never_finds_a_feed_terminates() {
        let server = MockServer::start().await;
        // Every path serves HTML with no feed links: discovery keeps
        // fabricating "<url>/feed" candidates until the ceiling trips.
        Mock::given(any())
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("<html><body>nothing here</body></html>")
                    .insert_header("Content-Type", "text/html"),
            )
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/page", server.uri())).await;
        feed.request_update(1000);
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Error);
        assert!(feed.error().unwrap().contains("discovery"));
    }

    #[tokio::test]
    async fn abort_during_fetch_returns_to_idle() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(VALID_RSS)
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;

        feed.request_update(1000);
        feed.abort_update();
        wait_not_updating(&feed).await;

        assert_eq!(feed.status(), LoadStatus::Idle);
        assert!(feed.error().is_none(), "abort is not an error");
        assert_eq!(feed.last_update(), None, "abort never advances last-update");
        assert_eq!(feed.update_started_at(), None);
    }

    #[tokio::test]
    async fn abort_after_completion_is_a_noop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let feed = make_feed(&deps, &format!("{}/feed", server.uri())).await;

        feed.request_update(777);
        wait_not_updating(&feed).await;
        assert_eq!(feed.last_update(), Some(777));

        feed.abort_update();
        assert_eq!(feed.status(), LoadStatus::Idle);
        assert_eq!(feed.last_update(), Some(777), "completed result stands");
    }

    #[tokio::test]
    async fn expiration_runs_against_update_start_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"<?xml version="1.0"?><rss version="2.0"><channel><title>F</title></channel></rss>"#,
            ))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let record = deps
            .storage
            .store_feed(&crate::storage::FeedDescriptor {
                expire_mode: crate::storage::PolicyMode::Override,
                expire_age_secs: 100,
                ..crate::storage::FeedDescriptor::new("F", format!("{}/feed", server.uri()))
            })
            .await
            .unwrap();
        let feed_id = record.id;
        let feed = Feed::from_record(record, 3600, true, 0, Arc::clone(&deps));

        // Seed: one article exactly at the boundary, one strictly older, one
        // older but starred.
        let start = 10_000;
        for (local_id, date) in [("boundary", start - 100), ("old", start - 101), ("kept", start - 500)] {
            deps.storage
                .insert_article(&NewArticle {
                    feed_id,
                    local_id: local_id.into(),
                    title: local_id.into(),
                    author: None,
                    url: None,
                    date,
                    content: None,
                })
                .await
                .unwrap();
        }
        let starred = deps.storage.find_article(feed_id, "kept").await.unwrap().unwrap();
        deps.storage.set_article_starred(starred.id, true).await.unwrap();
        feed.resync().await;
        assert_eq!(feed.unread_count(), 3);

        feed.request_update(start);
        wait_not_updating(&feed).await;

        let remaining: Vec<String> = feed
            .articles()
            .await
            .iter()
            .map(|a| a.local_id.to_string())
            .collect();
        assert!(remaining.contains(&"boundary".to_string()), "age == expire-age is retained");
        assert!(remaining.contains(&"kept".to_string()), "starred survives regardless of age");
        assert!(!remaining.contains(&"old".to_string()));
        assert_eq!(feed.unread_count(), 2, "expiry decremented the unread count");
    }

    #[tokio::test]
    async fn empty_name_adopts_channel_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(VALID_RSS))
            .mount(&server)
            .await;

        let deps = test_deps().await;
        let record = deps
            .storage
            .store_feed(&crate::storage::FeedDescriptor::new(
                "",
                format!("{}/feed", server.uri()),
            ))
            .await
            .unwrap();
        let feed = Feed::from_record(record, 3600, true, 0, Arc::clone(&deps));

        feed.request_update(1000);
        wait_not_updating(&feed).await;
        assert_eq!(feed.name(), "Wire Feed");

        // A user-visible name is never overwritten by later cycles.
        feed.apply_name("My Name");
        feed.request_update(2000);
        wait_not_updating(&feed).await;
        assert_eq!(feed.name(), "My Name");
    }
}
