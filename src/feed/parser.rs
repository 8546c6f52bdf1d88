use anyhow::Result;
use feed_rs::parser;
use sha2::{Digest, Sha256};

use crate::util::strip_control_chars;

/// A parsed feed document: channel metadata plus its items.
#[derive(Debug, Clone)]
pub struct FeedDocument {
    /// Channel title, if the document carries one.
    pub title: Option<String>,
    /// The feed's website link (not the feed URL itself).
    pub link: Option<String>,
    /// Channel icon/logo URL.
    pub icon: Option<String>,
    pub items: Vec<RemoteArticle>,
}

/// A single remote item as parsed from a feed document.
///
/// `date` is `None` when the item carries neither a publish nor an update
/// timestamp — the merge step stamps those with the update-start time.
#[derive(Debug, Clone)]
pub struct RemoteArticle {
    pub local_id: String,
    pub title: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub date: Option<i64>,
    pub content: Option<String>,
}

/// Parses RSS/Atom bytes into a [`FeedDocument`].
///
/// Remote-supplied text (titles, authors) is sanitized against control
/// characters before it leaves this function. Items without an id get a
/// stable fallback derived from their url/title/date.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedDocument> {
    let feed = parser::parse(bytes)?;

    let title = feed
        .title
        .map(|t| strip_control_chars(&t.content).into_owned())
        .filter(|t| !t.is_empty());

    // Prefer a link that is not a rel="self" feed pointer.
    let link = feed
        .links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .or_else(|| feed.links.first())
        .map(|l| l.href.clone());

    let icon = feed
        .icon
        .map(|i| i.uri)
        .or_else(|| feed.logo.map(|l| l.uri));

    let items = feed
        .entries
        .into_iter()
        .map(|entry| {
            let url = entry.links.first().map(|l| l.href.clone());
            let date = entry.published.or(entry.updated).map(|dt| dt.timestamp());
            let title = strip_control_chars(
                &entry
                    .title
                    .map(|t| t.content)
                    .unwrap_or_else(|| "Untitled".to_string()),
            )
            .into_owned();
            let author = entry
                .authors
                .first()
                .map(|a| strip_control_chars(&a.name).into_owned())
                .filter(|a| !a.is_empty());
            let content = entry
                .content
                .and_then(|c| c.body)
                .or_else(|| entry.summary.map(|s| s.content))
                .filter(|c| !c.is_empty());

            let existing_id = if entry.id.is_empty() {
                None
            } else {
                Some(entry.id.as_str())
            };
            let local_id = derive_local_id(existing_id, url.as_deref(), &title, date);

            RemoteArticle {
                local_id,
                title,
                author,
                url,
                date,
                content,
            }
        })
        .collect();

    Ok(FeedDocument {
        title,
        link,
        icon,
        items,
    })
}

/// Feed-local identity: the remote id when present, otherwise a hash over
/// url/title/date so re-ingesting the same item stays idempotent.
fn derive_local_id(
    existing: Option<&str>,
    url: Option<&str>,
    title: &str,
    date: Option<i64>,
) -> String {
    if let Some(id) = existing {
        let trimmed = id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let input = format!(
        "{}|{}|{}",
        url.unwrap_or(""),
        title,
        date.map(|d| d.to_string()).unwrap_or_default()
    );
    let hash = Sha256::digest(input.as_bytes());
    format!("{:x}", hash)
}
