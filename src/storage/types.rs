use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Storage-layer errors.
///
/// The engine never lets these escalate: every consumer degrades to an empty
/// result (queries) or abandons the current cycle (merges), logging the error.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Another process has the database locked.
    #[error("storage is locked by another instance")]
    Locked,

    /// Schema migration failed.
    #[error("storage migration failed: {0}")]
    Migration(String),

    /// Generic database error.
    #[error("storage error: {0}")]
    Other(#[from] sqlx::Error),
}

impl StorageError {
    /// Map a sqlx error, detecting SQLite lock conditions.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let message = err.to_string().to_lowercase();

        // SQLITE_BUSY (5): database is locked
        // SQLITE_LOCKED (6): database table is locked
        // SQLITE_CANTOPEN (14): unable to open database file
        if message.contains("database is locked")
            || message.contains("database table is locked")
            || message.contains("sqlite_busy")
            || message.contains("sqlite_locked")
            || message.contains("unable to open database file")
        {
            return StorageError::Locked;
        }

        StorageError::Other(err)
    }
}

// ============================================================================
// Identity
// ============================================================================

/// Opaque stable feed identity, assigned by storage on insert.
pub type FeedId = i64;

// ============================================================================
// Policy Modes
// ============================================================================

/// How a feed resolves its update interval or expiry age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyMode {
    /// Follow the context-wide default; reconfigured whenever the default changes.
    Inherit,
    /// Use the feed's own value; untouched by default changes.
    Override,
    /// Feature disabled for this feed regardless of defaults.
    Disabled,
}

impl PolicyMode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            PolicyMode::Inherit => "inherit",
            PolicyMode::Override => "override",
            PolicyMode::Disabled => "disabled",
        }
    }

    pub(crate) fn parse(s: &str) -> PolicyMode {
        match s {
            "override" => PolicyMode::Override,
            "disabled" => PolicyMode::Disabled,
            _ => PolicyMode::Inherit,
        }
    }
}

// ============================================================================
// Feed Records
// ============================================================================

/// Descriptor for a feed that does not exist in storage yet (user input or
/// OPML import).
#[derive(Debug, Clone)]
pub struct FeedDescriptor {
    pub name: String,
    pub category: Option<String>,
    pub source_url: String,
    pub link_url: Option<String>,
    pub icon_url: Option<String>,
    pub update_mode: PolicyMode,
    pub update_interval_secs: i64,
    pub expire_mode: PolicyMode,
    pub expire_age_secs: i64,
}

impl FeedDescriptor {
    /// Descriptor with inherit-everything policy, the common case for new
    /// subscriptions.
    pub fn new(name: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: None,
            source_url: source_url.into(),
            link_url: None,
            icon_url: None,
            update_mode: PolicyMode::Inherit,
            update_interval_secs: 0,
            expire_mode: PolicyMode::Inherit,
            expire_age_secs: 0,
        }
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }

    pub fn with_link(mut self, link_url: Option<String>) -> Self {
        self.link_url = link_url;
        self
    }
}

/// A feed as persisted in storage.
#[derive(Debug, Clone)]
pub struct FeedRecord {
    pub id: FeedId,
    pub name: String,
    pub category: Option<String>,
    pub source_url: String,
    pub link_url: Option<String>,
    pub icon_url: Option<String>,
    pub unread_count: i64,
    pub update_mode: PolicyMode,
    pub update_interval_secs: i64,
    pub expire_mode: PolicyMode,
    pub expire_age_secs: i64,
    pub last_update: Option<i64>,
}

/// Partial feed update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct FeedPatch {
    pub name: Option<String>,
    pub category: Option<Option<String>>,
    pub source_url: Option<String>,
    pub link_url: Option<Option<String>>,
    pub icon_url: Option<Option<String>>,
    pub update_mode: Option<PolicyMode>,
    pub update_interval_secs: Option<i64>,
    pub expire_mode: Option<PolicyMode>,
    pub expire_age_secs: Option<i64>,
}

impl FeedPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.category.is_none()
            && self.source_url.is_none()
            && self.link_url.is_none()
            && self.icon_url.is_none()
            && self.update_mode.is_none()
            && self.update_interval_secs.is_none()
            && self.expire_mode.is_none()
            && self.expire_age_secs.is_none()
    }
}

// ============================================================================
// Article Records
// ============================================================================

/// A stored article.
///
/// String fields use `Arc<str>` for cheap cloning through event fan-out:
/// a single `ArticleAdded` can be forwarded by several aggregate views.
#[derive(Debug, Clone)]
pub struct Article {
    /// Storage-assigned numeric id.
    pub id: i64,
    pub feed_id: FeedId,
    /// Feed-local identity; `(feed_id, local_id)` is unique.
    pub local_id: Arc<str>,
    pub title: Arc<str>,
    pub author: Option<Arc<str>>,
    pub url: Option<Arc<str>>,
    /// Publish/update timestamp (unix seconds). Undated items are stamped
    /// with the update-start time at ingest and never re-derived.
    pub date: i64,
    pub read: bool,
    pub starred: bool,
    /// Raw content; absent until a fetch supplied a non-empty body.
    pub content: Option<Arc<str>>,
}

/// A not-yet-persisted article produced by one merge cycle.
#[derive(Debug, Clone)]
pub struct NewArticle {
    pub feed_id: FeedId,
    pub local_id: String,
    pub title: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub date: i64,
    pub content: Option<String>,
}

/// Header refresh for an existing article. Headers are applied
/// unconditionally; `content` only replaces the stored value when non-empty.
#[derive(Debug, Clone)]
pub struct ArticleHeaders {
    pub title: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub date: i64,
    pub content: Option<String>,
}

/// Result of one expiration sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Expired {
    /// Articles deleted.
    pub deleted: u64,
    /// Of those, how many were unread (callers adjust unread counts by this).
    pub deleted_unread: u64,
}

// ============================================================================
// Row Types (sqlx)
// ============================================================================

/// Internal row type for feed queries with unread counts.
pub(crate) type FeedRow = (
    i64,            // id
    String,         // name
    Option<String>, // category
    String,         // source_url
    Option<String>, // link_url
    Option<String>, // icon_url
    String,         // update_mode
    i64,            // update_interval_secs
    String,         // expire_mode
    i64,            // expire_age_secs
    Option<i64>,    // last_update
    i64,            // unread_count
);

pub(crate) fn feed_from_row(row: FeedRow) -> FeedRecord {
    let (
        id,
        name,
        category,
        source_url,
        link_url,
        icon_url,
        update_mode,
        update_interval_secs,
        expire_mode,
        expire_age_secs,
        last_update,
        unread_count,
    ) = row;
    FeedRecord {
        id,
        name,
        category,
        source_url,
        link_url,
        icon_url,
        unread_count,
        update_mode: PolicyMode::parse(&update_mode),
        update_interval_secs,
        expire_mode: PolicyMode::parse(&expire_mode),
        expire_age_secs,
        last_update,
    }
}

/// Internal row type for article queries (sqlx FromRow); converts to
/// [`Article`] with `Arc` wrapping.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleRow {
    pub id: i64,
    pub feed_id: i64,
    pub local_id: String,
    pub title: String,
    pub author: Option<String>,
    pub url: Option<String>,
    pub date: i64,
    pub read: bool,
    pub starred: bool,
    pub content: Option<String>,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            feed_id: self.feed_id,
            local_id: Arc::from(self.local_id),
            title: Arc::from(self.title),
            author: self.author.map(Arc::from),
            url: self.url.map(Arc::from),
            date: self.date,
            read: self.read,
            starred: self.starred,
            content: self.content.map(Arc::from),
        }
    }
}
