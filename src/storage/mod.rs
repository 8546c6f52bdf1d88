//! Persistence contract and the shipped SQLite implementation.
//!
//! The engine consumes the [`Storage`] trait only; [`SqliteStorage`] is the
//! default backend. Every operation is async and fallible — callers in the
//! update/scheduling path treat failures as empty results rather than
//! propagating them (a feed whose storage read fails simply retries on its
//! next cycle).

mod articles;
mod feeds;
mod schema;
mod types;

use async_trait::async_trait;

pub use schema::SqliteStorage;
pub use types::{
    Article, ArticleHeaders, Expired, FeedDescriptor, FeedId, FeedPatch, FeedRecord, NewArticle,
    PolicyMode, StorageError,
};

/// The persistence contract consumed by the update engine.
///
/// Upserts are keyed by `(feed_id, local_id)` so concurrent updates to
/// different feeds never conflict, and repeated upserts of the same key are
/// idempotent. Implementations must cascade article deletion when a feed is
/// deleted.
#[async_trait]
pub trait Storage: Send + Sync {
    // ------------------------------------------------------------------
    // Feeds
    // ------------------------------------------------------------------

    /// All persisted feeds with their current unread counts.
    async fn load_feeds(&self) -> Result<Vec<FeedRecord>, StorageError>;

    /// Insert a new feed, returning the canonical persisted record.
    async fn store_feed(&self, descriptor: &FeedDescriptor) -> Result<FeedRecord, StorageError>;

    /// Apply a partial update to feed metadata.
    async fn update_feed(&self, id: FeedId, patch: &FeedPatch) -> Result<(), StorageError>;

    /// Record a successful update cycle's timestamp.
    async fn touch_last_update(&self, id: FeedId, timestamp: i64) -> Result<(), StorageError>;

    /// Delete a feed; its articles are cascade-deleted.
    async fn delete_feed(&self, id: FeedId) -> Result<(), StorageError>;

    // ------------------------------------------------------------------
    // Articles: merge path
    // ------------------------------------------------------------------

    /// Look up an article by its `(feed_id, local_id)` key.
    async fn find_article(
        &self,
        feed_id: FeedId,
        local_id: &str,
    ) -> Result<Option<Article>, StorageError>;

    /// Insert a new article (unread, unstarred). The key must not exist.
    async fn insert_article(&self, article: &NewArticle) -> Result<Article, StorageError>;

    /// Refresh headers of an existing article. Content is only replaced when
    /// the new value is non-empty; read/starred flags are never touched.
    async fn update_article(
        &self,
        feed_id: FeedId,
        local_id: &str,
        headers: &ArticleHeaders,
    ) -> Result<(), StorageError>;

    /// Delete articles of `feed_id` strictly older than `cutoff`, except
    /// starred ones. Returns counts so unread totals can be adjusted
    /// incrementally.
    async fn expire_articles(&self, feed_id: FeedId, cutoff: i64) -> Result<Expired, StorageError>;

    // ------------------------------------------------------------------
    // Articles: flags
    // ------------------------------------------------------------------

    /// Set the read flag; returns whether the stored value changed.
    async fn set_article_read(&self, article_id: i64, read: bool) -> Result<bool, StorageError>;

    /// Set the starred flag; returns whether the stored value changed.
    async fn set_article_starred(
        &self,
        article_id: i64,
        starred: bool,
    ) -> Result<bool, StorageError>;

    // ------------------------------------------------------------------
    // Articles: queries (newest-first by date, ties by insertion order)
    // ------------------------------------------------------------------

    async fn articles_for_feed(&self, feed_id: FeedId) -> Result<Vec<Article>, StorageError>;

    async fn all_articles(&self) -> Result<Vec<Article>, StorageError>;

    async fn unread_articles(&self) -> Result<Vec<Article>, StorageError>;

    async fn starred_articles(&self) -> Result<Vec<Article>, StorageError>;

    /// Substring search over title, author, and content.
    async fn search_articles(&self, query: &str) -> Result<Vec<Article>, StorageError>;

    /// The newest `limit` unread articles across all feeds.
    async fn highlights(&self, limit: u32) -> Result<Vec<Article>, StorageError>;
}

// Inherent methods on SqliteStorage (split across feeds.rs/articles.rs the way
// the schema is) back the trait one-to-one.
#[async_trait]
impl Storage for SqliteStorage {
    async fn load_feeds(&self) -> Result<Vec<FeedRecord>, StorageError> {
        SqliteStorage::load_feeds(self).await
    }

    async fn store_feed(&self, descriptor: &FeedDescriptor) -> Result<FeedRecord, StorageError> {
        SqliteStorage::store_feed(self, descriptor).await
    }

    async fn update_feed(&self, id: FeedId, patch: &FeedPatch) -> Result<(), StorageError> {
        SqliteStorage::update_feed(self, id, patch).await
    }

    async fn touch_last_update(&self, id: FeedId, timestamp: i64) -> Result<(), StorageError> {
        SqliteStorage::touch_last_update(self, id, timestamp).await
    }

    async fn delete_feed(&self, id: FeedId) -> Result<(), StorageError> {
        SqliteStorage::delete_feed(self, id).await
    }

    async fn find_article(
        &self,
        feed_id: FeedId,
        local_id: &str,
    ) -> Result<Option<Article>, StorageError> {
        SqliteStorage::find_article(self, feed_id, local_id).await
    }

    async fn insert_article(&self, article: &NewArticle) -> Result<Article, StorageError> {
        SqliteStorage::insert_article(self, article).await
    }

    async fn update_article(
        &self,
        feed_id: FeedId,
        local_id: &str,
        headers: &ArticleHeaders,
    ) -> Result<(), StorageError> {
        SqliteStorage::update_article(self, feed_id, local_id, headers).await
    }

    async fn expire_articles(&self, feed_id: FeedId, cutoff: i64) -> Result<Expired, StorageError> {
        SqliteStorage::expire_articles(self, feed_id, cutoff).await
    }

    async fn set_article_read(&self, article_id: i64, read: bool) -> Result<bool, StorageError> {
        SqliteStorage::set_article_read(self, article_id, read).await
    }

    async fn set_article_starred(
        &self,
        article_id: i64,
        starred: bool,
    ) -> Result<bool, StorageError> {
        SqliteStorage::set_article_starred(self, article_id, starred).await
    }

    async fn articles_for_feed(&self, feed_id: FeedId) -> Result<Vec<Article>, StorageError> {
        SqliteStorage::articles_for_feed(self, feed_id).await
    }

    async fn all_articles(&self) -> Result<Vec<Article>, StorageError> {
        SqliteStorage::all_articles(self).await
    }

    async fn unread_articles(&self) -> Result<Vec<Article>, StorageError> {
        SqliteStorage::unread_articles(self).await
    }

    async fn starred_articles(&self) -> Result<Vec<Article>, StorageError> {
        SqliteStorage::starred_articles(self).await
    }

    async fn search_articles(&self, query: &str) -> Result<Vec<Article>, StorageError> {
        SqliteStorage::search_articles(self, query).await
    }

    async fn highlights(&self, limit: u32) -> Result<Vec<Article>, StorageError> {
        SqliteStorage::highlights(self, limit).await
    }
}
