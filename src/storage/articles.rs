use super::schema::SqliteStorage;
use super::types::{
    Article, ArticleHeaders, ArticleRow, Expired, FeedId, NewArticle, StorageError,
};

/// Newest-first ordering used by every listing query: date descending,
/// insertion order (id) as the tiebreak.
const ORDER_NEWEST_FIRST: &str = "ORDER BY date DESC, id ASC";

const SELECT_COLUMNS: &str =
    "SELECT id, feed_id, local_id, title, author, url, date, read, starred, content FROM articles";

impl SqliteStorage {
    // ========================================================================
    // Merge Path
    // ========================================================================

    /// Look up an article by its `(feed_id, local_id)` key.
    pub async fn find_article(
        &self,
        feed_id: FeedId,
        local_id: &str,
    ) -> Result<Option<Article>, StorageError> {
        let row: Option<ArticleRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE feed_id = ? AND local_id = ?"
        ))
        .bind(feed_id)
        .bind(local_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(ArticleRow::into_article))
    }

    /// Insert a new article. New articles start unread and unstarred.
    pub async fn insert_article(&self, article: &NewArticle) -> Result<Article, StorageError> {
        let row: ArticleRow = sqlx::query_as(
            r#"
            INSERT INTO articles (feed_id, local_id, title, author, url, date, content)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            RETURNING id, feed_id, local_id, title, author, url, date, read, starred, content
        "#,
        )
        .bind(article.feed_id)
        .bind(&article.local_id)
        .bind(&article.title)
        .bind(&article.author)
        .bind(&article.url)
        .bind(article.date)
        .bind(article.content.as_deref().filter(|c| !c.is_empty()))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_article())
    }

    /// Refresh an existing article's headers.
    ///
    /// Title/author/url/date are replaced unconditionally; content only when
    /// the new value is non-empty (a feed that intermittently serves empty
    /// bodies must not erase previously cached content). Read/starred flags
    /// are never touched here.
    pub async fn update_article(
        &self,
        feed_id: FeedId,
        local_id: &str,
        headers: &ArticleHeaders,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE articles SET
                title = ?,
                author = ?,
                url = ?,
                date = ?,
                content = CASE WHEN ? IS NOT NULL THEN ? ELSE content END
            WHERE feed_id = ? AND local_id = ?
        "#,
        )
        .bind(&headers.title)
        .bind(&headers.author)
        .bind(&headers.url)
        .bind(headers.date)
        .bind(headers.content.as_deref().filter(|c| !c.is_empty()))
        .bind(headers.content.as_deref().filter(|c| !c.is_empty()))
        .bind(feed_id)
        .bind(local_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete articles strictly older than `cutoff`, starred ones exempt.
    ///
    /// An article with `date == cutoff` is retained. Runs in a transaction so
    /// the unread count and the deletion agree.
    pub async fn expire_articles(
        &self,
        feed_id: FeedId,
        cutoff: i64,
    ) -> Result<Expired, StorageError> {
        let mut tx = self.pool.begin().await?;

        let unread: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM articles
             WHERE feed_id = ? AND date < ? AND starred = 0 AND read = 0",
        )
        .bind(feed_id)
        .bind(cutoff)
        .fetch_one(&mut *tx)
        .await?;

        let result = sqlx::query("DELETE FROM articles WHERE feed_id = ? AND date < ? AND starred = 0")
            .bind(feed_id)
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Expired {
            deleted: result.rows_affected(),
            deleted_unread: unread.0 as u64,
        })
    }

    // ========================================================================
    // Flags
    // ========================================================================

    /// Set the read flag. Returns `true` if the stored value changed.
    pub async fn set_article_read(
        &self,
        article_id: i64,
        read: bool,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE articles SET read = ? WHERE id = ? AND read != ?")
            .bind(read)
            .bind(article_id)
            .bind(read)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Set the starred flag. Returns `true` if the stored value changed.
    pub async fn set_article_starred(
        &self,
        article_id: i64,
        starred: bool,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE articles SET starred = ? WHERE id = ? AND starred != ?")
            .bind(starred)
            .bind(article_id)
            .bind(starred)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn articles_for_feed(&self, feed_id: FeedId) -> Result<Vec<Article>, StorageError> {
        let rows: Vec<ArticleRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE feed_id = ? {ORDER_NEWEST_FIRST}"
        ))
        .bind(feed_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    pub async fn all_articles(&self) -> Result<Vec<Article>, StorageError> {
        let rows: Vec<ArticleRow> =
            sqlx::query_as(&format!("{SELECT_COLUMNS} {ORDER_NEWEST_FIRST}"))
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    pub async fn unread_articles(&self) -> Result<Vec<Article>, StorageError> {
        let rows: Vec<ArticleRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE read = 0 {ORDER_NEWEST_FIRST}"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    pub async fn starred_articles(&self) -> Result<Vec<Article>, StorageError> {
        let rows: Vec<ArticleRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE starred = 1 {ORDER_NEWEST_FIRST}"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    /// Substring search over title, author, and content.
    ///
    /// `%` and `_` in the query are escaped so they match literally.
    pub async fn search_articles(&self, query: &str) -> Result<Vec<Article>, StorageError> {
        let escaped = query
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("%{}%", escaped);

        let rows: Vec<ArticleRow> = sqlx::query_as(&format!(
            r#"{SELECT_COLUMNS}
            WHERE title LIKE ? ESCAPE '\'
               OR author LIKE ? ESCAPE '\'
               OR content LIKE ? ESCAPE '\'
            {ORDER_NEWEST_FIRST}"#
        ))
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    /// The newest `limit` unread articles across all feeds.
    pub async fn highlights(&self, limit: u32) -> Result<Vec<Article>, StorageError> {
        let rows: Vec<ArticleRow> = sqlx::query_as(&format!(
            "{SELECT_COLUMNS} WHERE read = 0 {ORDER_NEWEST_FIRST} LIMIT ?"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{ArticleHeaders, FeedDescriptor, NewArticle, SqliteStorage};

    async fn storage_with_feed() -> (SqliteStorage, i64) {
        let storage = SqliteStorage::open(":memory:").await.unwrap();
        let feed = storage
            .store_feed(&FeedDescriptor::new("Test", "https://example.com/rss"))
            .await
            .unwrap();
        (storage, feed.id)
    }

    fn article(feed_id: i64, local_id: &str, date: i64) -> NewArticle {
        NewArticle {
            feed_id,
            local_id: local_id.into(),
            title: format!("Article {}", local_id),
            author: Some("Author".into()),
            url: Some(format!("https://example.com/{}", local_id)),
            date,
            content: None,
        }
    }

    #[tokio::test]
    async fn insert_then_find() {
        let (storage, feed_id) = storage_with_feed().await;
        let inserted = storage.insert_article(&article(feed_id, "a1", 100)).await.unwrap();
        assert!(!inserted.read);
        assert!(!inserted.starred);

        let found = storage.find_article(feed_id, "a1").await.unwrap().unwrap();
        assert_eq!(found.id, inserted.id);
        assert_eq!(&*found.title, "Article a1");

        assert!(storage.find_article(feed_id, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_key_rejected() {
        let (storage, feed_id) = storage_with_feed().await;
        storage.insert_article(&article(feed_id, "a1", 100)).await.unwrap();
        assert!(storage.insert_article(&article(feed_id, "a1", 200)).await.is_err());
    }

    #[tokio::test]
    async fn update_refreshes_headers_but_not_flags() {
        let (storage, feed_id) = storage_with_feed().await;
        let inserted = storage.insert_article(&article(feed_id, "a1", 100)).await.unwrap();
        storage.set_article_read(inserted.id, true).await.unwrap();
        storage.set_article_starred(inserted.id, true).await.unwrap();

        storage
            .update_article(
                feed_id,
                "a1",
                &ArticleHeaders {
                    title: "Updated".into(),
                    author: None,
                    url: None,
                    date: 200,
                    content: None,
                },
            )
            .await
            .unwrap();

        let found = storage.find_article(feed_id, "a1").await.unwrap().unwrap();
        assert_eq!(&*found.title, "Updated");
        assert_eq!(found.date, 200);
        assert!(found.read, "read flag must survive header refresh");
        assert!(found.starred, "starred flag must survive header refresh");
    }

    #[tokio::test]
    async fn empty_content_does_not_erase_cached_content() {
        let (storage, feed_id) = storage_with_feed().await;
        let mut a = article(feed_id, "a1", 100);
        a.content = Some("full text".into());
        storage.insert_article(&a).await.unwrap();

        // Refresh with an empty content field — cached value must survive.
        storage
            .update_article(
                feed_id,
                "a1",
                &ArticleHeaders {
                    title: "Article a1".into(),
                    author: None,
                    url: None,
                    date: 100,
                    content: Some(String::new()),
                },
            )
            .await
            .unwrap();

        let found = storage.find_article(feed_id, "a1").await.unwrap().unwrap();
        assert_eq!(found.content.as_deref(), Some("full text"));

        // A non-empty refresh replaces it.
        storage
            .update_article(
                feed_id,
                "a1",
                &ArticleHeaders {
                    title: "Article a1".into(),
                    author: None,
                    url: None,
                    date: 100,
                    content: Some("new text".into()),
                },
            )
            .await
            .unwrap();
        let found = storage.find_article(feed_id, "a1").await.unwrap().unwrap();
        assert_eq!(found.content.as_deref(), Some("new text"));
    }

    #[tokio::test]
    async fn expire_boundary_and_starred_exemption() {
        let (storage, feed_id) = storage_with_feed().await;
        let cutoff = 1000;

        storage.insert_article(&article(feed_id, "old", cutoff - 1)).await.unwrap();
        storage.insert_article(&article(feed_id, "boundary", cutoff)).await.unwrap();
        storage.insert_article(&article(feed_id, "fresh", cutoff + 50)).await.unwrap();
        let starred = storage
            .insert_article(&article(feed_id, "old-starred", cutoff - 100))
            .await
            .unwrap();
        storage.set_article_starred(starred.id, true).await.unwrap();

        let expired = storage.expire_articles(feed_id, cutoff).await.unwrap();
        assert_eq!(expired.deleted, 1, "only the strictly-older unstarred article goes");
        assert_eq!(expired.deleted_unread, 1);

        let remaining = storage.articles_for_feed(feed_id).await.unwrap();
        let ids: Vec<&str> = remaining.iter().map(|a| &*a.local_id).collect();
        assert!(ids.contains(&"boundary"), "date == cutoff is retained");
        assert!(ids.contains(&"fresh"));
        assert!(ids.contains(&"old-starred"), "starred exempt from expiry");
        assert!(!ids.contains(&"old"));
    }

    #[tokio::test]
    async fn expire_counts_only_unread() {
        let (storage, feed_id) = storage_with_feed().await;
        let read_one = storage.insert_article(&article(feed_id, "r", 10)).await.unwrap();
        storage.insert_article(&article(feed_id, "u", 20)).await.unwrap();
        storage.set_article_read(read_one.id, true).await.unwrap();

        let expired = storage.expire_articles(feed_id, 100).await.unwrap();
        assert_eq!(expired.deleted, 2);
        assert_eq!(expired.deleted_unread, 1);
    }

    #[tokio::test]
    async fn flag_setters_report_changes() {
        let (storage, feed_id) = storage_with_feed().await;
        let a = storage.insert_article(&article(feed_id, "a1", 100)).await.unwrap();

        assert!(storage.set_article_read(a.id, true).await.unwrap());
        assert!(!storage.set_article_read(a.id, true).await.unwrap(), "idempotent");
        assert!(storage.set_article_read(a.id, false).await.unwrap());
    }

    #[tokio::test]
    async fn listing_orders_newest_first_with_stable_ties() {
        let (storage, feed_id) = storage_with_feed().await;
        storage.insert_article(&article(feed_id, "first-tie", 100)).await.unwrap();
        storage.insert_article(&article(feed_id, "second-tie", 100)).await.unwrap();
        storage.insert_article(&article(feed_id, "newest", 200)).await.unwrap();

        let listed = storage.articles_for_feed(feed_id).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|a| &*a.local_id).collect();
        assert_eq!(ids, vec!["newest", "first-tie", "second-tie"]);
    }

    #[tokio::test]
    async fn search_escapes_like_metacharacters() {
        let (storage, feed_id) = storage_with_feed().await;
        let mut exact = article(feed_id, "pct", 100);
        exact.title = "100% complete".into();
        storage.insert_article(&exact).await.unwrap();

        let mut other = article(feed_id, "other", 100);
        other.title = "100 degrees complete".into();
        storage.insert_article(&other).await.unwrap();

        let hits = storage.search_articles("100%").await.unwrap();
        assert_eq!(hits.len(), 1, "% must match literally, not as wildcard");
        assert_eq!(&*hits[0].local_id, "pct");
    }

    #[tokio::test]
    async fn highlights_limits_unread_newest() {
        let (storage, feed_id) = storage_with_feed().await;
        for (i, date) in [(1, 100), (2, 200), (3, 300)] {
            storage
                .insert_article(&article(feed_id, &format!("a{}", i), date))
                .await
                .unwrap();
        }
        let read_one = storage.find_article(feed_id, "a3").await.unwrap().unwrap();
        storage.set_article_read(read_one.id, true).await.unwrap();

        let highlights = storage.highlights(1).await.unwrap();
        assert_eq!(highlights.len(), 1);
        assert_eq!(&*highlights[0].local_id, "a2", "newest unread wins");
    }
}
