use sqlx::QueryBuilder;

use super::schema::SqliteStorage;
use super::types::{
    feed_from_row, FeedDescriptor, FeedId, FeedPatch, FeedRecord, FeedRow, StorageError,
};

impl SqliteStorage {
    // ========================================================================
    // Feed Operations
    // ========================================================================

    /// All feeds with their unread article counts.
    pub async fn load_feeds(&self) -> Result<Vec<FeedRecord>, StorageError> {
        let rows: Vec<FeedRow> = sqlx::query_as(
            r#"
                SELECT
                    f.id, f.name, f.category, f.source_url, f.link_url, f.icon_url,
                    f.update_mode, f.update_interval_secs, f.expire_mode, f.expire_age_secs,
                    f.last_update,
                    COUNT(CASE WHEN a.read = 0 THEN 1 END) as unread_count
                FROM feeds f
                LEFT JOIN articles a ON f.id = a.feed_id
                GROUP BY f.id
                ORDER BY f.id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(feed_from_row).collect())
    }

    /// Insert a new feed, returning the canonical persisted record.
    pub async fn store_feed(
        &self,
        descriptor: &FeedDescriptor,
    ) -> Result<FeedRecord, StorageError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (name, category, source_url, link_url, icon_url,
                               update_mode, update_interval_secs, expire_mode, expire_age_secs)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&descriptor.name)
        .bind(&descriptor.category)
        .bind(&descriptor.source_url)
        .bind(&descriptor.link_url)
        .bind(&descriptor.icon_url)
        .bind(descriptor.update_mode.as_str())
        .bind(descriptor.update_interval_secs)
        .bind(descriptor.expire_mode.as_str())
        .bind(descriptor.expire_age_secs)
        .fetch_one(&self.pool)
        .await?;

        Ok(FeedRecord {
            id: row.0,
            name: descriptor.name.clone(),
            category: descriptor.category.clone(),
            source_url: descriptor.source_url.clone(),
            link_url: descriptor.link_url.clone(),
            icon_url: descriptor.icon_url.clone(),
            unread_count: 0,
            update_mode: descriptor.update_mode,
            update_interval_secs: descriptor.update_interval_secs,
            expire_mode: descriptor.expire_mode,
            expire_age_secs: descriptor.expire_age_secs,
            last_update: None,
        })
    }

    /// Apply a partial metadata update. An empty patch is a no-op.
    pub async fn update_feed(&self, id: FeedId, patch: &FeedPatch) -> Result<(), StorageError> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new("UPDATE feeds SET ");
        let mut assignments = builder.separated(", ");

        if let Some(name) = &patch.name {
            assignments.push("name = ").push_bind_unseparated(name);
        }
        if let Some(category) = &patch.category {
            assignments
                .push("category = ")
                .push_bind_unseparated(category.as_deref());
        }
        if let Some(source_url) = &patch.source_url {
            assignments
                .push("source_url = ")
                .push_bind_unseparated(source_url);
        }
        if let Some(link_url) = &patch.link_url {
            assignments
                .push("link_url = ")
                .push_bind_unseparated(link_url.as_deref());
        }
        if let Some(icon_url) = &patch.icon_url {
            assignments
                .push("icon_url = ")
                .push_bind_unseparated(icon_url.as_deref());
        }
        if let Some(mode) = patch.update_mode {
            assignments
                .push("update_mode = ")
                .push_bind_unseparated(mode.as_str());
        }
        if let Some(interval) = patch.update_interval_secs {
            assignments
                .push("update_interval_secs = ")
                .push_bind_unseparated(interval);
        }
        if let Some(mode) = patch.expire_mode {
            assignments
                .push("expire_mode = ")
                .push_bind_unseparated(mode.as_str());
        }
        if let Some(age) = patch.expire_age_secs {
            assignments
                .push("expire_age_secs = ")
                .push_bind_unseparated(age);
        }

        builder.push(" WHERE id = ").push_bind(id);
        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    /// Record the timestamp of a completed update cycle.
    pub async fn touch_last_update(
        &self,
        id: FeedId,
        timestamp: i64,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE feeds SET last_update = ? WHERE id = ?")
            .bind(timestamp)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a feed; `ON DELETE CASCADE` removes its articles.
    pub async fn delete_feed(&self, id: FeedId) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM feeds WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
