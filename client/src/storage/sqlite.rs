//! SQLite-backed storage.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tether_engine::{EntityType, QueueItemId, QueueStatus, SyncDelta, SyncQueueItem};

use super::{KeyValueStore, QueueStore};
use crate::error::Result;

/// A stored queue row from the database.
#[derive(Debug)]
pub struct StoredQueueItem {
    pub id: String,
    pub user_id: String,
    pub status: String,
    pub delta: String,
    pub created_at: i64,
    pub attempts: i64,
    pub last_attempt_at: Option<i64>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<i64>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for StoredQueueItem {
    fn from_row(row: &'r SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(StoredQueueItem {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            status: row.try_get("status")?,
            delta: row.try_get("delta")?,
            created_at: row.try_get("created_at")?,
            attempts: row.try_get("attempts")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            error_message: row.try_get("error_message")?,
            next_retry_at: row.try_get("next_retry_at")?,
        })
    }
}

impl StoredQueueItem {
    /// Convert a database row to an engine queue item.
    pub fn to_item(&self) -> Result<SyncQueueItem> {
        let delta: SyncDelta = serde_json::from_str(&self.delta)?;
        Ok(SyncQueueItem {
            id: self.id.clone(),
            user_id: self.user_id.clone(),
            delta,
            status: QueueStatus::from_str(&self.status)?,
            created_at: self.created_at as u64,
            attempts: self.attempts as u32,
            last_attempt_at: self.last_attempt_at.map(|t| t as u64),
            error_message: self.error_message.clone(),
            next_retry_at: self.next_retry_at.map(|t| t as u64),
        })
    }
}

const SELECT_ITEMS: &str = r#"
    SELECT id, user_id, status, delta, created_at, attempts,
           last_attempt_at, error_message, next_retry_at
    FROM sync_queue
"#;

/// Queue and key-value storage in one SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `database_url` and migrate it.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::with_pool(pool).await
    }

    /// A private in-memory database, migrated and ready.
    pub async fn in_memory() -> Result<Self> {
        // One long-lived connection: each new connection would see an empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: SqlitePool) -> Result<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Run database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_items(rows: Vec<StoredQueueItem>) -> Result<Vec<SyncQueueItem>> {
    rows.iter().map(StoredQueueItem::to_item).collect()
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn put_item(&self, item: &SyncQueueItem) -> Result<()> {
        let delta = serde_json::to_string(&item.delta)?;
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, user_id, entity_type, entity_id, status, delta, created_at,
                attempts, last_attempt_at, error_message, next_retry_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                delta = excluded.delta,
                attempts = excluded.attempts,
                last_attempt_at = excluded.last_attempt_at,
                error_message = excluded.error_message,
                next_retry_at = excluded.next_retry_at
            "#,
        )
        .bind(&item.id)
        .bind(&item.user_id)
        .bind(item.delta.entity_type.as_str())
        .bind(&item.delta.entity_id)
        .bind(item.status.as_str())
        .bind(delta)
        .bind(item.created_at as i64)
        .bind(item.attempts as i64)
        .bind(item.last_attempt_at.map(|t| t as i64))
        .bind(&item.error_message)
        .bind(item.next_retry_at.map(|t| t as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        let sql = format!("{SELECT_ITEMS} WHERE id = ?1");
        sqlx::query_as::<_, StoredQueueItem>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.to_item())
            .transpose()
    }

    async fn items_by_status(
        &self,
        user_id: Option<&str>,
        status: QueueStatus,
    ) -> Result<Vec<SyncQueueItem>> {
        let sql = format!(
            "{SELECT_ITEMS} WHERE status = ?1 AND (?2 IS NULL OR user_id = ?2) \
             ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, StoredQueueItem>(&sql)
            .bind(status.as_str())
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        to_items(rows)
    }

    async fn items_by_entity(
        &self,
        user_id: Option<&str>,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<SyncQueueItem>> {
        let sql = format!(
            "{SELECT_ITEMS} WHERE entity_type = ?1 AND entity_id = ?2 \
             AND (?3 IS NULL OR user_id = ?3) ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, StoredQueueItem>(&sql)
            .bind(entity_type.as_str())
            .bind(entity_id)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        to_items(rows)
    }

    async fn all_items(&self, user_id: Option<&str>) -> Result<Vec<SyncQueueItem>> {
        let sql = format!(
            "{SELECT_ITEMS} WHERE (?1 IS NULL OR user_id = ?1) ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query_as::<_, StoredQueueItem>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        to_items(rows)
    }

    async fn delete_items(&self, ids: &[QueueItemId]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for id in ids {
            removed += sqlx::query("DELETE FROM sync_queue WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(removed)
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT value FROM kv_store WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.try_get::<Vec<u8>, _>("value")).transpose()?)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_engine::{HlcTimestamp, Operation, Payload, RetryPolicy};

    fn item(id: &str, user: &str, created_at: u64) -> SyncQueueItem {
        let delta = SyncDelta::new(
            format!("d-{id}"),
            EntityType::QuizAttempt,
            format!("quiz-{id}"),
            Operation::Create,
            Payload::new().with("score", 7),
            HlcTimestamp::new(created_at, 0, "device-1"),
        );
        SyncQueueItem::new(id, user, delta, created_at)
    }

    #[tokio::test]
    async fn items_survive_a_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut stored = item("a", "user-1", 10);
        stored
            .mark_failed("boom", 20, &RetryPolicy::default())
            .unwrap();
        store.put_item(&stored).await.unwrap();

        let loaded = store.get_item("a").await.unwrap().unwrap();
        assert_eq!(loaded, stored);
        assert!(loaded.delta.verify_checksum());
    }

    #[tokio::test]
    async fn upsert_replaces_status_and_delta() {
        let store = SqliteStore::in_memory().await.unwrap();
        let mut stored = item("a", "user-1", 10);
        store.put_item(&stored).await.unwrap();

        stored.mark_syncing(15).unwrap();
        store.put_item(&stored).await.unwrap();

        assert!(store
            .items_by_status(None, QueueStatus::Pending)
            .await
            .unwrap()
            .is_empty());
        let syncing = store
            .items_by_status(Some("user-1"), QueueStatus::Syncing)
            .await
            .unwrap();
        assert_eq!(syncing.len(), 1);
        assert_eq!(syncing[0].last_attempt_at, Some(15));
    }

    #[tokio::test]
    async fn queries_filter_by_user_and_entity() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.put_item(&item("b", "user-1", 20)).await.unwrap();
        store.put_item(&item("a", "user-1", 10)).await.unwrap();
        store.put_item(&item("c", "user-2", 5)).await.unwrap();

        let mine = store.all_items(Some("user-1")).await.unwrap();
        let ids: Vec<_> = mine.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let everyone = store.all_items(None).await.unwrap();
        assert_eq!(everyone[0].id, "c");

        let by_entity = store
            .items_by_entity(None, EntityType::QuizAttempt, "quiz-b")
            .await
            .unwrap();
        assert_eq!(by_entity.len(), 1);
        assert_eq!(
            store
                .items_by_entity(Some("user-2"), EntityType::QuizAttempt, "quiz-b")
                .await
                .unwrap()
                .len(),
            0
        );

        let removed = store
            .delete_items(&["a".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.all_items(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn file_database_persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());

        {
            let store = SqliteStore::connect(&url).await.unwrap();
            store.put_item(&item("a", "user-1", 10)).await.unwrap();
            store.set("hlc_clock", b"{}").await.unwrap();
            store.pool().close().await;
        }

        let reopened = SqliteStore::connect(&url).await.unwrap();
        assert!(reopened.get_item("a").await.unwrap().is_some());
        assert_eq!(
            reopened.get("hlc_clock").await.unwrap().as_deref(),
            Some(&b"{}"[..])
        );
    }
}
