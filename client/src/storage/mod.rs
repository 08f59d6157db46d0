//! Storage ports for the queue and small persisted values.
//!
//! The sync service only talks to these traits. [`SqliteStore`] is the
//! durable implementation; [`MemoryStore`] backs tests and ephemeral use.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use tether_engine::{EntityType, QueueItemId, QueueStatus, SyncQueueItem};

use crate::error::Result;

/// Persisted clock state.
pub const CLOCK_KEY: &str = "hlc_clock";
/// Last successful sync point.
pub const LAST_SYNC_KEY: &str = "last_sync";

/// Durable storage for queue items.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Insert or replace an item by id.
    async fn put_item(&self, item: &SyncQueueItem) -> Result<()>;

    async fn get_item(&self, id: &str) -> Result<Option<SyncQueueItem>>;

    /// Items in `status`, oldest first, optionally scoped to one user.
    async fn items_by_status(
        &self,
        user_id: Option<&str>,
        status: QueueStatus,
    ) -> Result<Vec<SyncQueueItem>>;

    /// Items for one entity in any status, oldest first.
    async fn items_by_entity(
        &self,
        user_id: Option<&str>,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<SyncQueueItem>>;

    /// Every item, optionally scoped to one user.
    async fn all_items(&self, user_id: Option<&str>) -> Result<Vec<SyncQueueItem>>;

    /// Delete items by id, returning how many existed.
    async fn delete_items(&self, ids: &[QueueItemId]) -> Result<usize>;
}

/// Byte values under string keys.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn set(&self, key: &str, value: &[u8]) -> Result<()>;
}

fn oldest_first(items: &mut [SyncQueueItem]) {
    items.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}
