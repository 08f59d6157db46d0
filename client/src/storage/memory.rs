use async_trait::async_trait;
use dashmap::DashMap;
use tether_engine::{EntityType, QueueItemId, QueueStatus, SyncQueueItem};

use super::{oldest_first, KeyValueStore, QueueStore};
use crate::error::Result;

/// In-process store. Contents are lost when it is dropped.
#[derive(Debug, Default)]
pub struct MemoryStore {
    items: DashMap<QueueItemId, SyncQueueItem>,
    values: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn collect(&self, keep: impl Fn(&SyncQueueItem) -> bool) -> Vec<SyncQueueItem> {
        let mut items: Vec<_> = self
            .items
            .iter()
            .filter(|entry| keep(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        oldest_first(&mut items);
        items
    }
}

fn owned_by(item: &SyncQueueItem, user_id: Option<&str>) -> bool {
    user_id.map_or(true, |user| item.user_id == user)
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn put_item(&self, item: &SyncQueueItem) -> Result<()> {
        self.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn get_item(&self, id: &str) -> Result<Option<SyncQueueItem>> {
        Ok(self.items.get(id).map(|entry| entry.value().clone()))
    }

    async fn items_by_status(
        &self,
        user_id: Option<&str>,
        status: QueueStatus,
    ) -> Result<Vec<SyncQueueItem>> {
        Ok(self.collect(|item| item.status == status && owned_by(item, user_id)))
    }

    async fn items_by_entity(
        &self,
        user_id: Option<&str>,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<SyncQueueItem>> {
        Ok(self.collect(|item| {
            item.delta.entity_type == entity_type
                && item.delta.entity_id == entity_id
                && owned_by(item, user_id)
        }))
    }

    async fn all_items(&self, user_id: Option<&str>) -> Result<Vec<SyncQueueItem>> {
        Ok(self.collect(|item| owned_by(item, user_id)))
    }

    async fn delete_items(&self, ids: &[QueueItemId]) -> Result<usize> {
        Ok(ids
            .iter()
            .filter(|id| self.items.remove(id.as_str()).is_some())
            .count())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.get(key).map(|entry| entry.value().clone()))
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}
