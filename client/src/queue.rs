//! Durable retry queue with debounced batching.
//!
//! Deltas are buffered in memory for a short window so rapid edits to the
//! same entity collapse into one queue item. Flushed items live in a
//! [`QueueStore`] and move through `pending → syncing → completed`, with
//! exponential backoff on failure and a dead-letter state once the retry
//! budget is spent.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_engine::{
    merge_deltas, BatchEntry, DeltaBatch, EntityType, QueueItemId, QueueStats, QueueStatus,
    RetryPolicy, SyncDelta, SyncQueueItem, Timestamp, UserId,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::storage::QueueStore;
use crate::time::WallClock;

const DAY_MS: u64 = 86_400_000;

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Debounce window before buffered deltas are written
    pub batch_window: Duration,
    /// Buffered entity count that forces an immediate flush
    pub batch_size: usize,
    pub retry: RetryPolicy,
    /// Most items handed out by one `get_pending_deltas` call
    pub max_per_request: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_window: Duration::from_millis(2000),
            batch_size: 50,
            retry: RetryPolicy::default(),
            max_per_request: 100,
        }
    }
}

#[derive(Default)]
struct BatchState {
    deltas: DeltaBatch,
    timer: Option<JoinHandle<()>>,
    generation: u64,
}

struct QueueInner {
    store: Arc<dyn QueueStore>,
    wall: Arc<dyn WallClock>,
    config: QueueConfig,
    batch: Mutex<BatchState>,
    /// Held for every load-modify-store against `store`
    write_lock: tokio::sync::Mutex<()>,
}

/// Handle to the sync queue. Clones share state.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("config", &self.inner.config)
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

impl SyncQueue {
    pub fn new(store: Arc<dyn QueueStore>, wall: Arc<dyn WallClock>, config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                wall,
                config,
                batch: Mutex::new(BatchState::default()),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Reset items left `syncing` by an interrupted run.
    ///
    /// Returns the number of recovered items.
    pub async fn initialize(&self) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        let stuck = self
            .inner
            .store
            .items_by_status(None, QueueStatus::Syncing)
            .await?;
        let mut recovered = 0;
        for mut item in stuck {
            if item.recover() {
                self.inner.store.put_item(&item).await?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "Recovered interrupted queue items");
        }
        Ok(recovered)
    }

    /// Buffer a delta for the next flush.
    ///
    /// Only the delta's shape is checked here. The write happens after the
    /// debounce window, or right away once the buffer reaches `batch_size`.
    /// A failed write keeps the delta buffered and re-arms the timer, so the
    /// call still succeeds.
    pub async fn enqueue(&self, user_id: impl Into<UserId>, delta: SyncDelta) -> Result<()> {
        let user_id = user_id.into();
        if user_id.is_empty() {
            return Err(Error::Engine(tether_engine::Error::InvalidDelta(
                "user id is empty".into(),
            )));
        }
        delta.validate()?;

        let buffered = {
            let mut state = self.inner.batch.lock();
            let coalesced = state.deltas.push(user_id, delta);
            debug!(coalesced, buffered = state.deltas.len(), "Delta buffered");
            state.deltas.len()
        };

        if buffered >= self.inner.config.batch_size {
            self.cancel_timer();
            if let Err(e) = self.flush().await {
                warn!(error = %e, buffered, "Batch flush failed, will retry");
                self.schedule_flush();
            }
        } else {
            self.schedule_flush();
        }
        Ok(())
    }

    /// Write every buffered delta to the store.
    ///
    /// Deltas for an entity that already has a pending or failed item are
    /// merged into it. On a storage error the unwritten deltas return to the
    /// buffer. Returns the number of deltas written.
    pub async fn flush(&self) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        let entries = self.inner.batch.lock().deltas.take();
        if entries.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut entries = entries.into_iter();
        while let Some(entry) = entries.next() {
            if let Err(e) = self.persist(&entry).await {
                let mut unwritten = vec![entry];
                unwritten.extend(entries);
                self.inner.batch.lock().deltas.restore(unwritten);
                return Err(e);
            }
            written += 1;
        }
        debug!(written, "Queue flushed");
        Ok(written)
    }

    async fn persist(&self, entry: &BatchEntry) -> Result<()> {
        let store = &self.inner.store;
        let existing = store
            .items_by_entity(
                Some(&entry.user_id),
                entry.delta.entity_type,
                &entry.delta.entity_id,
            )
            .await?
            .into_iter()
            .find(SyncQueueItem::is_mergeable);

        match existing {
            Some(mut item) => {
                item.delta = merge_deltas(&item.delta, &entry.delta)?;
                store.put_item(&item).await?;
                debug!(item_id = %item.id, delta_id = %item.delta.id, "Delta merged into queued item");
            }
            None => {
                let item = SyncQueueItem::new(
                    uuid::Uuid::new_v4().to_string(),
                    entry.user_id.clone(),
                    entry.delta.clone(),
                    self.inner.wall.now_ms(),
                );
                store.put_item(&item).await?;
                debug!(item_id = %item.id, delta_id = %item.delta.id, "Delta queued");
            }
        }
        Ok(())
    }

    fn schedule_flush(&self) {
        let mut state = self.inner.batch.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        let generation = state.generation;
        let window = self.inner.config.batch_window;
        let queue = self.clone();

        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            {
                // Detach before flushing so a later enqueue cannot abort a write
                let mut state = queue.inner.batch.lock();
                if state.generation != generation {
                    return;
                }
                state.timer = None;
            }
            if let Err(e) = queue.flush().await {
                warn!(error = %e, "Batch flush failed, will retry");
                queue.schedule_flush();
            }
        }));
    }

    fn cancel_timer(&self) {
        if let Some(timer) = self.inner.batch.lock().timer.take() {
            timer.abort();
        }
    }

    /// Stop the debounce timer. Buffered deltas stay until the next flush.
    pub fn shutdown(&self) {
        self.cancel_timer();
    }

    /// Number of entities waiting in the in-memory buffer.
    pub fn buffered_len(&self) -> usize {
        self.inner.batch.lock().deltas.len()
    }

    /// Whether an unflushed delta exists for the entity.
    pub fn has_buffered(&self, user_id: &str, entity_type: EntityType, entity_id: &str) -> bool {
        self.inner.batch.lock().deltas.entries().iter().any(|entry| {
            entry.user_id == user_id
                && entry.delta.entity_type == entity_type
                && entry.delta.entity_id == entity_id
        })
    }

    /// Items ready to send, oldest first, at most `max_per_request`.
    ///
    /// Includes `failed` items whose backoff has elapsed.
    pub async fn get_pending_deltas(&self, user_id: Option<&str>) -> Result<Vec<SyncQueueItem>> {
        self.due_items(user_id, &HashSet::new()).await
    }

    /// Take the next page of due items and mark them `syncing` in one step.
    ///
    /// Items in `exclude` are skipped. A flush cannot merge into an item
    /// between selection and marking, so the returned deltas are exactly
    /// what the store holds.
    pub async fn claim_pending(
        &self,
        user_id: Option<&str>,
        exclude: &HashSet<QueueItemId>,
    ) -> Result<Vec<SyncQueueItem>> {
        let _guard = self.inner.write_lock.lock().await;
        let now = self.inner.wall.now_ms();
        let mut claimed = Vec::new();
        for mut item in self.due_items(user_id, exclude).await? {
            if let Err(e) = self.claim(&mut item, now).await {
                self.release(claimed).await;
                return Err(e);
            }
            claimed.push(item);
        }
        Ok(claimed)
    }

    async fn claim(&self, item: &mut SyncQueueItem, now: Timestamp) -> Result<()> {
        item.mark_syncing(now)?;
        self.inner.store.put_item(item).await
    }

    async fn release(&self, claimed: Vec<SyncQueueItem>) {
        for mut item in claimed {
            if item.return_to_pending().is_ok() {
                if let Err(e) = self.inner.store.put_item(&item).await {
                    warn!(item_id = %item.id, error = %e, "Failed to release claimed item");
                }
            }
        }
    }

    async fn due_items(
        &self,
        user_id: Option<&str>,
        exclude: &HashSet<QueueItemId>,
    ) -> Result<Vec<SyncQueueItem>> {
        let now = self.inner.wall.now_ms();
        let store = &self.inner.store;
        let mut items = store.items_by_status(user_id, QueueStatus::Pending).await?;
        items.extend(store.items_by_status(user_id, QueueStatus::Failed).await?);
        items.retain(|item| item.is_due(now) && !exclude.contains(&item.id));
        items.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        items.truncate(self.inner.config.max_per_request);
        Ok(items)
    }

    async fn load(&self, id: &str) -> Result<SyncQueueItem> {
        self.inner
            .store
            .get_item(id)
            .await?
            .ok_or_else(|| Error::ItemNotFound(id.to_string()))
    }

    pub async fn mark_syncing(&self, id: &str) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let mut item = self.load(id).await?;
        item.mark_syncing(self.inner.wall.now_ms())?;
        self.inner.store.put_item(&item).await
    }

    /// Complete an item once the hub has acknowledged `delta_id`.
    ///
    /// If the item now holds a different delta the acknowledgement is stale:
    /// the item goes back to `pending` and `false` is returned.
    pub async fn mark_completed(&self, id: &str, delta_id: &str) -> Result<bool> {
        self.complete(id, delta_id, None).await
    }

    /// Complete an item whose change lost to a newer remote delta.
    ///
    /// Same stale-delta rule as [`mark_completed`](Self::mark_completed).
    pub async fn mark_superseded(
        &self,
        id: &str,
        delta_id: &str,
        remote_delta_id: &str,
    ) -> Result<bool> {
        let reason = format!("superseded by remote delta {remote_delta_id}");
        self.complete(id, delta_id, Some(reason)).await
    }

    async fn complete(&self, id: &str, delta_id: &str, reason: Option<String>) -> Result<bool> {
        let _guard = self.inner.write_lock.lock().await;
        let mut item = self.load(id).await?;
        if item.delta.id != delta_id {
            debug!(
                item_id = %id,
                acknowledged = %delta_id,
                current = %item.delta.id,
                "Item changed since it was sent, keeping it queued"
            );
            if item.status == QueueStatus::Syncing {
                item.return_to_pending()?;
                self.inner.store.put_item(&item).await?;
            }
            return Ok(false);
        }
        item.mark_completed()?;
        if reason.is_some() {
            item.error_message = reason;
        }
        self.inner.store.put_item(&item).await?;
        Ok(true)
    }

    /// Record a failed attempt. Returns the resulting status.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<QueueStatus> {
        let _guard = self.inner.write_lock.lock().await;
        let mut item = self.load(id).await?;
        let status = item.mark_failed(error, self.inner.wall.now_ms(), &self.inner.config.retry)?;
        self.inner.store.put_item(&item).await?;

        if status == QueueStatus::DeadLetter {
            warn!(
                item_id = %item.id,
                delta_id = %item.delta.id,
                attempts = item.attempts,
                error,
                "Queue item moved to dead letter"
            );
        } else {
            debug!(item_id = %item.id, attempts = item.attempts, next_retry_at = ?item.next_retry_at, "Queue item failed");
        }
        Ok(status)
    }

    pub async fn return_to_pending(&self, id: &str) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let mut item = self.load(id).await?;
        item.return_to_pending()?;
        self.inner.store.put_item(&item).await
    }

    pub async fn find_by_entity(
        &self,
        user_id: Option<&str>,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<SyncQueueItem>> {
        self.inner
            .store
            .items_by_entity(user_id, entity_type, entity_id)
            .await
    }

    pub async fn get_stats(&self, user_id: Option<&str>) -> Result<QueueStats> {
        let items = self.inner.store.all_items(user_id).await?;
        Ok(QueueStats::from_items(&items))
    }

    /// Make every failed item eligible immediately. Returns how many changed.
    pub async fn retry_failed_items(&self, user_id: Option<&str>) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        let failed = self
            .inner
            .store
            .items_by_status(user_id, QueueStatus::Failed)
            .await?;
        let mut reset = 0;
        for mut item in failed {
            if item.reset_for_retry() {
                self.inner.store.put_item(&item).await?;
                reset += 1;
            }
        }
        Ok(reset)
    }

    /// Give a dead-lettered item a fresh retry budget.
    pub async fn resubmit(&self, id: &str) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await;
        let mut item = self.load(id).await?;
        item.resubmit()?;
        self.inner.store.put_item(&item).await?;
        info!(item_id = %id, "Dead-letter item resubmitted");
        Ok(())
    }

    /// Delete dead-letter items last touched more than `days_old` days ago.
    pub async fn prune_dead_letter(&self, days_old: u32) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        let cutoff = self
            .inner
            .wall
            .now_ms()
            .saturating_sub(u64::from(days_old) * DAY_MS);
        let ids: Vec<_> = self
            .inner
            .store
            .items_by_status(None, QueueStatus::DeadLetter)
            .await?
            .into_iter()
            .filter(|item| item.last_attempt_at.unwrap_or(item.created_at) < cutoff)
            .map(|item| item.id)
            .collect();
        let removed = self.inner.store.delete_items(&ids).await?;
        if removed > 0 {
            info!(removed, days_old, "Pruned dead-letter items");
        }
        Ok(removed)
    }

    /// Delete completed items. Returns how many were removed.
    pub async fn clear_completed(&self, user_id: Option<&str>) -> Result<usize> {
        let _guard = self.inner.write_lock.lock().await;
        let ids: Vec<_> = self
            .inner
            .store
            .items_by_status(user_id, QueueStatus::Completed)
            .await?
            .into_iter()
            .map(|item| item.id)
            .collect();
        self.inner.store.delete_items(&ids).await
    }
}
