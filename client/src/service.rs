//! Sync orchestrator.
//!
//! [`SyncService`] ties the clock, queue and transport together. A sync
//! cycle flushes the queue's batch, sends due items per user, settles each
//! item from the hub's answer, resolves cited conflicts with last-write-wins
//! and applies the deltas the hub returns. Cycles are single-flight.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tether_engine::{
    resolve_conflict, ConflictRecord, EntityPayload, EntityType, HlcTimestamp, NodeId, Operation,
    Payload, QueueItemId, QueueStatus, SyncDelta, SyncQueueItem, SyncRequest, SyncResponse,
    Timestamp, UserId,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::ClockHandle;
use crate::config::{Config, SyncConfig};
use crate::error::Result;
use crate::events::{EventBus, SyncDirection, SyncEvent, SyncEventKind};
use crate::queue::{QueueConfig, SyncQueue};
use crate::status::{OverallSyncStatus, SyncStatus};
use crate::storage::{KeyValueStore, QueueStore, SqliteStore, LAST_SYNC_KEY};
use crate::time::{SystemClock, WallClock};
use crate::transport::{HttpTransport, IdentityProvider, Transport};

/// Receives deltas from other devices so local copies can be updated.
#[async_trait]
pub trait RemoteApplier: Send + Sync {
    async fn apply(&self, user_id: &str, delta: &SyncDelta) -> Result<()>;
}

/// Why a sync cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

/// Outcome of one [`SyncService::perform_sync`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub success: bool,
    pub deltas_sent: usize,
    pub deltas_received: usize,
    pub conflicts: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SkipReason>,
}

impl SyncResult {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastSync {
    server_timestamp: HlcTimestamp,
    synced_at: Timestamp,
}

struct ServiceInner {
    device_id: NodeId,
    queue: SyncQueue,
    kv: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    applier: Option<Arc<dyn RemoteApplier>>,
    clock: ClockHandle,
    wall: Arc<dyn WallClock>,
    events: EventBus,
    config: SyncConfig,
    online: AtomicBool,
    running: AtomicBool,
    last_sync: Mutex<Option<LastSync>>,
    conflicts: Mutex<VecDeque<ConflictRecord>>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

/// The sync orchestrator. Clones share state.
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("device_id", &self.inner.device_id)
            .field("online", &self.is_online())
            .field("syncing", &self.is_syncing())
            .finish()
    }
}

/// Builder for [`SyncService`].
pub struct SyncServiceBuilder {
    identity: Arc<dyn IdentityProvider>,
    queue_store: Arc<dyn QueueStore>,
    kv_store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    applier: Option<Arc<dyn RemoteApplier>>,
    wall: Arc<dyn WallClock>,
    queue_config: QueueConfig,
    sync_config: SyncConfig,
    online: bool,
    event_capacity: usize,
}

impl SyncServiceBuilder {
    pub fn applier(mut self, applier: Arc<dyn RemoteApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    pub fn wall_clock(mut self, wall: Arc<dyn WallClock>) -> Self {
        self.wall = wall;
        self
    }

    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    /// Initial connectivity. Defaults to offline.
    pub fn online(mut self, online: bool) -> Self {
        self.online = online;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn build(self) -> SyncService {
        let device_id = self.identity.device_id();
        let clock = ClockHandle::new(device_id.clone(), self.wall.clone());
        let queue = SyncQueue::new(self.queue_store, self.wall.clone(), self.queue_config);

        SyncService {
            inner: Arc::new(ServiceInner {
                device_id,
                queue,
                kv: self.kv_store,
                transport: self.transport,
                applier: self.applier,
                clock,
                wall: self.wall,
                events: EventBus::new(self.event_capacity),
                config: self.sync_config,
                online: AtomicBool::new(self.online),
                running: AtomicBool::new(false),
                last_sync: Mutex::new(None),
                conflicts: Mutex::new(VecDeque::new()),
                auto_sync: Mutex::new(None),
            }),
        }
    }
}

/// Holds the single-flight flag for the duration of a cycle.
struct CycleGuard<'a>(&'a AtomicBool);

impl<'a> CycleGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SyncService {
    pub fn builder(
        identity: Arc<dyn IdentityProvider>,
        queue_store: Arc<dyn QueueStore>,
        kv_store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
    ) -> SyncServiceBuilder {
        SyncServiceBuilder {
            identity,
            queue_store,
            kv_store,
            transport,
            applier: None,
            wall: Arc::new(SystemClock),
            queue_config: QueueConfig::default(),
            sync_config: SyncConfig::default(),
            online: false,
            event_capacity: 256,
        }
    }

    /// Open SQLite storage and the HTTP transport described by `config`.
    ///
    /// Returns a builder so callers can still attach an applier.
    pub async fn connect(config: &Config) -> Result<SyncServiceBuilder> {
        let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
        let identity: Arc<dyn IdentityProvider> = Arc::new(config.identity.clone());
        let transport = Arc::new(HttpTransport::new(
            identity.clone(),
            config.sync.sync_timeout,
            config.sync.health_timeout,
        )?);

        Ok(Self::builder(identity, store.clone(), store, transport)
            .queue_config(config.queue.clone())
            .sync_config(config.sync.clone()))
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.inner.queue
    }

    pub fn clock(&self) -> &ClockHandle {
        &self.inner.clock
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Wall time of the last completed round trip.
    pub fn last_sync_at(&self) -> Option<Timestamp> {
        self.inner.last_sync.lock().as_ref().map(|last| last.synced_at)
    }

    /// Recent conflicts, oldest first.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        self.inner.conflicts.lock().iter().cloned().collect()
    }

    /// Load persisted clock and sync state, then recover the queue.
    pub async fn initialize(&self) -> Result<()> {
        if let Err(e) = self.inner.clock.load(self.inner.kv.as_ref()).await {
            warn!(error = %e, "Failed to load clock state, starting fresh");
        }
        match self.load_last_sync().await {
            Ok(last) => *self.inner.last_sync.lock() = last,
            Err(e) => warn!(error = %e, "Failed to load last sync state"),
        }

        let recovered = self.inner.queue.initialize().await?;
        info!(
            device_id = %self.inner.device_id,
            recovered,
            "Sync service initialized"
        );
        Ok(())
    }

    /// Stop background work and write out buffered state.
    pub async fn dispose(&self) {
        self.stop_auto_sync();
        self.inner.queue.shutdown();
        if let Err(e) = self.inner.queue.flush().await {
            warn!(error = %e, "Failed to flush queue on shutdown");
        }
        self.persist_clock().await;
        info!(device_id = %self.inner.device_id, "Sync service stopped");
    }

    async fn load_last_sync(&self) -> Result<Option<LastSync>> {
        let Some(bytes) = self.inner.kv.get(LAST_SYNC_KEY).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn persist_clock(&self) {
        if let Err(e) = self.inner.clock.persist(self.inner.kv.as_ref()).await {
            warn!(error = %e, "Failed to persist clock state");
        }
    }

    async fn persist_last_sync(&self) {
        let Some(last) = self.inner.last_sync.lock().clone() else {
            return;
        };
        let stored = match serde_json::to_vec(&last) {
            Ok(bytes) => self.inner.kv.set(LAST_SYNC_KEY, &bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = stored {
            warn!(error = %e, "Failed to persist last sync state");
        }
    }

    fn emit(&self, kind: SyncEventKind) {
        self.inner.events.emit(self.inner.wall.now_ms(), kind);
    }

    /// Stamp a local change and queue it.
    ///
    /// Only touches local state, so it works offline. Errors mean the change
    /// was not queued.
    pub async fn create_delta(
        &self,
        user_id: &str,
        entity_type: EntityType,
        entity_id: &str,
        operation: Operation,
        payload: Payload,
    ) -> Result<SyncDelta> {
        let delta = SyncDelta::new(
            uuid::Uuid::new_v4().to_string(),
            entity_type,
            entity_id,
            operation,
            payload,
            self.inner.clock.now(),
        );
        self.inner.queue.enqueue(user_id, delta.clone()).await?;
        self.persist_clock().await;

        debug!(
            delta_id = %delta.id,
            entity_type = %entity_type,
            entity_id,
            operation = %operation,
            "Delta created"
        );
        Ok(delta)
    }

    /// [`create_delta`](Self::create_delta) for a typed payload.
    pub async fn create_entity_delta<T: EntityPayload>(
        &self,
        user_id: &str,
        entity_id: &str,
        operation: Operation,
        value: &T,
    ) -> Result<SyncDelta> {
        let payload = match operation {
            Operation::Delete => Payload::new(),
            _ => Payload::encode(value)?,
        };
        self.create_delta(user_id, T::ENTITY_TYPE, entity_id, operation, payload)
            .await
    }

    /// Run one sync cycle.
    ///
    /// Returns a skipped result when offline or when another cycle is
    /// running. Failures are reported in the result and as a `sync_error`
    /// event, never as an `Err`.
    pub async fn perform_sync(&self, user_id: Option<&str>) -> SyncResult {
        if !self.is_online() {
            debug!("Offline, sync skipped");
            return SyncResult::skipped(SkipReason::Offline);
        }
        let Some(_guard) = CycleGuard::acquire(&self.inner.running) else {
            debug!("Sync already running, skipped");
            return SyncResult::skipped(SkipReason::AlreadyRunning);
        };

        self.emit(SyncEventKind::SyncStarted {
            user_id: user_id.map(str::to_string),
        });

        let mut result = SyncResult::default();
        match self.run_cycle(user_id, &mut result).await {
            Ok(()) => {
                result.success = true;
                info!(
                    sent = result.deltas_sent,
                    received = result.deltas_received,
                    conflicts = result.conflicts,
                    "Sync completed"
                );
                self.emit(SyncEventKind::SyncCompleted {
                    result: result.clone(),
                });
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(error = %e, "Sync failed");
                } else {
                    error!(error = %e, "Sync failed");
                }
                self.emit(SyncEventKind::SyncError {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn run_cycle(&self, user_id: Option<&str>, result: &mut SyncResult) -> Result<()> {
        if let Err(e) = self.inner.queue.flush().await {
            warn!(error = %e, "Queue flush before sync failed");
        }
        for user in self.users_to_sync(user_id).await? {
            self.sync_user(&user, result).await?;
        }
        Ok(())
    }

    async fn users_to_sync(&self, user_id: Option<&str>) -> Result<Vec<UserId>> {
        if let Some(user) = user_id {
            return Ok(vec![user.to_string()]);
        }
        let mut users: Vec<UserId> = Vec::new();
        for item in self.inner.queue.get_pending_deltas(None).await? {
            if !users.contains(&item.user_id) {
                users.push(item.user_id);
            }
        }
        if let Some(default) = &self.inner.config.default_user_id {
            if !users.contains(default) {
                users.push(default.clone());
            }
        }
        Ok(users)
    }

    async fn sync_user(&self, user_id: &str, result: &mut SyncResult) -> Result<()> {
        let page_size = self.inner.queue.config().max_per_request;
        let mut cursor = None;
        // Items go out at most once per cycle. Later rounds only page.
        let mut sent: HashSet<QueueItemId> = HashSet::new();

        for round in 1..=self.inner.config.max_rounds_per_cycle {
            let items = self
                .inner
                .queue
                .claim_pending(Some(user_id), &sent)
                .await?;
            sent.extend(items.iter().map(|item| item.id.clone()));

            let request = SyncRequest {
                device_id: self.inner.device_id.clone(),
                user_id: user_id.to_string(),
                last_sync_timestamp: self
                    .inner
                    .last_sync
                    .lock()
                    .as_ref()
                    .map(|last| last.server_timestamp.clone()),
                deltas: items.iter().map(|item| item.delta.clone()).collect(),
                cursor: cursor.take(),
            };

            let response = match self.inner.transport.sync(&request).await {
                Ok(response) => response,
                Err(e) => {
                    self.fail_in_flight(&items, &e.to_string()).await;
                    return Err(e);
                }
            };

            result.deltas_sent += items.len();
            let has_more = response.has_more;
            let next_cursor = response.next_cursor.clone();
            let received = response.deltas.len();
            self.apply_response(user_id, &items, response, result).await?;

            self.emit(SyncEventKind::SyncProgress {
                user_id: user_id.to_string(),
                round,
                deltas_sent: items.len(),
                deltas_received: received,
            });

            let full_page = page_size > 0 && items.len() >= page_size;
            if !has_more && !full_page {
                break;
            }
            cursor = next_cursor;
        }
        Ok(())
    }

    async fn fail_in_flight(&self, items: &[SyncQueueItem], message: &str) {
        for item in items {
            if let Err(e) = self.inner.queue.mark_failed(&item.id, message).await {
                warn!(item_id = %item.id, error = %e, "Failed to record sync failure");
            }
        }
    }

    async fn apply_response(
        &self,
        user_id: &str,
        items: &[SyncQueueItem],
        response: SyncResponse,
        result: &mut SyncResult,
    ) -> Result<()> {
        let queue = &self.inner.queue;
        let by_delta: HashMap<&str, &SyncQueueItem> = items
            .iter()
            .map(|item| (item.delta.id.as_str(), item))
            .collect();
        let mut settled: HashSet<&str> = HashSet::new();

        for delta_id in &response.accepted_delta_ids {
            let Some(item) = by_delta.get(delta_id.as_str()).copied() else {
                debug!(delta_id = %delta_id, "Hub accepted a delta not in this request");
                continue;
            };
            settled.insert(item.delta.id.as_str());
            if !queue.mark_completed(&item.id, &item.delta.id).await? {
                continue;
            }
            self.emit(SyncEventKind::EntitySynced {
                entity_type: item.delta.entity_type,
                entity_id: item.delta.entity_id.clone(),
                delta_id: item.delta.id.clone(),
                direction: SyncDirection::Outgoing,
            });
        }

        for rejection in response.rejected_deltas {
            let Some(item) = by_delta.get(rejection.delta_id.as_str()).copied() else {
                continue;
            };
            if !settled.insert(item.delta.id.as_str()) {
                continue;
            }
            match rejection.conflict_with {
                Some(remote) => {
                    self.resolve(user_id, item, remote, rejection.reason, result)
                        .await?
                }
                None => {
                    warn!(
                        delta_id = %item.delta.id,
                        reason = %rejection.reason,
                        "Hub rejected delta"
                    );
                    queue.mark_failed(&item.id, &rejection.reason).await?;
                }
            }
        }

        for item in items {
            if !settled.contains(item.delta.id.as_str()) {
                queue.mark_failed(&item.id, "not acknowledged by hub").await?;
            }
        }

        for delta in &response.deltas {
            self.apply_remote(user_id, delta).await;
            result.deltas_received += 1;
        }

        self.inner.clock.receive(&response.server_timestamp);
        *self.inner.last_sync.lock() = Some(LastSync {
            server_timestamp: response.server_timestamp,
            synced_at: self.inner.wall.now_ms(),
        });
        self.persist_clock().await;
        self.persist_last_sync().await;
        Ok(())
    }

    async fn resolve(
        &self,
        user_id: &str,
        item: &SyncQueueItem,
        remote: SyncDelta,
        reason: String,
        result: &mut SyncResult,
    ) -> Result<()> {
        let record = resolve_conflict(
            uuid::Uuid::new_v4().to_string(),
            item.delta.clone(),
            remote,
            reason,
            self.inner.wall.now_ms(),
        );
        result.conflicts += 1;
        self.emit(SyncEventKind::ConflictDetected {
            conflict: record.clone(),
        });

        if record.remote_won() {
            self.apply_remote(user_id, &record.remote_delta).await;
            self.inner
                .queue
                .mark_superseded(&item.id, &item.delta.id, &record.remote_delta.id)
                .await?;
        } else {
            self.inner.queue.return_to_pending(&item.id).await?;
        }

        info!(
            conflict_id = %record.id,
            entity_type = %item.delta.entity_type,
            entity_id = %item.delta.entity_id,
            resolution = ?record.resolution,
            "Conflict resolved"
        );
        self.emit(SyncEventKind::ConflictResolved {
            conflict: record.clone(),
        });

        let mut conflicts = self.inner.conflicts.lock();
        conflicts.push_back(record);
        while conflicts.len() > self.inner.config.conflict_history {
            conflicts.pop_front();
        }
        Ok(())
    }

    async fn apply_remote(&self, user_id: &str, delta: &SyncDelta) {
        self.inner.clock.receive(&delta.hlc_timestamp);

        if !delta.verify_checksum() {
            warn!(delta_id = %delta.id, "Remote delta failed checksum, not applied");
            return;
        }
        if let Some(applier) = &self.inner.applier {
            if let Err(e) = applier.apply(user_id, delta).await {
                warn!(delta_id = %delta.id, error = %e, "Failed to apply remote delta");
            }
        }
        self.emit(SyncEventKind::EntitySynced {
            entity_type: delta.entity_type,
            entity_id: delta.entity_id.clone(),
            delta_id: delta.id.clone(),
            direction: SyncDirection::Incoming,
        });
    }

    /// Record a connectivity change. Coming online starts a sync cycle.
    pub fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if was_online == online {
            return;
        }
        info!(online, "Connectivity changed");
        self.emit(SyncEventKind::OnlineStatusChanged { online });

        if online {
            let service = self.clone();
            tokio::spawn(async move {
                service.perform_sync(None).await;
            });
        }
    }

    /// Sync on a fixed interval while online. No-op if already started.
    pub fn start_auto_sync(&self) {
        let mut auto_sync = self.inner.auto_sync.lock();
        if auto_sync.is_some() {
            return;
        }
        let weak: Weak<ServiceInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.sync_interval;

        *auto_sync = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let service = SyncService { inner };
                if service.is_online() {
                    service.perform_sync(None).await;
                }
            }
        }));
        info!(interval_secs = interval.as_secs(), "Auto-sync started");
    }

    pub fn stop_auto_sync(&self) {
        if let Some(task) = self.inner.auto_sync.lock().take() {
            task.abort();
            info!("Auto-sync stopped");
        }
    }

    /// User-facing status of one entity.
    pub async fn get_entity_sync_status(
        &self,
        user_id: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<SyncStatus> {
        let queue = &self.inner.queue;
        let mut statuses: Vec<QueueStatus> = queue
            .find_by_entity(Some(user_id), entity_type, entity_id)
            .await?
            .into_iter()
            .map(|item| item.status)
            .collect();
        if queue.has_buffered(user_id, entity_type, entity_id) {
            statuses.push(QueueStatus::Pending);
        }
        Ok(SyncStatus::summarize(statuses, self.is_online()))
    }

    /// Device-wide summary, including a fresh hub reachability probe.
    pub async fn get_overall_sync_status(
        &self,
        user_id: Option<&str>,
    ) -> Result<OverallSyncStatus> {
        let stats = self.inner.queue.get_stats(user_id).await?;
        let hub_reachable = self.inner.transport.health().await;
        Ok(OverallSyncStatus::from_stats(
            &stats,
            self.inner.queue.buffered_len(),
            self.is_online(),
            hub_reachable,
            self.is_syncing(),
            self.last_sync_at(),
        ))
    }

    /// Make failed items eligible for the next cycle right away.
    pub async fn retry_failed_items(&self, user_id: Option<&str>) -> Result<usize> {
        let reset = self.inner.queue.retry_failed_items(user_id).await?;
        if reset > 0 {
            info!(reset, "Failed items queued for retry");
        }
        Ok(reset)
    }
}
