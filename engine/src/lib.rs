//! # Tether Engine
//!
//! Deterministic core of the Tether offline-first sync service.
//!
//! This crate holds the logic that must behave identically on every device:
//! hybrid logical clock ordering, delta coalescing, the queue item lifecycle
//! with its retry policy, and last-write-wins conflict resolution. The async
//! service that persists queues and talks to the hub lives in `tether-client`.
//!
//! ## Design Principles
//!
//! - **No IO**: Engine has no knowledge of files, network, or wall clocks
//! - **Deterministic**: Same inputs always produce same outputs
//! - **Testable**: Pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Hybrid Logical Clock
//!
//! [`HybridClock`] issues [`HlcTimestamp`]s that are strictly monotonic per
//! node and causally consistent across nodes with skewed clocks. Timestamps
//! are totally ordered by wall time, logical counter, then node id.
//!
//! ### Deltas
//!
//! A [`SyncDelta`] is an immutable change to one entity: a [`Operation`]
//! (create, update or delete) with an opaque [`Payload`] keyed by
//! [`EntityType`]. Producers with typed payloads implement [`EntityPayload`].
//!
//! ### Merging
//!
//! [`merge_deltas`] collapses two deltas for the same entity into one.
//! [`DeltaBatch`] applies it while buffering a debounce window.
//!
//! ### Queue lifecycle
//!
//! [`SyncQueueItem`] moves through [`QueueStatus`]; failures are scheduled
//! by a [`RetryPolicy`] backoff table and end in `dead_letter`.
//!
//! ### Conflicts
//!
//! [`resolve_conflict`] settles a hub-reported conflict with
//! [`lww_resolve`] and returns a [`ConflictRecord`].
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{
//!     merge_deltas, EntityType, HybridClock, Operation, Payload, SyncDelta,
//! };
//!
//! let mut clock = HybridClock::new("device-1");
//!
//! let first = SyncDelta::new(
//!     "delta-1",
//!     EntityType::Progress,
//!     "lesson-42",
//!     Operation::Update,
//!     Payload::new().with("percent", 40),
//!     clock.now(1_706_745_600_000),
//! );
//! let second = SyncDelta::new(
//!     "delta-2",
//!     EntityType::Progress,
//!     "lesson-42",
//!     Operation::Update,
//!     Payload::new().with("completed", false),
//!     clock.now(1_706_745_600_000),
//! );
//! assert!(second.hlc_timestamp > first.hlc_timestamp);
//!
//! let merged = merge_deltas(&first, &second).unwrap();
//! assert_eq!(merged.payload.len(), 2);
//! assert_eq!(merged.hlc_timestamp, second.hlc_timestamp);
//! ```

pub mod batch;
pub mod clock;
pub mod delta;
pub mod error;
pub mod merge;
pub mod protocol;
pub mod queue;
pub mod reconcile;

// Re-export main types at crate root
pub use batch::{BatchEntry, DeltaBatch};
pub use clock::{compare, HlcTimestamp, HybridClock};
pub use delta::{EntityPayload, EntityType, Operation, Payload, SyncDelta};
pub use error::Error;
pub use merge::merge_deltas;
pub use protocol::{RejectedDelta, SyncRequest, SyncResponse};
pub use queue::{QueueStats, QueueStatus, RetryPolicy, SyncQueueItem};
pub use reconcile::{lww_resolve, resolve_conflict, ConflictRecord, ConflictResolution};

/// Type aliases for clarity
pub type NodeId = String;
pub type UserId = String;
pub type EntityId = String;
pub type DeltaId = String;
pub type QueueItemId = String;
pub type ConflictId = String;
/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;
