//! # tether-client
//!
//! Offline-first sync service built on `tether-engine`.
//!
//! Local changes become [`SyncDelta`](tether_engine::SyncDelta)s through
//! [`SyncService::create_delta`]. They wait in a durable [`SyncQueue`]
//! until a sync cycle sends them to the hub, and incoming deltas are handed
//! to a [`RemoteApplier`]. Everything works offline; the hub is only needed
//! to share.
//!
//! ```no_run
//! use tether_client::{Config, SyncService};
//! use tether_engine::{EntityType, Operation, Payload};
//!
//! # async fn run() -> tether_client::Result<()> {
//! let config = Config::from_env()?;
//! let service = SyncService::connect(&config).await?.online(true).build();
//! service.initialize().await?;
//!
//! service
//!     .create_delta(
//!         "user-1",
//!         EntityType::Progress,
//!         "lesson-3",
//!         Operation::Update,
//!         Payload::new().with("percent", 80),
//!     )
//!     .await?;
//!
//! let result = service.perform_sync(None).await;
//! println!("sent {} deltas", result.deltas_sent);
//! service.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod events;
pub mod queue;
pub mod service;
pub mod status;
pub mod storage;
pub mod time;
pub mod transport;

pub use clock::ClockHandle;
pub use config::{Config, ConfigError, SyncConfig};
pub use error::{Error, Result};
pub use events::{EventBus, SyncDirection, SyncEvent, SyncEventKind};
pub use queue::{QueueConfig, SyncQueue};
pub use service::{RemoteApplier, SkipReason, SyncResult, SyncService, SyncServiceBuilder};
pub use status::{OverallSyncStatus, SyncStatus};
pub use storage::{KeyValueStore, MemoryStore, QueueStore, SqliteStore};
pub use time::{ManualClock, SystemClock, WallClock};
pub use transport::{DeviceIdentity, HttpTransport, IdentityProvider, Transport};
