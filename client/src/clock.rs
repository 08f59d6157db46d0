//! Shared device clock with persistence.

use std::sync::Arc;

use parking_lot::Mutex;
use tether_engine::{HlcTimestamp, HybridClock, NodeId};

use crate::error::Result;
use crate::storage::{KeyValueStore, CLOCK_KEY};
use crate::time::WallClock;

/// The device's hybrid logical clock, fed by a wall-clock source.
///
/// All readings go through one lock so concurrent callers still receive
/// strictly increasing timestamps.
#[derive(Debug)]
pub struct ClockHandle {
    clock: Mutex<HybridClock>,
    wall: Arc<dyn WallClock>,
}

impl ClockHandle {
    pub fn new(node_id: impl Into<NodeId>, wall: Arc<dyn WallClock>) -> Self {
        Self {
            clock: Mutex::new(HybridClock::new(node_id)),
            wall,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.clock.lock().node_id().clone()
    }

    /// Timestamp a local event.
    pub fn now(&self) -> HlcTimestamp {
        let wall = self.wall.now_ms();
        self.clock.lock().now(wall)
    }

    /// Fold in a timestamp observed from another node.
    pub fn receive(&self, remote: &HlcTimestamp) -> HlcTimestamp {
        let wall = self.wall.now_ms();
        self.clock.lock().receive(remote, wall)
    }

    pub fn current(&self) -> HlcTimestamp {
        self.clock.lock().current()
    }

    /// Restore state saved by [`persist`](Self::persist).
    ///
    /// Unreadable or foreign state leaves a fresh clock behind. The restored
    /// state never moves the clock backwards.
    pub async fn load(&self, store: &dyn KeyValueStore) -> Result<()> {
        let Some(bytes) = store.get(CLOCK_KEY).await? else {
            return Ok(());
        };
        let data = String::from_utf8_lossy(&bytes);
        let node_id = self.node_id();
        let restored = HybridClock::deserialize(&data, node_id);
        let mut clock = self.clock.lock();
        if restored.current() > clock.current() {
            *clock = restored;
        }
        Ok(())
    }

    pub async fn persist(&self, store: &dyn KeyValueStore) -> Result<()> {
        let data = self.clock.lock().serialize()?;
        store.set(CLOCK_KEY, data.as_bytes()).await
    }
}
