//! Hybrid logical clock for causal ordering of deltas.
//!
//! A hybrid logical clock pairs a wall-clock reading with a logical counter.
//! Timestamps stay close to real time, yet every timestamp a node issues is
//! strictly greater than the previous one and strictly greater than any
//! remote timestamp it has received, even when device clocks are skewed.
//!
//! The clock never reads the system time itself: callers pass the current
//! wall time (milliseconds since the Unix epoch) into [`HybridClock::now`] and
//! [`HybridClock::receive`].

use crate::{error::Result, Error, NodeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A timestamp issued by a [`HybridClock`].
///
/// Ordering rules:
/// 1. Higher `wall_time` wins
/// 2. If equal, higher `logical` wins
/// 3. If both equal, lexicographically higher `node_id` wins
///
/// Two timestamps compare equal only when all three fields match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HlcTimestamp {
    /// Wall-clock component (milliseconds since epoch)
    pub wall_time: Timestamp,
    /// Logical counter within the same wall time
    pub logical: u64,
    /// Node that issued the timestamp
    pub node_id: NodeId,
}

impl HlcTimestamp {
    /// Create a timestamp from its parts.
    pub fn new(wall_time: Timestamp, logical: u64, node_id: impl Into<NodeId>) -> Self {
        Self {
            wall_time,
            logical,
            node_id: node_id.into(),
        }
    }

    /// The zero timestamp for a node.
    pub fn zero(node_id: impl Into<NodeId>) -> Self {
        Self::new(0, 0, node_id)
    }
}

impl Ord for HlcTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(self, other)
    }
}

impl PartialOrd for HlcTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Total order over timestamps: wall time, then logical counter, then node id.
pub fn compare(a: &HlcTimestamp, b: &HlcTimestamp) -> Ordering {
    a.wall_time
        .cmp(&b.wall_time)
        .then_with(|| a.logical.cmp(&b.logical))
        .then_with(|| a.node_id.cmp(&b.node_id))
}

/// A hybrid logical clock owned by one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HybridClock {
    node_id: NodeId,
    wall_time: Timestamp,
    logical: u64,
}

impl HybridClock {
    /// Create a new clock for a node, starting at `(0, 0)`.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            wall_time: 0,
            logical: 0,
        }
    }

    /// Create a clock with a specific state.
    pub fn with_state(node_id: impl Into<NodeId>, wall_time: Timestamp, logical: u64) -> Self {
        Self {
            node_id: node_id.into(),
            wall_time,
            logical,
        }
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// The last issued timestamp, without advancing the clock.
    pub fn current(&self) -> HlcTimestamp {
        HlcTimestamp::new(self.wall_time, self.logical, self.node_id.clone())
    }

    /// Issue a timestamp for a local event.
    ///
    /// Adopts `wall` when it is ahead of the stored wall time, otherwise
    /// increments the logical counter. Every call strictly advances the clock.
    pub fn now(&mut self, wall: Timestamp) -> HlcTimestamp {
        if wall > self.wall_time {
            self.wall_time = wall;
            self.logical = 0;
        } else {
            self.bump();
        }
        self.current()
    }

    /// Merge a remote timestamp into this clock.
    ///
    /// The result is strictly greater than both the clock's previous state and
    /// `remote`.
    pub fn receive(&mut self, remote: &HlcTimestamp, wall: Timestamp) -> HlcTimestamp {
        if wall > self.wall_time && wall > remote.wall_time {
            self.wall_time = wall;
            self.logical = 0;
        } else if self.wall_time == remote.wall_time {
            self.logical = self.logical.max(remote.logical);
            self.bump();
        } else if remote.wall_time > self.wall_time {
            self.wall_time = remote.wall_time;
            self.logical = remote.logical;
            self.bump();
        } else {
            self.bump();
        }
        self.current()
    }

    // An exhausted counter carries into the wall time so ordering stays strict.
    fn bump(&mut self) {
        match self.logical.checked_add(1) {
            Some(next) => self.logical = next,
            None => {
                self.wall_time = self.wall_time.saturating_add(1);
                self.logical = 0;
            }
        }
    }

    /// Serialize the clock state to JSON.
    pub fn serialize(&self) -> Result<String> {
        serde_json::to_string(&self.current()).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Restore a clock from [`HybridClock::serialize`] output.
    ///
    /// Returns a fresh clock at `(0, 0)` when the data cannot be parsed or
    /// was written by a different node.
    pub fn deserialize(data: &str, node_id: impl Into<NodeId>) -> Self {
        let node_id = node_id.into();
        match serde_json::from_str::<HlcTimestamp>(data) {
            Ok(state) if state.node_id == node_id => {
                Self::with_state(node_id, state.wall_time, state.logical)
            }
            _ => Self::new(node_id),
        }
    }
}
