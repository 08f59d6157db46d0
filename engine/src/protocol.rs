//! Wire types for the hub sync endpoint.
//!
//! One `POST /api/sync` round trip pushes local deltas and pulls remote ones.
//! All fields are camelCase JSON.

use crate::{DeltaId, HlcTimestamp, NodeId, SyncDelta, UserId};
use serde::{Deserialize, Serialize};

/// Request body for `POST /api/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    /// Sending device
    pub device_id: NodeId,
    /// User whose deltas are carried
    pub user_id: UserId,
    /// Server timestamp from the previous successful sync
    pub last_sync_timestamp: Option<HlcTimestamp>,
    /// Local deltas to push, oldest first
    pub deltas: Vec<SyncDelta>,
    /// Continuation cursor from a previous page
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// A local delta the hub refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedDelta {
    pub delta_id: DeltaId,
    pub reason: String,
    /// The remote delta that conflicts, when the rejection is a conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_with: Option<SyncDelta>,
}

/// Response body for `POST /api/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    /// Hub-side sequence number of this exchange
    pub server_sequence: u64,
    /// Hub clock at response time
    pub server_timestamp: HlcTimestamp,
    /// Remote deltas to apply locally, in order
    #[serde(default)]
    pub deltas: Vec<SyncDelta>,
    #[serde(default)]
    pub accepted_delta_ids: Vec<DeltaId>,
    #[serde(default)]
    pub rejected_deltas: Vec<RejectedDelta>,
    /// More remote deltas are waiting
    #[serde(default)]
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl SyncResponse {
    /// An empty response at the given hub time.
    pub fn empty(server_sequence: u64, server_timestamp: HlcTimestamp) -> Self {
        Self {
            server_sequence,
            server_timestamp,
            deltas: Vec::new(),
            accepted_delta_ids: Vec::new(),
            rejected_deltas: Vec::new(),
            has_more: false,
            next_cursor: None,
        }
    }
}
