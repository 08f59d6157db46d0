//! User-facing sync status.

use serde::{Deserialize, Serialize};
use tether_engine::{QueueStats, QueueStatus, Timestamp};

/// What a learner sees next to a piece of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Stored on this device only
    SavedHere,
    /// Queued and the hub is reachable
    WaitingToShare,
    /// Currently in flight
    SharingNow,
    /// Accepted by the hub
    SharedWithClass,
    /// Failed or given up on
    ProblemSharing,
}

impl SyncStatus {
    pub fn from_queue_status(status: QueueStatus, online: bool) -> Self {
        match status {
            QueueStatus::Pending if online => SyncStatus::WaitingToShare,
            QueueStatus::Pending => SyncStatus::SavedHere,
            QueueStatus::Syncing => SyncStatus::SharingNow,
            QueueStatus::Completed => SyncStatus::SharedWithClass,
            QueueStatus::Failed | QueueStatus::DeadLetter => SyncStatus::ProblemSharing,
        }
    }

    /// Combine the statuses of every queue item for one entity.
    ///
    /// The most pressing state wins. No items means the work only exists
    /// locally.
    pub fn summarize(statuses: impl IntoIterator<Item = QueueStatus>, online: bool) -> Self {
        statuses
            .into_iter()
            .map(|status| Self::from_queue_status(status, online))
            .max_by_key(|status| status.urgency())
            .unwrap_or(SyncStatus::SavedHere)
    }

    fn urgency(&self) -> u8 {
        match self {
            SyncStatus::SharedWithClass => 0,
            SyncStatus::SavedHere | SyncStatus::WaitingToShare => 1,
            SyncStatus::SharingNow => 2,
            SyncStatus::ProblemSharing => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::SavedHere => "saved_here",
            SyncStatus::WaitingToShare => "waiting_to_share",
            SyncStatus::SharingNow => "sharing_now",
            SyncStatus::SharedWithClass => "shared_with_class",
            SyncStatus::ProblemSharing => "problem_sharing",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device-wide sync summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallSyncStatus {
    pub status: SyncStatus,
    pub online: bool,
    pub hub_reachable: bool,
    pub is_syncing: bool,
    pub last_sync_at: Option<Timestamp>,
    pub pending: usize,
    pub failed: usize,
    pub dead_letter: usize,
}

impl OverallSyncStatus {
    /// `buffered` counts deltas not yet written to the queue.
    pub fn from_stats(
        stats: &QueueStats,
        buffered: usize,
        online: bool,
        hub_reachable: bool,
        is_syncing: bool,
        last_sync_at: Option<Timestamp>,
    ) -> Self {
        let pending = stats.pending + stats.syncing + buffered;
        let status = if stats.failed + stats.dead_letter > 0 {
            SyncStatus::ProblemSharing
        } else if is_syncing || stats.syncing > 0 {
            SyncStatus::SharingNow
        } else if pending > 0 && online && hub_reachable {
            SyncStatus::WaitingToShare
        } else if pending > 0 {
            SyncStatus::SavedHere
        } else if last_sync_at.is_some() {
            SyncStatus::SharedWithClass
        } else {
            SyncStatus::SavedHere
        };

        Self {
            status,
            online,
            hub_reachable,
            is_syncing,
            last_sync_at,
            pending,
            failed: stats.failed,
            dead_letter: stats.dead_letter,
        }
    }
}
