//! Queue items, their lifecycle, and the retry policy.
//!
//! ```text
//! pending ──> syncing ──> completed
//!    ^           │
//!    │           v
//!    └─────── failed ──(retry budget spent)──> dead_letter
//! ```
//!
//! `syncing` items found after a restart go back to `pending`. `dead_letter`
//! is terminal until an operator resubmits or prunes the item.

use crate::{error::Result, Error, QueueItemId, SyncDelta, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a queued delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Syncing,
    Completed,
    Failed,
    DeadLetter,
}

impl QueueStatus {
    pub const ALL: [QueueStatus; 5] = [
        QueueStatus::Pending,
        QueueStatus::Syncing,
        QueueStatus::Completed,
        QueueStatus::Failed,
        QueueStatus::DeadLetter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Syncing => "syncing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::DeadLetter => "dead_letter",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        QueueStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Serialization(format!("unknown queue status: {s}")))
    }
}

/// Retry budget and backoff table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Failures after which an item is dead-lettered
    pub max_retries: u32,
    /// Delay before retry N (1-based) is `retry_delays_ms[min(N-1, len-1)]`
    pub retry_delays_ms: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delays_ms: vec![1_000, 5_000, 15_000, 60_000, 300_000],
        }
    }
}

impl RetryPolicy {
    /// Backoff delay after the given number of failed attempts.
    pub fn delay_for(&self, attempts: u32) -> u64 {
        let Some(last) = self.retry_delays_ms.len().checked_sub(1) else {
            return 0;
        };
        let index = (attempts.saturating_sub(1) as usize).min(last);
        self.retry_delays_ms[index]
    }
}

/// A delta waiting in the retry queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQueueItem {
    pub id: QueueItemId,
    pub user_id: UserId,
    pub delta: SyncDelta,
    pub status: QueueStatus,
    pub created_at: Timestamp,
    pub attempts: u32,
    pub last_attempt_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<Timestamp>,
}

impl SyncQueueItem {
    /// Create a new pending item.
    pub fn new(
        id: impl Into<QueueItemId>,
        user_id: impl Into<UserId>,
        delta: SyncDelta,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            delta,
            status: QueueStatus::Pending,
            created_at,
            attempts: 0,
            last_attempt_at: None,
            error_message: None,
            next_retry_at: None,
        }
    }

    /// Whether the item should be sent in a sync cycle starting at `now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        matches!(self.status, QueueStatus::Pending | QueueStatus::Failed)
            && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Whether the item can still be merged with newer local edits.
    pub fn is_mergeable(&self) -> bool {
        matches!(self.status, QueueStatus::Pending | QueueStatus::Failed)
    }

    pub fn mark_syncing(&mut self, now: Timestamp) -> Result<()> {
        self.expect_status(&[QueueStatus::Pending, QueueStatus::Failed], QueueStatus::Syncing)?;
        self.status = QueueStatus::Syncing;
        self.last_attempt_at = Some(now);
        Ok(())
    }

    pub fn mark_completed(&mut self) -> Result<()> {
        self.expect_status(
            &[
                QueueStatus::Pending,
                QueueStatus::Syncing,
                QueueStatus::Failed,
                QueueStatus::Completed,
            ],
            QueueStatus::Completed,
        )?;
        self.status = QueueStatus::Completed;
        self.next_retry_at = None;
        Ok(())
    }

    /// Record a failed attempt and schedule the next retry.
    ///
    /// Returns the resulting status: `Failed`, or `DeadLetter` once
    /// `attempts` reaches the policy's `max_retries`.
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        now: Timestamp,
        policy: &RetryPolicy,
    ) -> Result<QueueStatus> {
        self.expect_status(
            &[
                QueueStatus::Pending,
                QueueStatus::Syncing,
                QueueStatus::Failed,
            ],
            QueueStatus::Failed,
        )?;
        self.attempts = self.attempts.saturating_add(1);
        self.last_attempt_at = Some(now);
        self.error_message = Some(error.into());

        if self.attempts >= policy.max_retries {
            self.status = QueueStatus::DeadLetter;
            self.next_retry_at = None;
        } else {
            self.status = QueueStatus::Failed;
            self.next_retry_at = Some(now.saturating_add(policy.delay_for(self.attempts)));
        }
        Ok(self.status)
    }

    /// Put an in-flight item back without counting an attempt.
    pub fn return_to_pending(&mut self) -> Result<()> {
        self.expect_status(&[QueueStatus::Syncing, QueueStatus::Pending], QueueStatus::Pending)?;
        self.status = QueueStatus::Pending;
        Ok(())
    }

    /// Make a failed item immediately eligible again.
    ///
    /// Returns `false` if the item was not `failed`.
    pub fn reset_for_retry(&mut self) -> bool {
        if self.status != QueueStatus::Failed {
            return false;
        }
        self.status = QueueStatus::Pending;
        self.next_retry_at = None;
        true
    }

    /// Give a dead-lettered item a fresh retry budget.
    pub fn resubmit(&mut self) -> Result<()> {
        self.expect_status(&[QueueStatus::DeadLetter], QueueStatus::Pending)?;
        self.status = QueueStatus::Pending;
        self.attempts = 0;
        self.last_attempt_at = None;
        self.error_message = None;
        self.next_retry_at = None;
        Ok(())
    }

    /// Reset an item left `syncing` by an interrupted cycle.
    ///
    /// Returns `true` if the item was recovered.
    pub fn recover(&mut self) -> bool {
        if self.status != QueueStatus::Syncing {
            return false;
        }
        self.status = QueueStatus::Pending;
        true
    }

    fn expect_status(&self, allowed: &[QueueStatus], to: QueueStatus) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Item counts per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: usize,
    pub syncing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_letter: usize,
    pub total: usize,
    pub oldest_pending_at: Option<Timestamp>,
}

impl QueueStats {
    /// Tally a set of items.
    pub fn from_items<'a>(items: impl IntoIterator<Item = &'a SyncQueueItem>) -> Self {
        let mut stats = Self::default();
        for item in items {
            stats.total += 1;
            match item.status {
                QueueStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_at = Some(
                        stats
                            .oldest_pending_at
                            .map_or(item.created_at, |t| t.min(item.created_at)),
                    );
                }
                QueueStatus::Syncing => stats.syncing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
                QueueStatus::DeadLetter => stats.dead_letter += 1,
            }
        }
        stats
    }
}
