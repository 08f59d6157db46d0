//! Last-write-wins conflict resolution.
//!
//! When the hub rejects a local delta because a different delta for the same
//! entity already exists, the two are compared by HLC and the greater one
//! wins. The outcome only depends on the two deltas, never on which side is
//! called "local", so every device reaches the same result.

use crate::{ConflictId, SyncDelta, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    /// Local delta won
    TookLocal,
    /// Remote delta won
    TookRemote,
    /// Payloads were combined
    Merged,
    /// A person picked the winner
    UserChoice,
}

/// A conflict between a local delta and the remote delta the hub cited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: ConflictId,
    pub local_delta: SyncDelta,
    pub remote_delta: SyncDelta,
    /// Reason given by the hub
    pub reason: String,
    pub detected_at: Timestamp,
    pub resolution: ConflictResolution,
    pub resolved_at: Option<Timestamp>,
}

impl ConflictRecord {
    /// Whether the remote delta must be applied locally.
    pub fn remote_won(&self) -> bool {
        self.resolution == ConflictResolution::TookRemote
    }

    /// The delta that won.
    pub fn winner(&self) -> &SyncDelta {
        match self.resolution {
            ConflictResolution::TookRemote => &self.remote_delta,
            _ => &self.local_delta,
        }
    }
}

/// Return whichever delta has the greater HLC.
///
/// Identical timestamps fall back to the delta id so the choice stays
/// independent of argument order.
pub fn lww_resolve<'a>(a: &'a SyncDelta, b: &'a SyncDelta) -> &'a SyncDelta {
    match a.hlc_timestamp.cmp(&b.hlc_timestamp) {
        Ordering::Greater => a,
        Ordering::Less => b,
        Ordering::Equal if a.id >= b.id => a,
        Ordering::Equal => b,
    }
}

/// Resolve a hub-reported conflict with last-write-wins.
pub fn resolve_conflict(
    id: impl Into<ConflictId>,
    local: SyncDelta,
    remote: SyncDelta,
    reason: impl Into<String>,
    now: Timestamp,
) -> ConflictRecord {
    // Mirrors lww_resolve(local, remote): local keeps ties on identical ids.
    let remote_wins = match remote.hlc_timestamp.cmp(&local.hlc_timestamp) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => remote.id > local.id,
    };
    let resolution = if remote_wins {
        ConflictResolution::TookRemote
    } else {
        ConflictResolution::TookLocal
    };

    ConflictRecord {
        id: id.into(),
        local_delta: local,
        remote_delta: remote,
        reason: reason.into(),
        detected_at: now,
        resolution,
        resolved_at: Some(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EntityType, HlcTimestamp, Operation, Payload};

    fn delta(id: &str, wall: u64, logical: u64, node: &str) -> SyncDelta {
        SyncDelta::new(
            id,
            EntityType::QuizAttempt,
            "quiz-1",
            Operation::Create,
            Payload::new().with("by", node),
            HlcTimestamp::new(wall, logical, node),
        )
    }

    #[test]
    fn greater_hlc_wins() {
        let older = delta("d-1", 1000, 0, "device-a");
        let newer = delta("d-2", 2000, 0, "device-b");
        assert_eq!(lww_resolve(&older, &newer).id, "d-2");
        assert_eq!(lww_resolve(&newer, &older).id, "d-2");
    }

    #[test]
    fn node_id_breaks_ties() {
        let a = delta("d-1", 1000, 3, "device-a");
        let b = delta("d-2", 1000, 3, "device-b");
        assert_eq!(lww_resolve(&a, &b).id, "d-2");
        assert_eq!(lww_resolve(&b, &a).id, "d-2");
    }

    #[test]
    fn identical_hlc_falls_back_to_id() {
        let a = delta("d-1", 1000, 3, "device-a");
        let b = delta("d-2", 1000, 3, "device-a");
        assert_eq!(lww_resolve(&a, &b).id, "d-2");
        assert_eq!(lww_resolve(&b, &a).id, "d-2");
    }

    #[test]
    fn remote_newer_takes_remote() {
        let local = delta("local", 1000, 0, "device-a");
        let remote = delta("remote", 1500, 0, "device-b");
        let record = resolve_conflict("c-1", local, remote, "conflict", 9000);

        assert_eq!(record.resolution, ConflictResolution::TookRemote);
        assert!(record.remote_won());
        assert_eq!(record.winner().id, "remote");
        assert_eq!(record.detected_at, 9000);
        assert_eq!(record.resolved_at, Some(9000));
    }

    #[test]
    fn local_newer_takes_local() {
        let local = delta("local", 3000, 0, "device-a");
        let remote = delta("remote", 1500, 0, "device-b");
        let record = resolve_conflict("c-1", local, remote, "conflict", 9000);

        assert_eq!(record.resolution, ConflictResolution::TookLocal);
        assert_eq!(record.winner().id, "local");
    }

    #[test]
    fn serialization_format() {
        let record = resolve_conflict(
            "c-1",
            delta("local", 1, 0, "a"),
            delta("remote", 2, 0, "b"),
            "stale",
            5,
        );
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""resolution":"took_remote""#));
        assert!(json.contains(r#""localDelta""#));
        assert!(json.contains(r#""resolvedAt":5"#));
    }

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_delta(id: &'static str) -> impl Strategy<Value = SyncDelta> {
            (0u64..5, 0u64..3, prop_oneof![Just("device-a"), Just("device-b")])
                .prop_map(move |(wall, logical, node)| delta(id, wall, logical, node))
        }

        proptest! {
            #[test]
            fn prop_lww_is_commutative(a in arb_delta("a"), b in arb_delta("b")) {
                let first = lww_resolve(&a, &b).id.clone();
                let second = lww_resolve(&b, &a).id.clone();
                prop_assert_eq!(first, second);
            }

            #[test]
            fn prop_lww_winner_has_greatest_hlc(a in arb_delta("a"), b in arb_delta("b")) {
                let winner = lww_resolve(&a, &b);
                prop_assert!(winner.hlc_timestamp >= a.hlc_timestamp);
                prop_assert!(winner.hlc_timestamp >= b.hlc_timestamp);
            }

            #[test]
            fn prop_resolution_matches_lww(a in arb_delta("local"), b in arb_delta("remote")) {
                let expected = lww_resolve(&a, &b).id.clone();
                let record = resolve_conflict("c", a, b, "conflict", 0);
                prop_assert_eq!(&record.winner().id, &expected);
            }
        }
    }
}
