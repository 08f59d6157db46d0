//! Edge case and property tests for tether-engine
//!
//! These tests cover clock invariants, merge laws and boundary inputs.

use proptest::prelude::*;
use serde_json::json;
use std::cmp::Ordering;
use tether_engine::{
    compare, merge_deltas, DeltaBatch, EntityType, HlcTimestamp, HybridClock, Operation, Payload,
    QueueStatus, RetryPolicy, SyncDelta, SyncQueueItem,
};

fn delta(id: &str, op: Operation, payload: Payload, ts: HlcTimestamp) -> SyncDelta {
    SyncDelta::new(id, EntityType::Progress, "lesson-1", op, payload, ts)
}

// ============================================================================
// Clock Edge Cases
// ============================================================================

#[test]
fn clock_survives_wall_time_going_backwards() {
    let mut clock = HybridClock::new("device-1");
    let mut last = clock.now(1_000_000);
    for wall in [999_000, 500, 0, 1_000_000, 999_999] {
        let ts = clock.now(wall);
        assert!(ts > last);
        last = ts;
    }
    assert_eq!(last.wall_time, 1_000_000);
}

#[test]
fn receive_from_far_future_device() {
    // Remote device clock is a year ahead
    let mut clock = HybridClock::new("device-1");
    clock.now(1_000);
    let remote = HlcTimestamp::new(31_536_000_000, 7, "device-2");

    let ts = clock.receive(&remote, 2_000);
    assert!(ts > remote);

    // Local events keep ordering after the skewed remote
    let next = clock.now(3_000);
    assert!(next > ts);
    assert_eq!(next.wall_time, remote.wall_time);
}

#[test]
fn same_wall_time_same_counter_different_nodes() {
    let a = HlcTimestamp::new(1000, 1, "device-a");
    let b = HlcTimestamp::new(1000, 1, "device-b");
    assert_eq!(compare(&a, &b), Ordering::Less);
    assert_eq!(compare(&b, &a), Ordering::Greater);
}

#[test]
fn clock_state_survives_persistence_between_sessions() {
    let mut clock = HybridClock::new("device-1");
    let before = clock.now(5_000);
    let data = clock.serialize().unwrap();

    // Next session: wall clock reset to an earlier value
    let mut restored = HybridClock::deserialize(&data, "device-1");
    let after = restored.now(10);
    assert!(after > before);
}

#[test]
fn node_ids_with_special_characters() {
    let ids = ["device:1", "device/é", "", "🎉"];
    for id in ids {
        let mut clock = HybridClock::new(id);
        clock.now(42);
        let data = clock.serialize().unwrap();
        assert_eq!(HybridClock::deserialize(&data, id), clock);
    }
}

// ============================================================================
// Payload Edge Cases
// ============================================================================

#[test]
fn json_with_all_types() {
    let payload = Payload::from_value(json!({
        "string": "hello",
        "int": 42,
        "float": 1.5,
        "bool": true,
        "null": null,
        "array": [1, "two", {"three": 3}],
        "object": {"nested": {"deep": [true]}}
    }))
    .unwrap();

    let d = delta(
        "d-1",
        Operation::Create,
        payload,
        HlcTimestamp::new(1, 0, "device-1"),
    );
    let json = serde_json::to_string(&d).unwrap();
    let parsed: SyncDelta = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, d);
    assert!(parsed.verify_checksum());
}

#[test]
fn very_large_payload() {
    // 1MB string
    let long_string = "x".repeat(1024 * 1024);
    let d = delta(
        "d-1",
        Operation::Create,
        Payload::new().with("code", long_string),
        HlcTimestamp::new(1, 0, "device-1"),
    );
    assert!(d.payload_size > 1024 * 1024);
    assert!(d.verify_checksum());
}

#[test]
fn tampered_payload_fails_checksum() {
    let mut d = delta(
        "d-1",
        Operation::Update,
        Payload::new().with("score", 10),
        HlcTimestamp::new(1, 0, "device-1"),
    );
    d.payload = Payload::new().with("score", 100);
    assert!(!d.verify_checksum());
}

// ============================================================================
// Merge Edge Cases
// ============================================================================

#[test]
fn rapid_updates_same_entity_collapse_to_one() {
    let mut clock = HybridClock::new("device-1");
    let mut batch = DeltaBatch::new();

    for i in 0..100 {
        let d = delta(
            &format!("d-{i}"),
            Operation::Update,
            Payload::new().with("percent", i),
            clock.now(1_000),
        );
        batch.push("user-1", d);
    }

    assert_eq!(batch.len(), 1);
    let merged = &batch.entries()[0].delta;
    assert_eq!(merged.id, "d-99");
    assert_eq!(merged.payload.get("percent"), Some(&json!(99)));
    assert_eq!(merged.hlc_timestamp.logical, 99);
}

#[test]
fn create_update_delete_sequence_ends_as_delete() {
    let mut clock = HybridClock::new("device-1");
    let create = delta(
        "d-1",
        Operation::Create,
        Payload::new().with("a", 1),
        clock.now(1),
    );
    let update = delta(
        "d-2",
        Operation::Update,
        Payload::new().with("b", 2),
        clock.now(2),
    );
    let delete = delta("d-3", Operation::Delete, Payload::new(), clock.now(3));

    let step = merge_deltas(&create, &update).unwrap();
    assert_eq!(step.operation, Operation::Create);
    let end = merge_deltas(&step, &delete).unwrap();
    assert_eq!(end.operation, Operation::Delete);
    assert!(end.payload.is_empty());
    assert!(end.validate().is_ok());
}

#[test]
fn backoff_with_single_delay_entry() {
    let policy = RetryPolicy {
        max_retries: 3,
        retry_delays_ms: vec![250],
    };
    let mut item = SyncQueueItem::new(
        "item-1",
        "user-1",
        delta(
            "d-1",
            Operation::Update,
            Payload::new(),
            HlcTimestamp::new(1, 0, "device-1"),
        ),
        0,
    );

    assert_eq!(item.mark_failed("e", 100, &policy).unwrap(), QueueStatus::Failed);
    assert_eq!(item.next_retry_at, Some(350));
    assert_eq!(item.mark_failed("e", 400, &policy).unwrap(), QueueStatus::Failed);
    assert_eq!(item.next_retry_at, Some(650));
    assert_eq!(
        item.mark_failed("e", 700, &policy).unwrap(),
        QueueStatus::DeadLetter
    );
}

// ============================================================================
// Properties
// ============================================================================

fn arb_timestamp() -> impl Strategy<Value = HlcTimestamp> {
    (
        0u64..10,
        0u64..4,
        prop_oneof![Just("a"), Just("b"), Just("c")],
    )
        .prop_map(|(wall, logical, node)| HlcTimestamp::new(wall, logical, node))
}

fn arb_payload() -> impl Strategy<Value = Payload> {
    prop::collection::btree_map("[a-d]", 0i64..10, 0..4).prop_map(|fields| {
        fields
            .into_iter()
            .fold(Payload::new(), |p, (k, v)| p.with(k, v))
    })
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Create),
        Just(Operation::Update),
        Just(Operation::Delete)
    ]
}

proptest! {
    #[test]
    fn prop_now_is_strictly_monotonic(walls in prop::collection::vec(0u64..1_000, 1..64)) {
        let mut clock = HybridClock::new("device-1");
        let mut previous = clock.current();
        for wall in walls {
            let ts = clock.now(wall);
            prop_assert!((ts.wall_time, ts.logical) > (previous.wall_time, previous.logical));
            previous = ts;
        }
    }

    #[test]
    fn prop_receive_exceeds_local_and_remote(
        local_wall in 0u64..1_000,
        local_logical in 0u64..10,
        remote_wall in 0u64..1_000,
        remote_logical in 0u64..10,
        wall in 0u64..1_000,
    ) {
        let mut clock = HybridClock::with_state("device-1", local_wall, local_logical);
        let before = clock.current();
        let remote = HlcTimestamp::new(remote_wall, remote_logical, "device-2");

        let ts = clock.receive(&remote, wall);
        prop_assert!(compare(&ts, &before) == Ordering::Greater);
        prop_assert!(compare(&ts, &remote) == Ordering::Greater);
    }

    #[test]
    fn prop_compare_is_a_total_order(
        a in arb_timestamp(),
        b in arb_timestamp(),
        c in arb_timestamp(),
    ) {
        // Antisymmetry
        prop_assert_eq!(compare(&a, &b), compare(&b, &a).reverse());
        // Equal only when identical
        prop_assert_eq!(compare(&a, &b) == Ordering::Equal, a == b);
        // Transitivity
        if compare(&a, &b) != Ordering::Greater && compare(&b, &c) != Ordering::Greater {
            prop_assert!(compare(&a, &c) != Ordering::Greater);
        }
    }

    #[test]
    fn prop_serialize_roundtrip(wall in any::<u64>(), logical in any::<u64>()) {
        let clock = HybridClock::with_state("device-1", wall, logical);
        let data = clock.serialize().unwrap();

        let same = HybridClock::deserialize(&data, "device-1");
        prop_assert_eq!(same.current(), clock.current());

        let other = HybridClock::deserialize(&data, "device-2");
        prop_assert_eq!(other.current(), HlcTimestamp::zero("device-2"));
    }

    #[test]
    fn prop_merge_is_idempotent(
        op in arb_operation(),
        payload in arb_payload(),
        ts in arb_timestamp(),
    ) {
        let payload = if op == Operation::Delete { Payload::new() } else { payload };
        let d = delta("d-1", op, payload, ts);
        let merged = merge_deltas(&d, &d.clone()).unwrap();
        prop_assert_eq!(merged.operation, d.operation);
        prop_assert_eq!(&merged.payload, &d.payload);
        prop_assert_eq!(&merged.hlc_timestamp, &d.hlc_timestamp);
    }

    #[test]
    fn prop_merge_ignores_argument_order(
        op_a in arb_operation(),
        op_b in arb_operation(),
        payload_a in arb_payload(),
        payload_b in arb_payload(),
        ts_a in arb_timestamp(),
        ts_b in arb_timestamp(),
    ) {
        prop_assume!(ts_a != ts_b);
        let a = delta("d-a", op_a, payload_a, ts_a);
        let b = delta("d-b", op_b, payload_b, ts_b);
        prop_assert_eq!(merge_deltas(&a, &b).unwrap(), merge_deltas(&b, &a).unwrap());
    }
}
