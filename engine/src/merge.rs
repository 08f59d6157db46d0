//! Coalescing rules for deltas that target the same entity.
//!
//! Rapid edits to one entity collapse into a single queued delta instead of
//! one network write per edit. The rules, with "newer" decided by HLC order:
//!
//! | older  | newer  | result                                       |
//! |--------|--------|----------------------------------------------|
//! | update | update | update, shallow-merged payload, newer HLC    |
//! | create | update | create, shallow-merged payload, newer HLC    |
//! | any    | delete | the delete                                   |
//! | other  | other  | the newer delta unchanged                    |
//!
//! Merging is pure and idempotent, and its result does not depend on
//! argument order.

use crate::{error::Result, DeltaId, Error, Operation, Payload, SyncDelta};

/// Merge two deltas for the same entity.
pub fn merge_deltas(a: &SyncDelta, b: &SyncDelta) -> Result<SyncDelta> {
    if !a.same_entity(b) {
        return Err(Error::EntityMismatch {
            left: format!("{}/{}", a.entity_type, a.entity_id),
            right: format!("{}/{}", b.entity_type, b.entity_id),
        });
    }

    let (older, newer) = if a.hlc_timestamp <= b.hlc_timestamp {
        (a, b)
    } else {
        (b, a)
    };

    let (operation, payload) = match (older.operation, newer.operation) {
        (_, Operation::Delete) => (Operation::Delete, Payload::new()),
        (Operation::Update, Operation::Update) => {
            (Operation::Update, older.payload.merged_with(&newer.payload))
        }
        (Operation::Create, Operation::Update) => {
            (Operation::Create, older.payload.merged_with(&newer.payload))
        }
        _ => return Ok(newer.clone()),
    };

    let merged = SyncDelta::new(
        newer.id.clone(),
        newer.entity_type,
        newer.entity_id.clone(),
        operation,
        payload,
        newer.hlc_timestamp.clone(),
    )
    .with_depends_on(merged_dependencies(older, newer));

    Ok(merged)
}

// Order-preserving union, minus the merged deltas themselves.
fn merged_dependencies(older: &SyncDelta, newer: &SyncDelta) -> Vec<DeltaId> {
    let mut deps: Vec<DeltaId> = Vec::new();
    for id in older.depends_on.iter().chain(newer.depends_on.iter()) {
        if id != &older.id && id != &newer.id && !deps.contains(id) {
            deps.push(id.clone());
        }
    }
    deps
}
