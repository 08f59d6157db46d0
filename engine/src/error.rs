//! Error types for the Tether engine.

use crate::{DeltaId, EntityId};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("invalid delta: {0}")]
    InvalidDelta(String),

    #[error("cannot merge deltas for different entities: {left} and {right}")]
    EntityMismatch { left: EntityId, right: EntityId },

    #[error("payload type mismatch: expected {expected}, got {actual}")]
    PayloadTypeMismatch { expected: String, actual: String },

    // Lifecycle errors
    #[error("invalid transition for item {id}: {from} -> {to}")]
    InvalidTransition {
        id: DeltaId,
        from: String,
        to: String,
    },

    // State errors
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
