//! Delta types for expressing changes.
//!
//! A [`SyncDelta`] is the unit of synchronization: one change to one entity,
//! stamped with a hybrid logical clock. Deltas are never edited in place; a
//! newer delta supersedes an older one.

use crate::{error::Result, DeltaId, EntityId, Error, HlcTimestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Kind of entity a delta targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Lesson and course progress records
    Progress,
    /// Quiz attempts and answers
    QuizAttempt,
    /// Exercise code submissions
    CodeSubmission,
    /// Learner settings
    Settings,
    /// Learner profile (display name, avatar reference)
    Profile,
}

impl EntityType {
    /// All entity types.
    pub const ALL: [EntityType; 5] = [
        EntityType::Progress,
        EntityType::QuizAttempt,
        EntityType::CodeSubmission,
        EntityType::Settings,
        EntityType::Profile,
    ];

    /// Wire name of the entity type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Progress => "progress",
            EntityType::QuizAttempt => "quiz_attempt",
            EntityType::CodeSubmission => "code_submission",
            EntityType::Settings => "settings",
            EntityType::Profile => "profile",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        EntityType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::InvalidDelta(format!("unknown entity type: {s}")))
    }
}

/// What a delta does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed payload shape for one entity type.
///
/// Producers implement this for their own structs; the sync core only ever
/// sees the encoded [`Payload`].
pub trait EntityPayload: Serialize + DeserializeOwned {
    /// The entity type this shape belongs to.
    const ENTITY_TYPE: EntityType;
}

/// Opaque JSON object carried by a delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Map<String, Value>);

impl Payload {
    /// Create an empty payload.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap an existing JSON object.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Build a payload from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::InvalidDelta(format!(
                "payload must be a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Encode a typed payload.
    pub fn encode<T: EntityPayload>(value: &T) -> Result<Self> {
        let value = serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode into a typed payload, checking the entity type matches.
    pub fn decode<T: EntityPayload>(&self, entity_type: EntityType) -> Result<T> {
        if entity_type != T::ENTITY_TYPE {
            return Err(Error::PayloadTypeMismatch {
                expected: T::ENTITY_TYPE.to_string(),
                actual: entity_type.to_string(),
            });
        }
        serde_json::from_value(Value::Object(self.0.clone()))
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Get a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Builder-style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Shallow merge: fields of `newer` overwrite fields of `self`.
    pub fn merged_with(&self, newer: &Payload) -> Payload {
        let mut merged = self.0.clone();
        for (key, value) in &newer.0 {
            merged.insert(key.clone(), value.clone());
        }
        Payload(merged)
    }

    /// JSON encoding with object keys sorted at every depth.
    pub fn canonical_json(&self) -> String {
        canonicalize(&Value::Object(self.0.clone())).to_string()
    }

    /// Lowercase hex SHA-256 of the canonical JSON.
    pub fn checksum(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_json().as_bytes()))
    }
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// One change to one entity.
///
/// Construct with [`SyncDelta::new`] so `checksum` and `payload_size` always
/// describe `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDelta {
    /// Stable unique delta ID
    pub id: DeltaId,
    /// Kind of entity targeted
    pub entity_type: EntityType,
    /// Entity targeted
    pub entity_id: EntityId,
    /// Create, update or delete
    pub operation: Operation,
    /// Opaque change data
    pub payload: Payload,
    /// When the change was made
    pub hlc_timestamp: HlcTimestamp,
    /// Deltas this one causally depends on
    #[serde(default)]
    pub depends_on: Vec<DeltaId>,
    /// SHA-256 of the canonical payload
    pub checksum: String,
    /// Byte length of the canonical payload
    pub payload_size: usize,
}

impl SyncDelta {
    /// Create a new delta.
    pub fn new(
        id: impl Into<DeltaId>,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        operation: Operation,
        payload: Payload,
        hlc_timestamp: HlcTimestamp,
    ) -> Self {
        let canonical = payload.canonical_json();
        Self {
            id: id.into(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            checksum: hex::encode(Sha256::digest(canonical.as_bytes())),
            payload_size: canonical.len(),
            payload,
            hlc_timestamp,
            depends_on: Vec::new(),
        }
    }

    /// Set the causal dependencies.
    pub fn with_depends_on(mut self, depends_on: Vec<DeltaId>) -> Self {
        self.depends_on = depends_on;
        self
    }

    /// Basic shape checks applied before a delta is queued.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidDelta("empty delta id".into()));
        }
        if self.entity_id.trim().is_empty() {
            return Err(Error::InvalidDelta(format!(
                "empty entity id on delta {}",
                self.id
            )));
        }
        if self.operation == Operation::Delete && !self.payload.is_empty() {
            return Err(Error::InvalidDelta(format!(
                "delete delta {} carries payload fields",
                self.id
            )));
        }
        Ok(())
    }

    /// Check `checksum` against the payload.
    pub fn verify_checksum(&self) -> bool {
        self.payload.checksum() == self.checksum
    }

    /// Check whether both deltas target the same entity.
    pub fn same_entity(&self, other: &SyncDelta) -> bool {
        self.entity_type == other.entity_type && self.entity_id == other.entity_id
    }

    /// Decode the payload into its typed shape.
    pub fn decode_payload<T: EntityPayload>(&self) -> Result<T> {
        self.payload.decode(self.entity_type)
    }
}
