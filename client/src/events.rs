//! Sync event stream.

use serde::Serialize;
use tether_engine::{ConflictRecord, DeltaId, EntityId, EntityType, Timestamp, UserId};
use tokio::sync::broadcast;

use crate::service::SyncResult;

/// Which way a delta travelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Outgoing,
    Incoming,
}

/// Event payloads, serialized as `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum SyncEventKind {
    SyncStarted {
        user_id: Option<UserId>,
    },
    SyncProgress {
        user_id: UserId,
        round: u32,
        deltas_sent: usize,
        deltas_received: usize,
    },
    SyncCompleted {
        result: SyncResult,
    },
    SyncError {
        message: String,
    },
    ConflictDetected {
        conflict: ConflictRecord,
    },
    ConflictResolved {
        conflict: ConflictRecord,
    },
    EntitySynced {
        entity_type: EntityType,
        entity_id: EntityId,
        delta_id: DeltaId,
        direction: SyncDirection,
    },
    OnlineStatusChanged {
        online: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEvent {
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub kind: SyncEventKind,
}

/// Fan-out of [`SyncEvent`]s to any number of subscribers.
///
/// Slow subscribers miss events rather than stalling sync.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, timestamp: Timestamp, kind: SyncEventKind) {
        // No subscribers is fine
        let _ = self.sender.send(SyncEvent { timestamp, kind });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = SyncEvent {
            timestamp: 42,
            kind: SyncEventKind::EntitySynced {
                entity_type: EntityType::QuizAttempt,
                entity_id: "quiz-1".into(),
                delta_id: "d-1".into(),
                direction: SyncDirection::Incoming,
            },
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "timestamp": 42,
                "type": "entity_synced",
                "data": {
                    "entityType": "quiz_attempt",
                    "entityId": "quiz-1",
                    "deltaId": "d-1",
                    "direction": "incoming"
                }
            })
        );
    }

    #[test]
    fn online_change_shape() {
        let event = SyncEvent {
            timestamp: 1,
            kind: SyncEventKind::OnlineStatusChanged { online: false },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "online_status_changed");
        assert_eq!(value["data"]["online"], false);
    }

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(7, SyncEventKind::SyncError {
            message: "hub down".into(),
        });

        for rx in [&mut first, &mut second] {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.timestamp, 7);
            assert!(matches!(event.kind, SyncEventKind::SyncError { .. }));
        }
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        EventBus::new(4).emit(1, SyncEventKind::SyncStarted { user_id: None });
    }
}
