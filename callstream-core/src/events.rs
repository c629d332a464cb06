//! Lifecycle event fan-out.
//!
//! In-process pub/sub between the call engine and any number of supervisor
//! subscribers. Publication never blocks the engine: each subscriber gets a
//! bounded queue and `publish` only ever `try_send`s into it. A subscriber
//! that falls behind loses its subscription, not the event stream's order:
//! every surviving subscriber sees events in the order the bus accepted them.
//!
//! Events are not persisted and not replayed on reconnect.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::call::CallState;

/// Queue depth per subscriber. Overflowing it drops the subscriber.
pub const SUBSCRIBER_BUFFER: usize = 256;

/// Lifecycle events, serialized exactly as pushed to supervisors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    PacketReceived {
        call_id: String,
        sequence: u64,
        total_received: u64,
        missing_sequences: Vec<u64>,
    },
    StateChanged {
        call_id: String,
        from_state: CallState,
        to_state: CallState,
    },
    AiCompleted {
        call_id: String,
        transcription: String,
        sentiment: String,
    },
    AiFailed {
        call_id: String,
        reason: String,
    },
}

impl CallEvent {
    pub fn call_id(&self) -> &str {
        match self {
            CallEvent::PacketReceived { call_id, .. }
            | CallEvent::StateChanged { call_id, .. }
            | CallEvent::AiCompleted { call_id, .. }
            | CallEvent::AiFailed { call_id, .. } => call_id,
        }
    }
}

/// Receiving half of a subscription. Dropping it (or being dropped by the
/// bus on overflow) ends the stream.
pub struct Subscription {
    id: Uuid,
    receiver: mpsc::Receiver<CallEvent>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the bus has dropped this subscriber.
    pub async fn recv(&mut self) -> Option<CallEvent> {
        self.receiver.recv().await
    }
}

/// Event bus for publishing and subscribing to call lifecycle events.
pub struct EventBus {
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<CallEvent>>>,
    buffer: usize,
}

impl EventBus {
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subscriber. Events published after this call are delivered;
    /// there is no replay.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();
        self.subscribers.lock().insert(id, tx);
        debug!(subscriber = %id, "event subscriber registered");
        Subscription { id, receiver: rx }
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.lock().remove(&id).is_some() {
            debug!(subscriber = %id, "event subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver `event` to every live subscriber without blocking.
    ///
    /// The lock is held only for the `try_send` fan-out, which keeps a total
    /// acceptance order across concurrent publishers. A full or closed queue
    /// drops that subscriber; the event is never dropped for the others.
    pub fn publish(&self, event: CallEvent) {
        let mut subscribers = self.subscribers.lock();
        let mut dropped = Vec::new();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        subscriber = %id,
                        call_id = %event.call_id(),
                        "subscriber queue full, dropping subscriber"
                    );
                    dropped.push(*id);
                }
                Err(TrySendError::Closed(_)) => {
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            subscribers.remove(&id);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(SUBSCRIBER_BUFFER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_event(call_id: &str, sequence: u64) -> CallEvent {
        CallEvent::PacketReceived {
            call_id: call_id.to_string(),
            sequence,
            total_received: sequence + 1,
            missing_sequences: vec![],
        }
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();

        bus.publish(packet_event("c1", 0));
        bus.publish(packet_event("c1", 1));
        bus.publish(CallEvent::StateChanged {
            call_id: "c1".to_string(),
            from_state: CallState::InProgress,
            to_state: CallState::Completed,
        });

        assert_eq!(sub.recv().await.unwrap(), packet_event("c1", 0));
        assert_eq!(sub.recv().await.unwrap(), packet_event("c1", 1));
        assert!(matches!(
            sub.recv().await.unwrap(),
            CallEvent::StateChanged { .. }
        ));
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_not_the_event() {
        let bus = EventBus::new(2);
        let slow = bus.subscribe();
        let mut healthy = bus.subscribe();

        // The healthy subscriber keeps draining; the slow one never does.
        bus.publish(packet_event("c1", 0));
        bus.publish(packet_event("c1", 1));
        assert_eq!(healthy.recv().await.unwrap(), packet_event("c1", 0));
        assert_eq!(healthy.recv().await.unwrap(), packet_event("c1", 1));

        // This publish overflows the slow queue: subscriber dropped, event kept.
        bus.publish(packet_event("c1", 2));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(healthy.recv().await.unwrap(), packet_event("c1", 2));
        drop(slow);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_publish() {
        let bus = EventBus::default();
        let sub = bus.subscribe();
        drop(sub);
        bus.publish(packet_event("c1", 0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_ends_the_stream() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe();
        bus.unsubscribe(sub.id());
        assert!(sub.recv().await.is_none());
    }

    #[test]
    fn events_serialize_to_wire_schema() {
        let event = CallEvent::PacketReceived {
            call_id: "c-7".to_string(),
            sequence: 3,
            total_received: 4,
            missing_sequences: vec![1, 2],
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "event": "packet_received",
                "call_id": "c-7",
                "sequence": 3,
                "total_received": 4,
                "missing_sequences": [1, 2],
            })
        );

        let event = CallEvent::StateChanged {
            call_id: "c-7".to_string(),
            from_state: CallState::Completed,
            to_state: CallState::ProcessingAi,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            serde_json::json!({
                "event": "state_changed",
                "call_id": "c-7",
                "from_state": "COMPLETED",
                "to_state": "PROCESSING_AI",
            })
        );

        let event = CallEvent::AiFailed {
            call_id: "c-7".to_string(),
            reason: "analyzer unavailable".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap()["event"],
            serde_json::json!("ai_failed")
        );
    }
}
