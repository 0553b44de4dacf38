use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// A log line or status delta pushed to every admin WebSocket subscriber
/// (`WS /api/events`, spec §6).
///
/// Single-producer, multi-consumer: the bus itself is a thin wrapper over
/// `tokio::sync::broadcast`, whose channel semantics already give us the
/// overflow behaviour spec §5 asks for — a slow subscriber that falls behind
/// the channel capacity has its oldest unread events dropped
/// (`RecvError::Lagged`) rather than blocking the producer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEvent {
    pub id: String,
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl ServerEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: kind.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.tx.subscribe()
    }

    /// Emit a server log line. Ignores the "no subscribers" error: the bus
    /// has no durable backlog, so an event nobody is listening for is simply
    /// gone, which is the intended behaviour for a live tail.
    pub fn log(&self, kind: impl Into<String>, payload: Value) {
        let _ = self.tx.send(ServerEvent::new(kind, payload));
    }
}

/// Capability struct passed into the supervisor and the NIP-46 service so
/// neither has to hold a pointer to the other (spec §9, "cyclic references").
/// Both the event bus and the signer handle are already `Clone`+`Send`+`Sync`
/// so this is cheap to pass around by value.
#[derive(Clone)]
pub struct ServerCapabilities {
    pub bus: EventBus,
}

impl ServerCapabilities {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn log(&self, kind: impl Into<String>, payload: Value) {
        self.bus.log(kind, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lagging_subscriber_drops_oldest_without_blocking_producer() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        bus.log("a", json!({}));
        bus.log("b", json!({}));
        bus.log("c", json!({})); // rx has not read yet; capacity 2 means "a" is dropped

        let first = rx.try_recv();
        assert!(matches!(first, Err(broadcast::error::TryRecvError::Lagged(_))));
    }

    #[test]
    fn log_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(4);
        bus.log("nobody-listening", json!({"x": 1}));
    }
}
