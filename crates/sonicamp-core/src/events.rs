//! Event bus
//!
//! Typed publish/subscribe for everything the core reports outward:
//! disconnects, procedure lifecycle, interpreter errors, property changes
//! and status changes. Subscribers that fall behind lose the oldest events.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::protocol::Field;

/// Events emitted by the core
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Event {
    /// The communicator closed outside of a restart
    Disconnected,
    /// A procedure started
    ProcedureRunning { procedure: String },
    /// The running procedure finished or was cancelled
    ProcedureStopped,
    /// A script failed while running
    InterpretationError { message: String },
    /// An observable property changed
    PropertyChange {
        name: String,
        old: String,
        new: String,
    },
    /// Status fields changed
    StatusChanged { changed: Vec<Field> },
}

/// Cloneable handle to a broadcast channel of [`Event`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Bus keeping up to `capacity` events for slow subscribers
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: Event) {
        trace!(?event, "emit");
        let _ = self.sender.send(event);
    }

    /// Number of live receivers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
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

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(Event::ProcedureRunning {
            procedure: "ramp".to_string(),
        });
        bus.emit(Event::ProcedureStopped);
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::ProcedureRunning {
                procedure: "ramp".to_string()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), Event::ProcedureStopped);
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(Event::Disconnected);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json() {
        let json = serde_json::to_string(&Event::InterpretationError {
            message: "boom".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"event":"INTERPRETATION_ERROR","message":"boom"}"#);
    }
}
