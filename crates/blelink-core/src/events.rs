//! Session event system for status, log, and payload notifications.
//!
//! [`EventDispatcher`] is the default [`StatusSink`]: it turns every status
//! change, log line and payload into a [`SessionEvent`] on a broadcast
//! channel, so any number of front ends can render the session.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::broadcast;

use blelink_types::SessionState;

use crate::traits::{PayloadCallback, Status, StatusSink};

/// Events emitted while managing a session.
///
/// All events are serializable for logging, persistence, and IPC.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionEvent {
    /// The session entered a new state.
    StateChanged {
        state: SessionState,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A descriptive status without a state change.
    StatusText {
        text: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// One human-readable log line.
    Log {
        message: String,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    /// A raw notification payload.
    Payload {
        data: Vec<u8>,
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
}

impl SessionEvent {
    /// The session state carried by this event, if any.
    pub fn state(&self) -> Option<SessionState> {
        match self {
            SessionEvent::StateChanged { state, .. } => Some(*state),
            _ => None,
        }
    }
}

/// Sender for session events.
pub type EventSender = broadcast::Sender<SessionEvent>;

/// Receiver for session events.
pub type EventReceiver = broadcast::Receiver<SessionEvent>;

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SessionEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// A payload callback that republishes payloads as [`SessionEvent::Payload`].
    pub fn payload_callback(&self) -> PayloadCallback {
        let sender = self.sender.clone();
        std::sync::Arc::new(move |data: &[u8]| {
            let _ = sender.send(SessionEvent::Payload {
                data: data.to_vec(),
                at: OffsetDateTime::now_utc(),
            });
        })
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}

impl StatusSink for EventDispatcher {
    fn append(&self, message: &str) {
        self.send(SessionEvent::Log {
            message: message.to_string(),
            at: OffsetDateTime::now_utc(),
        });
    }

    fn set_status(&self, status: Status) {
        let at = OffsetDateTime::now_utc();
        match status {
            Status::State(state) => self.send(SessionEvent::StateChanged { state, at }),
            Status::Text(text) => self.send(SessionEvent::StatusText { text, at }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dispatcher_forwards_sink_calls() {
        let dispatcher = EventDispatcher::default();
        let mut rx = dispatcher.subscribe();

        dispatcher.set_status(Status::State(SessionState::Connecting));
        dispatcher.append("Connecting to Sensor");
        dispatcher.set_status(Status::Text("Scanning".into()));

        let first = rx.recv().await.unwrap();
        assert_eq!(first.state(), Some(SessionState::Connecting));
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::Log { message, .. } if message == "Connecting to Sensor"));
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::StatusText { text, .. } if text == "Scanning"));
    }

    #[tokio::test]
    async fn test_payload_callback_publishes() {
        let dispatcher = EventDispatcher::new(4);
        let mut rx = dispatcher.subscribe();
        let callback = dispatcher.payload_callback();

        callback(&[0x01, 0x02]);

        match rx.recv().await.unwrap() {
            SessionEvent::Payload { data, .. } => assert_eq!(data, vec![0x01, 0x02]),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_send_without_receivers_is_silent() {
        let dispatcher = EventDispatcher::new(4);
        assert_eq!(dispatcher.receiver_count(), 0);
        dispatcher.append("nobody listening");
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::StateChanged {
            state: SessionState::Connected,
            at: OffsetDateTime::UNIX_EPOCH,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"state_changed\""));
        assert!(json.contains("\"state\":\"connected\""));
        assert!(json.contains("1970-01-01T00:00:00Z"));

        let parsed: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }
}
