//! Status and control event bus.
//!
//! The engine is the only component allowed to mutate session status; every
//! transition is announced here. Observers hold nothing but a subscription
//! they release on cancel, which keeps the observer↔engine dependency
//! one-directional.

use tokio::sync::broadcast;

use super::journal::SessionStatus;
use super::stream::ServerFrame;

/// An event published by the engine for a single session.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// The session's runtime status changed.
    Status {
        session_id: String,
        status: SessionStatus,
    },
    /// A server control frame addressed to the session's observers
    /// (title updates, advisory markers).
    Control {
        session_id: String,
        frame: ServerFrame,
    },
}

impl BusEvent {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Status { session_id, .. } | Self::Control { session_id, .. } => session_id,
        }
    }
}

/// Broadcast channel all observers subscribe to. Cloneable; clones share the
/// same channel.
#[derive(Clone)]
pub struct StatusBus {
    tx: broadcast::Sender<BusEvent>,
}

impl StatusBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    /// Announce a status transition. Lossy when no observer is subscribed.
    pub fn emit_status(&self, session_id: &str, status: SessionStatus) {
        let _ = self.tx.send(BusEvent::Status {
            session_id: session_id.to_string(),
            status,
        });
    }

    /// Deliver a control frame to the session's live observers.
    pub fn emit_control(&self, session_id: &str, frame: ServerFrame) {
        let _ = self.tx.send(BusEvent::Control {
            session_id: session_id.to_string(),
            frame,
        });
    }
}

impl Default for StatusBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_events_reach_subscribers() {
        let bus = StatusBus::new();
        let mut rx = bus.subscribe();

        bus.emit_status("s1", SessionStatus::Busy);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.session_id(), "s1");
        assert!(matches!(
            event,
            BusEvent::Status { status: SessionStatus::Busy, .. }
        ));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers_is_lossy_not_fatal() {
        let bus = StatusBus::new();
        bus.emit_status("s1", SessionStatus::Idle);
        bus.emit_control("s1", ServerFrame::ContextCleared);
    }
}
