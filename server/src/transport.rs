use tokio::sync::mpsc;

use crate::model::EventPayload;

// ═══════════════════════════════════════════════════════════════════════════════
// ROUTING
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRoutingPolicy {
    Channel { channel_id: i64 },
    User { user_id: i64 },
}

// ═══════════════════════════════════════════════════════════════════════════════
// SUBSCRIBERS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum SubscriberMessage {
    Event(i64, EventPayload),
}

#[derive(Debug, Clone)]
pub struct Subscriber {
    user_id: i64,
    sender: mpsc::Sender<SubscriberMessage>,
}

impl Subscriber {
    pub fn new(user_id: i64, sender: mpsc::Sender<SubscriberMessage>) -> Self {
        Self { user_id, sender }
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn try_send(
        &self,
        message: SubscriberMessage,
    ) -> Result<(), mpsc::error::TrySendError<SubscriberMessage>> {
        self.sender.try_send(message)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// MESSAGES
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub enum ServerMessage {
    Subscribe(Subscriber),
    /// The id is the outbox row id. It is stable across redeliveries so
    /// consumers can drop duplicates.
    Control(i64, EventPayload, ControlRoutingPolicy),
}
