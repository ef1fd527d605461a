// Typed event bus for everything the gateway pushes at us.
// Inbound frames and connection changes share one ordered channel, so a
// subscriber sees them in the order they happened.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::models::MessageStatus;

/// A chat message as it arrived on the wire, after field-name normalization.
/// Routing fields are optional because backends are not consistent about
/// sending them.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub message_id: Option<String>,
    pub conversation_id: Option<String>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub receiver_id: Option<String>,
    pub receiver_name: Option<String>,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: Option<MessageStatus>,
    pub is_edited: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypingEvent {
    pub conversation_id: Option<String>,
    pub user_id: String,
    pub receiver_id: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeletionEvent {
    pub message_id: String,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EditEvent {
    pub message_id: String,
    pub conversation_id: Option<String>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadReceiptEvent {
    pub conversation_id: Option<String>,
    pub reader_id: Option<String>,
    /// Empty means "everything in the conversation".
    pub message_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockStatusEvent {
    pub blocker_id: Option<String>,
    pub blocked_id: String,
    pub blocked_name: Option<String>,
    pub is_blocked: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub user_id: String,
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { clean: bool },
    Reconnecting { attempt: u32, delay: Duration },
    ReconnectFailed { attempts: u32 },
}

/// Every normalized inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Message(MessageEvent),
    Typing(TypingEvent),
    Deleted(DeletionEvent),
    Edited(EditEvent),
    ReadReceipt(ReadReceiptEvent),
    BlockStatus(BlockStatusEvent),
    Presence(PresenceEvent),
}

/// What a `Subscription` yields: inbound frames plus connection changes.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Inbound(InboundEvent),
    Connection(ConnectionEvent),
}

#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<BusEvent>,
    connection: broadcast::Sender<ConnectionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        EventBus {
            events: broadcast::channel(capacity).0,
            connection: broadcast::channel(capacity).0,
        }
    }

    /// Queue an inbound event behind everything published before it.
    /// Returns the number of receivers that got it.
    pub fn publish(&self, event: InboundEvent) -> usize {
        match self.events.send(BusEvent::Inbound(event)) {
            Ok(count) => count,
            Err(_) => {
                debug!("No subscribers for inbound event");
                0
            }
        }
    }

    pub fn publish_connection(&self, event: ConnectionEvent) -> usize {
        let watchers = self.connection.send(event.clone()).unwrap_or(0);
        watchers + self.events.send(BusEvent::Connection(event)).unwrap_or(0)
    }

    /// Connection changes only.
    pub fn subscribe_connection(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection.subscribe()
    }

    /// Every event, in publish order.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            events: self.events.subscribe(),
        }
    }
}

pub struct Subscription {
    events: broadcast::Receiver<BusEvent>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone. A lagged receiver skips
    /// ahead rather than ending the subscription.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}
