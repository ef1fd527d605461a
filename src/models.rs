use chrono::{DateTime, Utc};
use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Prefix shared by every conversation id the backend generates.
pub const CONVERSATION_PREFIX: &str = "conv_";

/// Prefix of locally generated ids for optimistic messages.
pub const TEMP_ID_PREFIX: &str = "temp_";

// Composite sort keys look like MSG#2024-05-01T10:00:00.000Z#<uuid>
static COMPOSITE_MESSAGE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^MSG#.*#([^#]+)$").expect("static regex"));

/// The signed-in user, as presented to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
    pub name: String,
}

impl Identity {
    pub fn new(user_id: &str, role: &str, name: &str) -> Self {
        Identity {
            user_id: user_id.to_string(),
            role: role.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineStatus {
    Online,
    Offline,
}

impl Default for OnlineStatus {
    fn default() -> Self {
        OnlineStatus::Offline
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub conversation_id: String,
    pub other_participant_id: String,
    pub display_name: String,
    pub last_message_text: Option<String>,
    pub last_message_timestamp: Option<DateTime<Utc>>,
    pub last_message_id: Option<String>,
    pub unread_count: u32,
    pub online_status: OnlineStatus,
    pub is_blocked: bool,
}

impl Conversation {
    /// A conversation the user is about to start; nothing has been sent yet.
    pub fn new_local(current_user_id: &str, other_participant_id: &str, display_name: Option<&str>) -> Self {
        Conversation {
            conversation_id: conversation_id_for(current_user_id, other_participant_id),
            other_participant_id: other_participant_id.to_string(),
            display_name: display_name
                .map(|n| n.to_string())
                .unwrap_or_else(|| other_participant_id.to_string()),
            last_message_text: None,
            last_message_timestamp: None,
            last_message_id: None,
            unread_count: 0,
            online_status: OnlineStatus::Offline,
            is_blocked: false,
        }
    }

    pub fn needs_display_name(&self) -> bool {
        is_placeholder_name(&self.display_name, &self.other_participant_id)
    }
}

/// What the view hands the synchronizer when the user picks a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRef {
    pub conversation_id: Option<String>,
    pub other_participant_id: String,
    pub display_name: Option<String>,
}

impl ConversationRef {
    pub fn with_participant(other_participant_id: &str) -> Self {
        ConversationRef {
            conversation_id: None,
            other_participant_id: other_participant_id.to_string(),
            display_name: None,
        }
    }
}

impl From<&Conversation> for ConversationRef {
    fn from(conversation: &Conversation) -> Self {
        ConversationRef {
            conversation_id: Some(conversation.conversation_id.clone()),
            other_participant_id: conversation.other_participant_id.clone(),
            display_name: Some(conversation.display_name.clone()),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    /// Legal single-step transitions of the message lifecycle.
    pub fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Sending, Delivered)
                | (Sending, Failed)
                | (Failed, Sending)
                // the server stored it even though our confirmation call failed
                | (Failed, Delivered)
                | (Delivered, Read)
        )
    }

    /// Walk forward along sending -> delivered -> read until `target` is
    /// reached. Returns the resulting status; illegal moves leave it unchanged.
    pub fn promote(self, target: MessageStatus) -> MessageStatus {
        if self == target {
            return self;
        }
        if self.can_transition_to(target) {
            return target;
        }
        if target == MessageStatus::Read && self.can_transition_to(MessageStatus::Delivered) {
            return MessageStatus::Delivered.promote(target);
        }
        debug!("Ignoring illegal status transition {:?} -> {:?}", self, target);
        self
    }

    pub fn from_wire(raw: &str) -> Option<MessageStatus> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sending" | "pending" => Some(MessageStatus::Sending),
            "sent" | "delivered" => Some(MessageStatus::Delivered),
            "read" | "seen" => Some(MessageStatus::Read),
            "failed" | "error" => Some(MessageStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub receiver_id: String,
    pub receiver_name: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    pub is_edited: bool,
}

impl Message {
    pub fn is_own(&self, current_user_id: &str) -> bool {
        same_user(&self.sender_id, current_user_id)
    }

    pub fn is_optimistic(&self) -> bool {
        self.message_id.starts_with(TEMP_ID_PREFIX)
    }

    pub fn canonical_id(&self) -> &str {
        canonical_message_id(&self.message_id)
    }

    /// Move the status forward; returns true when it changed.
    pub fn promote_status(&mut self, target: MessageStatus) -> bool {
        let next = self.status.promote(target);
        let changed = next != self.status;
        self.status = next;
        changed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedUser {
    pub blocked_user_id: String,
    pub blocked_user_name: String,
    pub blocked_at: DateTime<Utc>,
}

/// `conv_{min}_{max}` over the lexicographically sorted participant ids.
pub fn conversation_id_for(a: &str, b: &str) -> String {
    let (first, second) = if a <= b { (a, b) } else { (b, a) };
    format!("{}{}_{}", CONVERSATION_PREFIX, first, second)
}

/// Extract the trailing UUID from a `MSG#<timestamp>#<uuid>` sort key. Plain
/// ids are returned unchanged.
pub fn canonical_message_id(id: &str) -> &str {
    match COMPOSITE_MESSAGE_ID.captures(id).and_then(|c| c.get(1)) {
        Some(uuid) => uuid.as_str(),
        None => id,
    }
}

/// Display names the backend hands out before the directory lookup has run.
pub fn is_placeholder_name(name: &str, user_id: &str) -> bool {
    let name = name.trim();
    if name.is_empty() || name == user_id {
        return true;
    }
    let lower = name.to_ascii_lowercase();
    lower == "unknown"
        || lower == "unknown user"
        || lower == "user"
        || lower == "loading..."
        || lower.starts_with("user_")
        || lower.starts_with("user ")
}

/// Trim, lowercase, and fold confusable characters (o/0, i/l/|/1, `\`/`/`).
pub fn normalize_id(id: &str) -> String {
    id.trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'o' => '0',
            'i' | 'l' | '|' => '1',
            '\\' => '/',
            other => other,
        })
        .collect()
}

/// User ids compared the same way conversation ids are.
pub fn same_user(a: &str, b: &str) -> bool {
    normalize_id(a) == normalize_id(b)
}

/// The non-current-user half of a conversation id, in its original form.
pub fn derive_other_participant(conversation_id: &str, current_user_id: &str) -> Option<String> {
    let trimmed = conversation_id.trim();
    let body = if normalize_id(trimmed).starts_with(&normalize_id(CONVERSATION_PREFIX)) {
        trimmed.get(CONVERSATION_PREFIX.len()..).unwrap_or(trimmed)
    } else {
        trimmed
    };
    let mut parts = body.split('_');
    let (a, b) = (parts.next()?, parts.next()?);
    if parts.next().is_some() || a.is_empty() || b.is_empty() {
        return None;
    }
    if same_user(a, current_user_id) {
        Some(b.to_string())
    } else if same_user(b, current_user_id) {
        Some(a.to_string())
    } else {
        None
    }
}

pub fn new_temp_message_id() -> String {
    format!("{}{}", TEMP_ID_PREFIX, uuid::Uuid::new_v4())
}
