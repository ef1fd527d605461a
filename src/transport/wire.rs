// Field-name normalization for backend payloads.
// The chat backend is not consistent about field names (`text` vs
// `messageText` vs `message`, `senderId` vs `sender_id` vs `from`, ...).
// Everything past this module sees only the canonical types.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::HashMap;

use crate::models::{
    conversation_id_for, derive_other_participant, same_user, BlockedUser, Conversation, Message,
    MessageStatus, OnlineStatus,
};
use crate::transport::events::MessageEvent;

/// Sort key the backend uses for the per-conversation metadata record.
pub const METADATA_SORT_KEY: &str = "METADATA";

const MESSAGE_ID_FIELDS: &[&str] = &["messageId", "message_id", "id", "SK", "sk", "sortKey"];
const CONVERSATION_ID_FIELDS: &[&str] = &["conversationId", "conversation_id", "chatId", "conversation"];
const SENDER_ID_FIELDS: &[&str] = &["senderId", "sender_id", "from", "fromUserId"];
const SENDER_NAME_FIELDS: &[&str] = &["senderName", "sender_name", "fromName"];
const RECEIVER_ID_FIELDS: &[&str] = &["receiverId", "receiver_id", "recipientId", "to", "toUserId"];
const RECEIVER_NAME_FIELDS: &[&str] = &["receiverName", "receiver_name", "recipientName", "toName"];
const TEXT_FIELDS: &[&str] = &["text", "messageText", "message", "content", "body"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "createdAt", "created_at", "sentAt", "time"];
const SORT_KEY_FIELDS: &[&str] = &["SK", "sk", "sortKey"];

/// Look a field up in each source in turn, trying every alias.
pub fn field<'a>(sources: &[&'a Value], names: &[&str]) -> Option<&'a Value> {
    sources.iter().find_map(|source| {
        names
            .iter()
            .find_map(|name| source.get(*name).filter(|v| !v.is_null()))
    })
}

/// String-ish field: strings are trimmed, numbers are stringified, empty
/// strings count as absent.
pub fn str_field(sources: &[&Value], names: &[&str]) -> Option<String> {
    let value = field(sources, names)?;
    let s = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

pub fn bool_field(sources: &[&Value], names: &[&str]) -> Option<bool> {
    match field(sources, names)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "online" => Some(true),
            "false" | "no" | "0" | "offline" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        _ => None,
    }
}

/// ISO-8601 strings or epoch numbers (seconds or milliseconds).
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.with_timezone(&Utc));
            }
            // Some records carry a naive timestamp without an offset
            if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(Utc.from_utc_datetime(&naive));
            }
            s.parse::<i64>().ok().and_then(epoch_to_datetime)
        }
        Value::Number(n) => n.as_i64().and_then(epoch_to_datetime),
        _ => None,
    }
}

fn epoch_to_datetime(n: i64) -> Option<DateTime<Utc>> {
    if n > 1_000_000_000_000 {
        Utc.timestamp_millis_opt(n).single()
    } else {
        Utc.timestamp_opt(n, 0).single()
    }
}

pub fn timestamp_field(sources: &[&Value], names: &[&str]) -> Option<DateTime<Utc>> {
    field(sources, names).and_then(parse_timestamp)
}

/// Records whose sort key is the metadata marker are not messages.
pub fn is_metadata_record(value: &Value) -> bool {
    str_field(&[value], SORT_KEY_FIELDS).as_deref() == Some(METADATA_SORT_KEY)
}

/// `data` / `payload` envelope if present, falling back to the frame itself.
pub fn payload_sources(frame: &Value) -> Vec<&Value> {
    let mut sources = Vec::with_capacity(3);
    for key in ["data", "payload"] {
        if let Some(inner) = frame.get(key).filter(|v| v.is_object()) {
            sources.push(inner);
            // a nested message object, e.g. {"data": {"message": {...}}}
            if let Some(nested) = inner.get("message").filter(|v| v.is_object()) {
                sources.insert(0, nested);
            }
        }
    }
    if let Some(nested) = frame.get("message").filter(|v| v.is_object()) {
        sources.push(nested);
    }
    sources.push(frame);
    sources
}

/// Normalize a message-shaped payload. Returns `None` when there is no text;
/// empty-text records are metadata, not messages.
pub fn message_event_from_sources(sources: &[&Value]) -> Option<MessageEvent> {
    let text = field(sources, TEXT_FIELDS)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.trim().is_empty())?;

    let status = str_field(sources, &["status", "deliveryStatus"])
        .and_then(|s| MessageStatus::from_wire(&s))
        .or_else(|| match bool_field(sources, &["isRead", "read"]) {
            Some(true) => Some(MessageStatus::Read),
            _ => None,
        });

    Some(MessageEvent {
        message_id: str_field(sources, MESSAGE_ID_FIELDS)
            .filter(|id| id != METADATA_SORT_KEY),
        conversation_id: str_field(sources, CONVERSATION_ID_FIELDS),
        sender_id: str_field(sources, SENDER_ID_FIELDS),
        sender_name: str_field(sources, SENDER_NAME_FIELDS),
        receiver_id: str_field(sources, RECEIVER_ID_FIELDS),
        receiver_name: str_field(sources, RECEIVER_NAME_FIELDS),
        text,
        timestamp: timestamp_field(sources, TIMESTAMP_FIELDS).unwrap_or_else(Utc::now),
        status,
        is_edited: bool_field(sources, &["isEdited", "edited"]).unwrap_or(false),
    })
}

/// Whether an unclassified frame still looks like a message.
pub fn looks_like_message(sources: &[&Value]) -> bool {
    field(sources, &["text", "message", "conversationId", "senderId"]).is_some()
}

/// Turn a history record into a `Message` for `conversation_id`.
pub fn message_from_record(record: &Value, conversation_id: &str) -> Option<Message> {
    if is_metadata_record(record) {
        return None;
    }
    let event = message_event_from_sources(&[record])?;
    let sender_id = event.sender_id.clone().unwrap_or_default();
    let receiver_id = event.receiver_id.clone().unwrap_or_default();
    // anything the backend returns has at least been stored
    let status = event.status.unwrap_or(MessageStatus::Delivered);
    Some(Message {
        message_id: event
            .message_id
            .clone()
            .unwrap_or_else(|| format!("{}#{}", conversation_id, event.timestamp.timestamp_millis())),
        conversation_id: event
            .conversation_id
            .clone()
            .unwrap_or_else(|| conversation_id.to_string()),
        sender_name: event.sender_name.clone().unwrap_or_else(|| sender_id.clone()),
        receiver_name: event.receiver_name.clone().unwrap_or_else(|| receiver_id.clone()),
        sender_id,
        receiver_id,
        text: event.text,
        timestamp: event.timestamp,
        status,
        is_edited: event.is_edited,
    })
}

/// Unwrap list responses shaped either as a bare array or as an object
/// holding the array under one of `keys`.
pub fn list_items<'a>(body: &'a Value, keys: &[&str]) -> Vec<&'a Value> {
    if let Some(items) = body.as_array() {
        return items.iter().collect();
    }
    for key in keys.iter().chain(["data", "items", "Items"].iter()) {
        if let Some(items) = body.get(*key).and_then(|v| v.as_array()) {
            return items.iter().collect();
        }
    }
    Vec::new()
}

pub fn conversation_from_record(record: &Value, current_user_id: &str) -> Option<Conversation> {
    let sources = [record];
    let explicit_other = str_field(&sources, &["otherParticipantId", "otherUserId", "participantId"])
        .or_else(|| {
            record
                .get("participants")
                .and_then(|p| p.as_array())
                .and_then(|ids| {
                    ids.iter()
                        .filter_map(|id| id.as_str())
                        .find(|id| !same_user(id, current_user_id))
                        .map(|id| id.to_string())
                })
        });

    let conversation_id = str_field(&sources, CONVERSATION_ID_FIELDS)
        .map(|id| id.trim_start_matches("CONV#").to_string());

    // Derive whichever half is missing from the other.
    let other = match (&explicit_other, &conversation_id) {
        (Some(other), _) => other.clone(),
        (None, Some(id)) => derive_other_participant(id, current_user_id)?,
        (None, None) => return None,
    };
    let conversation_id = conversation_id.unwrap_or_else(|| conversation_id_for(current_user_id, &other));

    let last_message = record.get("lastMessage");
    let (last_text, last_time) = match last_message {
        Some(Value::String(s)) => (Some(s.clone()), None),
        Some(obj @ Value::Object(_)) => (
            str_field(&[obj], TEXT_FIELDS),
            timestamp_field(&[obj], TIMESTAMP_FIELDS),
        ),
        _ => (str_field(&sources, &["lastMessageText"]), None),
    };

    let display_name = str_field(
        &sources,
        &["otherParticipantName", "displayName", "participantName", "otherUserName", "name"],
    )
    .unwrap_or_else(|| other.clone());

    let online = bool_field(&sources, &["isOnline", "online", "onlineStatus"]).unwrap_or(false);

    Some(Conversation {
        conversation_id,
        other_participant_id: other,
        display_name,
        last_message_text: last_text.filter(|t| !t.trim().is_empty()),
        last_message_timestamp: last_time.or_else(|| {
            timestamp_field(&sources, &["lastMessageTimestamp", "lastMessageTime", "updatedAt"])
        }),
        last_message_id: str_field(&sources, &["lastMessageId"]),
        unread_count: field(&sources, &["unreadCount", "unread"])
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as u32,
        online_status: if online { OnlineStatus::Online } else { OnlineStatus::Offline },
        is_blocked: bool_field(&sources, &["isBlocked", "blocked"]).unwrap_or(false),
    })
}

pub fn unread_counts_from_body(body: &Value) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    let container = ["unreadCounts", "counts", "data"]
        .iter()
        .find_map(|key| body.get(*key))
        .unwrap_or(body);

    match container {
        Value::Object(map) => {
            for (conversation_id, count) in map {
                if let Some(n) = count.as_u64() {
                    counts.insert(conversation_id.clone(), n as u32);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let id = str_field(&[item], CONVERSATION_ID_FIELDS);
                let n = field(&[item], &["unreadCount", "count"]).and_then(|v| v.as_u64());
                if let (Some(id), Some(n)) = (id, n) {
                    counts.insert(id, n as u32);
                }
            }
        }
        _ => {}
    }
    counts
}

pub fn blocked_user_from_record(record: &Value) -> Option<BlockedUser> {
    let sources = [record];
    let blocked_user_id = str_field(&sources, &["blockedUserId", "blockedId", "userId"])?;
    Some(BlockedUser {
        blocked_user_name: str_field(&sources, &["blockedUserName", "name"])
            .unwrap_or_else(|| blocked_user_id.clone()),
        blocked_at: timestamp_field(&sources, &["blockedAt", "createdAt"]).unwrap_or_else(Utc::now),
        blocked_user_id,
    })
}

/// Best display name from a directory record.
pub fn display_name_from_record(record: &Value) -> Option<String> {
    let sources = payload_sources(record);
    if let Some(name) = str_field(
        &sources,
        &["displayName", "name", "fullName", "organizationName", "companyName", "userName"],
    ) {
        return Some(name);
    }
    let first = str_field(&sources, &["firstName"]);
    let last = str_field(&sources, &["lastName"]);
    match (first, last) {
        (Some(f), Some(l)) => Some(format!("{} {}", f, l)),
        (Some(f), None) => Some(f),
        (None, Some(l)) => Some(l),
        (None, None) => None,
    }
}
