// Inbound gateway frame classification.
// Every frame is JSON; `type` (then `action`) picks the handler, and frames
// with no known discriminator that still look like a message are treated as
// one.

use serde_json::Value;

use crate::error::Result;
use crate::transport::events::{
    BlockStatusEvent, DeletionEvent, EditEvent, InboundEvent, PresenceEvent, ReadReceiptEvent,
    TypingEvent,
};
use crate::transport::wire::{
    bool_field, field, looks_like_message, message_event_from_sources, payload_sources, str_field,
};

/// Which handler a frame is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Message,
    Typing,
    Deleted,
    Edited,
    ReadReceipt,
    BlockStatus,
    Presence,
}

impl FrameKind {
    pub fn from_discriminator(raw: &str) -> Option<FrameKind> {
        match raw {
            "message" | "sendMessage" | "newMessage" => Some(FrameKind::Message),
            "typing" | "typingIndicator" => Some(FrameKind::Typing),
            "messageDeleted" | "deleteMessage" => Some(FrameKind::Deleted),
            "messageEdited" | "editMessage" => Some(FrameKind::Edited),
            "messageRead" | "readReceipt" => Some(FrameKind::ReadReceipt),
            "blockStatus" | "userBlockStatus" | "blockUser" | "unblockUser" => {
                Some(FrameKind::BlockStatus)
            }
            "userOnlineStatus" | "onlineStatus" => Some(FrameKind::Presence),
            _ => None,
        }
    }
}

/// The discriminator of a frame: `type` first, then `action`.
pub fn discriminator(frame: &Value) -> Option<&str> {
    frame
        .get("type")
        .and_then(|v| v.as_str())
        .or_else(|| frame.get("action").and_then(|v| v.as_str()))
}

/// Parse and classify one text frame. `Ok(None)` means the frame was valid
/// JSON but carried nothing we act on.
pub fn classify(text: &str) -> Result<Option<InboundEvent>> {
    let frame: Value = serde_json::from_str(text)?;
    Ok(classify_value(&frame))
}

pub fn classify_value(frame: &Value) -> Option<InboundEvent> {
    let sources = payload_sources(frame);
    let kind = match discriminator(frame).and_then(FrameKind::from_discriminator) {
        Some(kind) => kind,
        None if looks_like_message(&sources) => FrameKind::Message,
        None => return None,
    };

    match kind {
        FrameKind::Message => message_event_from_sources(&sources).map(InboundEvent::Message),
        FrameKind::Typing => typing_event(&sources).map(InboundEvent::Typing),
        FrameKind::Deleted => deletion_event(&sources).map(InboundEvent::Deleted),
        FrameKind::Edited => edit_event(&sources).map(InboundEvent::Edited),
        FrameKind::ReadReceipt => Some(InboundEvent::ReadReceipt(read_receipt_event(&sources))),
        FrameKind::BlockStatus => {
            let fallback = discriminator(frame) != Some("unblockUser");
            block_status_event(&sources, fallback).map(InboundEvent::BlockStatus)
        }
        FrameKind::Presence => presence_event(&sources).map(InboundEvent::Presence),
    }
}

fn typing_event(sources: &[&Value]) -> Option<TypingEvent> {
    Some(TypingEvent {
        conversation_id: str_field(sources, &["conversationId", "conversation_id"]),
        user_id: str_field(sources, &["userId", "senderId", "from", "user_id"])?,
        receiver_id: str_field(sources, &["receiverId", "recipientId", "to"]),
        // a bare typing frame means "started typing"
        is_typing: bool_field(sources, &["isTyping", "typing"]).unwrap_or(true),
    })
}

fn deletion_event(sources: &[&Value]) -> Option<DeletionEvent> {
    Some(DeletionEvent {
        message_id: str_field(sources, &["messageId", "message_id", "id", "SK"])?,
        conversation_id: str_field(sources, &["conversationId", "conversation_id"]),
    })
}

fn edit_event(sources: &[&Value]) -> Option<EditEvent> {
    Some(EditEvent {
        message_id: str_field(sources, &["messageId", "message_id", "id", "SK"])?,
        conversation_id: str_field(sources, &["conversationId", "conversation_id"]),
        text: field(sources, &["newText", "text", "messageText"])
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .filter(|s| !s.trim().is_empty())?,
    })
}

fn read_receipt_event(sources: &[&Value]) -> ReadReceiptEvent {
    let message_ids = field(sources, &["messageIds", "message_ids"])
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str().map(|s| s.to_string()))
                .collect()
        })
        .or_else(|| str_field(sources, &["messageId"]).map(|id| vec![id]))
        .unwrap_or_default();

    ReadReceiptEvent {
        conversation_id: str_field(sources, &["conversationId", "conversation_id"]),
        reader_id: str_field(sources, &["readerId", "userId", "readBy"]),
        message_ids,
    }
}

fn block_status_event(sources: &[&Value], default_blocked: bool) -> Option<BlockStatusEvent> {
    Some(BlockStatusEvent {
        blocker_id: str_field(sources, &["blockerId", "blockerUserId", "userId"]),
        blocked_id: str_field(sources, &["blockedUserId", "blockedId", "targetUserId"])?,
        blocked_name: str_field(sources, &["blockedUserName", "blockedName"]),
        is_blocked: bool_field(sources, &["isBlocked", "blocked"]).unwrap_or(default_blocked),
    })
}

fn presence_event(sources: &[&Value]) -> Option<PresenceEvent> {
    let online = bool_field(sources, &["isOnline", "online"])
        .or_else(|| bool_field(sources, &["status", "onlineStatus"]))?;
    Some(PresenceEvent {
        user_id: str_field(sources, &["userId", "user_id", "id"])?,
        online,
    })
}
