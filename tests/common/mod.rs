// Shared helpers for the integration tests: an in-memory ChatApi, a
// synchronizer wired to it, and logging setup.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use log::LevelFilter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use tokio::sync::Notify;

use portal_chat::error::{ChatError, Result};
use portal_chat::transport::events::{BusEvent, InboundEvent, MessageEvent};
use portal_chat::transport::{ChatApi, MessagePage, OutgoingMessage, SendReceipt, TransportClient};
use portal_chat::{
    BlockedUser, ChatSnapshot, ChatSynchronizer, Conversation, Identity, Message, MessageStatus,
    SyncConfig, TransportConfig,
};

static INIT_LOGGER: Once = Once::new();

/// Set up the logger for the tests
pub fn setup_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::new()
            .filter_level(LevelFilter::Debug)
            .is_test(true)
            .try_init();
    });
}

pub const ME: &str = "seeker42";
pub const ORG: &str = "org7";
pub const OTHER_ORG: &str = "org9";

pub fn me() -> Identity {
    Identity::new(ME, "jobSeeker", "Ada Lovelace")
}

pub fn conv(a: &str, b: &str) -> String {
    portal_chat::conversation_id_for(a, b)
}

/// A fixed instant plus `seconds`, so ordering in tests never depends on the
/// wall clock.
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap() + ChronoDuration::seconds(seconds)
}

/// Every call the synchronizer made against the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    ListConversations,
    FetchMessages { conversation_id: String, cursor: Option<String> },
    SendMessage(OutgoingMessage),
    MarkRead(String),
    UnreadCounts,
    DeleteMessage { conversation_id: String, message_id: String },
    EditMessage { conversation_id: String, message_id: String, text: String },
    BlockUser(String),
    UnblockUser(String),
    BlockedUsers,
    LookupName(String),
}

#[derive(Default)]
struct MockState {
    conversations: Vec<Conversation>,
    history: HashMap<String, Vec<Message>>,
    first_page_cursor: HashMap<String, String>,
    older_pages: HashMap<String, Vec<Message>>,
    unread: HashMap<String, u32>,
    names: HashMap<String, String>,
    blocked: Vec<BlockedUser>,
    calls: Vec<Call>,
    fail_send: bool,
    fail_delete: bool,
    fail_edit: bool,
    fail_block: bool,
    next_id: u32,
}

/// In-memory backend. History fetches for a conversation can be held back
/// with `gate_history`, sends with `gate_sends`.
#[derive(Default)]
pub struct MockChatApi {
    state: Mutex<MockState>,
    history_gates: Mutex<HashMap<String, Arc<Notify>>>,
    send_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(MockChatApi::default())
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.with(|s| s.conversations.push(conversation));
    }

    pub fn set_history(&self, conversation_id: &str, messages: Vec<Message>) {
        self.with(|s| {
            s.history.insert(conversation_id.to_string(), messages);
        });
    }

    /// The first page reports `cursor`; asking for the page before it
    /// returns `older`.
    pub fn set_older_page(&self, conversation_id: &str, cursor: &str, older: Vec<Message>) {
        self.with(|s| {
            s.first_page_cursor
                .insert(conversation_id.to_string(), cursor.to_string());
            s.older_pages.insert(cursor.to_string(), older);
        });
    }

    pub fn set_unread(&self, conversation_id: &str, count: u32) {
        self.with(|s| {
            s.unread.insert(conversation_id.to_string(), count);
        });
    }

    pub fn set_name(&self, user_id: &str, name: &str) {
        self.with(|s| {
            s.names.insert(user_id.to_string(), name.to_string());
        });
    }

    pub fn set_blocked(&self, user_id: &str) {
        self.with(|s| {
            s.blocked.push(BlockedUser {
                blocked_user_id: user_id.to_string(),
                blocked_user_name: user_id.to_string(),
                blocked_at: at(0),
            })
        });
    }

    pub fn fail_sends(&self, fail: bool) {
        self.with(|s| s.fail_send = fail);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.with(|s| s.fail_delete = fail);
    }

    pub fn fail_edits(&self, fail: bool) {
        self.with(|s| s.fail_edit = fail);
    }

    pub fn fail_blocks(&self, fail: bool) {
        self.with(|s| s.fail_block = fail);
    }

    /// Hold every history fetch for `conversation_id` until the returned
    /// handle is notified (once per fetch).
    pub fn gate_history(&self, conversation_id: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.history_gates
            .lock()
            .unwrap()
            .insert(conversation_id.to_string(), gate.clone());
        gate
    }

    pub fn gate_sends(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.send_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> Vec<Call> {
        self.with(|s| s.calls.clone())
    }

    pub fn count(&self, matcher: impl Fn(&Call) -> bool) -> usize {
        self.with(|s| s.calls.iter().filter(|c| matcher(c)).count())
    }

    fn block_outcome(&self) -> Result<()> {
        if self.with(|s| s.fail_block) {
            return Err(ChatError::Request {
                status: 503,
                body: "block service unavailable".to_string(),
            });
        }
        Ok(())
    }

    fn record(&self, call: Call) {
        self.with(|s| s.calls.push(call));
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn list_conversations(&self, _user_id: &str) -> Result<Vec<Conversation>> {
        self.record(Call::ListConversations);
        Ok(self.with(|s| s.conversations.clone()))
    }

    async fn fetch_messages(
        &self,
        conversation_id: &str,
        _limit: u32,
        last_message_id: Option<&str>,
    ) -> Result<MessagePage> {
        self.record(Call::FetchMessages {
            conversation_id: conversation_id.to_string(),
            cursor: last_message_id.map(|c| c.to_string()),
        });

        let gate = self.history_gates.lock().unwrap().get(conversation_id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        Ok(self.with(|s| match last_message_id {
            Some(cursor) => MessagePage {
                messages: s.older_pages.get(cursor).cloned().unwrap_or_default(),
                cursor: None,
            },
            None => MessagePage {
                messages: s.history.get(conversation_id).cloned().unwrap_or_default(),
                cursor: s.first_page_cursor.get(conversation_id).cloned(),
            },
        }))
    }

    async fn send_message(&self, message: &OutgoingMessage) -> Result<SendReceipt> {
        self.record(Call::SendMessage(message.clone()));

        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.with(|s| {
            if s.fail_send {
                return Err(ChatError::Request {
                    status: 500,
                    body: "send failed".to_string(),
                });
            }
            s.next_id += 1;
            let timestamp = Utc::now();
            let stored = Message {
                message_id: format!("srv-{}", s.next_id),
                conversation_id: message.conversation_id.clone(),
                sender_id: message.sender_id.clone(),
                sender_name: message.sender_name.clone(),
                receiver_id: message.receiver_id.clone(),
                receiver_name: message.receiver_name.clone(),
                text: message.text.clone(),
                timestamp,
                status: MessageStatus::Delivered,
                is_edited: false,
            };
            s.history
                .entry(message.conversation_id.clone())
                .or_default()
                .push(stored);
            Ok(SendReceipt {
                // stored under its composite sort key
                message_id: format!("MSG#{}#srv-{}", timestamp.to_rfc3339(), s.next_id),
                timestamp,
            })
        })
    }

    async fn mark_read(&self, conversation_id: &str, _user_id: &str) -> Result<()> {
        self.record(Call::MarkRead(conversation_id.to_string()));
        self.with(|s| {
            s.unread.remove(conversation_id);
        });
        Ok(())
    }

    async fn unread_counts(&self, _user_id: &str) -> Result<HashMap<String, u32>> {
        self.record(Call::UnreadCounts);
        Ok(self.with(|s| s.unread.clone()))
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str, _user_id: &str) -> Result<()> {
        self.record(Call::DeleteMessage {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        });
        self.with(|s| {
            if s.fail_delete {
                return Err(ChatError::Request {
                    status: 403,
                    body: "not allowed".to_string(),
                });
            }
            if let Some(history) = s.history.get_mut(conversation_id) {
                history.retain(|m| m.message_id != message_id);
            }
            Ok(())
        })
    }

    async fn edit_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        _user_id: &str,
        new_text: &str,
    ) -> Result<()> {
        self.record(Call::EditMessage {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
            text: new_text.to_string(),
        });
        self.with(|s| {
            if s.fail_edit {
                return Err(ChatError::Request {
                    status: 500,
                    body: "edit failed".to_string(),
                });
            }
            if let Some(message) = s
                .history
                .get_mut(conversation_id)
                .and_then(|h| h.iter_mut().find(|m| m.message_id == message_id))
            {
                message.text = new_text.to_string();
                message.is_edited = true;
            }
            Ok(())
        })
    }

    async fn block_user(&self, _user_id: &str, blocked_user_id: &str) -> Result<()> {
        self.record(Call::BlockUser(blocked_user_id.to_string()));
        self.block_outcome()
    }

    async fn unblock_user(&self, _user_id: &str, blocked_user_id: &str) -> Result<()> {
        self.record(Call::UnblockUser(blocked_user_id.to_string()));
        self.block_outcome()
    }

    async fn blocked_users(&self, _user_id: &str) -> Result<Vec<BlockedUser>> {
        self.record(Call::BlockedUsers);
        Ok(self.with(|s| s.blocked.clone()))
    }

    async fn lookup_name(&self, user_id: &str) -> Result<Option<String>> {
        self.record(Call::LookupName(user_id.to_string()));
        Ok(self.with(|s| s.names.get(user_id).cloned()))
    }
}

/// Short timers so debounce and expiry behavior shows up quickly.
pub fn fast_sync_config() -> SyncConfig {
    SyncConfig {
        unread_debounce_ms: 30,
        typing_idle_ms: 50,
        typing_expiry_ms: 100,
        confirm_refetch_delay_ms: 10,
        ..Default::default()
    }
}

/// A synchronizer over `api` whose transport never connects.
pub fn synchronizer(api: Arc<MockChatApi>) -> ChatSynchronizer {
    setup_logging();
    let config = TransportConfig {
        gateway_url: "ws://127.0.0.1:9".to_string(),
        ..Default::default()
    };
    let transport = TransportClient::new(config, api);
    ChatSynchronizer::new(me(), transport, fast_sync_config())
}

pub fn stored(id: &str, conversation_id: &str, sender: &str, receiver: &str, text: &str, ts: DateTime<Utc>) -> Message {
    Message {
        message_id: id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_id: sender.to_string(),
        sender_name: sender.to_string(),
        receiver_id: receiver.to_string(),
        receiver_name: receiver.to_string(),
        text: text.to_string(),
        timestamp: ts,
        status: MessageStatus::Delivered,
        is_edited: false,
    }
}

pub fn message_event(
    id: Option<&str>,
    conversation_id: Option<&str>,
    sender: &str,
    receiver: &str,
    text: &str,
    ts: DateTime<Utc>,
) -> MessageEvent {
    MessageEvent {
        message_id: id.map(|s| s.to_string()),
        conversation_id: conversation_id.map(|s| s.to_string()),
        sender_id: Some(sender.to_string()),
        sender_name: None,
        receiver_id: Some(receiver.to_string()),
        receiver_name: None,
        text: text.to_string(),
        timestamp: ts,
        status: None,
        is_edited: false,
    }
}

pub fn inbound(event: MessageEvent) -> BusEvent {
    BusEvent::Inbound(InboundEvent::Message(event))
}

/// Poll the published snapshot until `predicate` holds.
pub async fn wait_for_snapshot(
    sync: &ChatSynchronizer,
    predicate: impl Fn(&ChatSnapshot) -> bool,
) -> ChatSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let snapshot = sync.snapshot();
        if predicate(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("snapshot never reached the expected state: {:#?}", snapshot);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll the mock until a call matching `matcher` was recorded.
pub async fn wait_for_call(api: &MockChatApi, matcher: impl Fn(&Call) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while api.count(&matcher) == 0 {
        if tokio::time::Instant::now() > deadline {
            panic!("expected call never happened: {:#?}", api.calls());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
