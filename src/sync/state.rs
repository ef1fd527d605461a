// The synchronizer's single mutable snapshot and the reducers that change
// it. Nothing in here awaits; the async orchestration lives in `sync::mod`.

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::SyncConfig;
use crate::error::{ChatError, Result};
use crate::models::{
    canonical_message_id, conversation_id_for, derive_other_participant, is_placeholder_name,
    new_temp_message_id, same_user, BlockedUser, Conversation, ConversationRef, Identity, Message, MessageStatus, OnlineStatus,
};
use crate::transport::events::{
    BlockStatusEvent, DeletionEvent, EditEvent, MessageEvent, PresenceEvent, ReadReceiptEvent,
    TypingEvent,
};
use crate::transport::rest::{MessagePage, SendReceipt};
use crate::transport::ConnectionState;
use crate::sync::matching::{match_event, same_conversation, EventRoute, MatchOutcome};
use crate::sync::pending::{gap, Candidate, PendingSendRegistry};
use crate::sync::typing::{OutboundTyping, TypingSet};

/// The conversation the view has open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub conversation_id: String,
    pub other_participant_id: String,
    pub display_name: String,
    /// Bumped on every selection; fetches started for an older generation
    /// are discarded.
    pub generation: u64,
}

/// Read-only view of the state, published after every change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub conversations: Vec<Conversation>,
    pub messages: Vec<Message>,
    pub selected: Option<Conversation>,
    pub connection: ConnectionState,
    pub typing_users: Vec<String>,
    pub error: Option<String>,
    pub loading: bool,
    pub has_older: bool,
    pub blocked_users: Vec<BlockedUser>,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        ChatSnapshot {
            conversations: Vec::new(),
            messages: Vec::new(),
            selected: None,
            connection: ConnectionState::Disconnected,
            typing_users: Vec::new(),
            error: None,
            loading: false,
            has_older: false,
            blocked_users: Vec::new(),
        }
    }
}

impl ChatSnapshot {
    /// Whether the composer should accept input.
    pub fn can_compose(&self) -> bool {
        self.connection.is_open()
            && self.selected.as_ref().map(|c| !c.is_blocked).unwrap_or(false)
    }
}

/// What happened to an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// Sender is blocked; nothing changed.
    Discarded,
    /// Not for the open conversation; only its summary changed.
    Elsewhere,
    Appended,
    /// Upgraded an optimistic copy in place.
    Merged,
    Duplicate,
}

impl Ingest {
    pub fn reached_active_view(self) -> bool {
        matches!(self, Ingest::Appended | Ingest::Merged | Ingest::Duplicate)
    }
}

/// Local change made ahead of a delete/edit call, so it can be reported.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalEdit {
    /// Same text as before; nothing to send.
    Unchanged,
    Applied { conversation_id: String, message_id: String },
}

pub struct ChatState {
    me: Identity,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    selection: Option<Selection>,
    generation: u64,
    loading: bool,
    history_cursor: Option<String>,
    blocked: HashMap<String, BlockedUser>,
    typing: TypingSet,
    pub(crate) outbound_typing: OutboundTyping,
    pending: PendingSendRegistry,
    connection: ConnectionState,
    error: Option<String>,
    duplicate_window: chrono::Duration,
    typing_expiry: Duration,
}

impl ChatState {
    pub fn new(me: Identity, config: &SyncConfig) -> Self {
        ChatState {
            me,
            conversations: Vec::new(),
            messages: Vec::new(),
            selection: None,
            generation: 0,
            loading: false,
            history_cursor: None,
            blocked: HashMap::new(),
            typing: TypingSet::default(),
            outbound_typing: OutboundTyping::default(),
            pending: PendingSendRegistry::new(config.duplicate_window(), config.pending_gc()),
            connection: ConnectionState::Disconnected,
            error: None,
            duplicate_window: chrono::Duration::from_std(config.duplicate_window())
                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
            typing_expiry: config.typing_expiry(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.me
    }

    pub fn selection(&self) -> Option<&Selection> {
        self.selection.as_ref()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn history_cursor(&self) -> Option<&str> {
        self.history_cursor.as_deref()
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.selection.is_some() && self.generation == generation
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        let selected = self.selection.as_ref().map(|s| {
            self.find_conversation(&s.conversation_id)
                .map(|i| self.conversations[i].clone())
                .unwrap_or_else(|| {
                    Conversation::new_local(&self.me.user_id, &s.other_participant_id, Some(&s.display_name))
                })
        });
        let mut blocked_users: Vec<BlockedUser> = self.blocked.values().cloned().collect();
        blocked_users.sort_by(|a, b| a.blocked_user_name.cmp(&b.blocked_user_name));

        ChatSnapshot {
            conversations: self.conversations.clone(),
            messages: self.messages.clone(),
            selected,
            connection: self.connection,
            typing_users: self.typing.users(),
            error: self.error.clone(),
            loading: self.loading,
            has_older: self.history_cursor.is_some(),
            blocked_users,
        }
    }

    // ---- connectivity and errors -------------------------------------

    pub fn set_connection(&mut self, state: ConnectionState) {
        self.connection = state;
    }

    /// Last error wins.
    pub fn set_error(&mut self, error: &ChatError) {
        self.error = Some(error.to_string());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    // ---- conversation list -------------------------------------------

    fn find_conversation(&self, conversation_id: &str) -> Option<usize> {
        self.conversations
            .iter()
            .position(|c| c.conversation_id == conversation_id)
            .or_else(|| {
                self.conversations
                    .iter()
                    .position(|c| same_conversation(&c.conversation_id, conversation_id).is_some())
            })
    }

    fn find_conversation_with(&self, participant: &str) -> Option<usize> {
        self.conversations
            .iter()
            .position(|c| same_user(&c.other_participant_id, participant))
    }

    /// Replace the list with a fresh backend copy, keeping names we already
    /// resolved and the locally started conversation that is still open.
    pub fn set_conversations(&mut self, fresh: Vec<Conversation>) {
        let previous = std::mem::take(&mut self.conversations);
        let mut conversations = Vec::with_capacity(fresh.len() + 1);
        for mut conversation in fresh {
            if let Some(old) = previous
                .iter()
                .find(|o| same_conversation(&o.conversation_id, &conversation.conversation_id).is_some())
            {
                if conversation.needs_display_name() && !old.needs_display_name() {
                    conversation.display_name = old.display_name.clone();
                }
            }
            if self.is_blocked_user(&conversation.other_participant_id) {
                conversation.is_blocked = true;
            }
            conversations.push(conversation);
        }

        if let Some(selection) = &self.selection {
            let present = conversations
                .iter()
                .any(|c| same_conversation(&c.conversation_id, &selection.conversation_id).is_some());
            if !present {
                let kept = previous
                    .iter()
                    .find(|c| c.conversation_id == selection.conversation_id)
                    .cloned()
                    .unwrap_or_else(|| {
                        Conversation::new_local(
                            &self.me.user_id,
                            &selection.other_participant_id,
                            Some(&selection.display_name),
                        )
                    });
                conversations.push(kept);
            }
        }

        sort_conversations(&mut conversations);
        self.conversations = conversations;
    }

    /// Unread counts come from the backend only. Absent keys mean zero; a
    /// blocked conversation never goes up.
    pub fn apply_unread_counts(&mut self, counts: &HashMap<String, u32>) {
        self.pending.prune(Instant::now());
        let blocked: Vec<bool> = self
            .conversations
            .iter()
            .map(|c| c.is_blocked || self.is_blocked_user(&c.other_participant_id))
            .collect();
        for (conversation, blocked) in self.conversations.iter_mut().zip(blocked) {
            let count = counts
                .get(&conversation.conversation_id)
                .copied()
                .or_else(|| {
                    counts
                        .iter()
                        .find(|(id, _)| same_conversation(id, &conversation.conversation_id).is_some())
                        .map(|(_, n)| *n)
                })
                .unwrap_or(0);
            conversation.unread_count = if blocked {
                conversation.unread_count.min(count)
            } else {
                count
            };
        }
    }

    /// Participant ids whose conversation still shows a placeholder name.
    pub fn unresolved_participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .conversations
            .iter()
            .filter(|c| c.needs_display_name())
            .map(|c| c.other_participant_id.clone())
            .collect();
        if let Some(selection) = &self.selection {
            if is_placeholder_name(&selection.display_name, &selection.other_participant_id) {
                ids.push(selection.other_participant_id.clone());
            }
        }
        ids.sort();
        ids.dedup();
        ids
    }

    /// Patch resolved display names into conversations, the selection and
    /// visible messages.
    pub fn apply_names(&mut self, names: &HashMap<String, String>) -> bool {
        let mut changed = false;
        for conversation in &mut self.conversations {
            if !conversation.needs_display_name() {
                continue;
            }
            if let Some(name) = names.get(&conversation.other_participant_id) {
                conversation.display_name = name.clone();
                changed = true;
            }
        }
        if let Some(selection) = &mut self.selection {
            if is_placeholder_name(&selection.display_name, &selection.other_participant_id) {
                if let Some(name) = names.get(&selection.other_participant_id) {
                    selection.display_name = name.clone();
                    changed = true;
                }
            }
        }
        for message in &mut self.messages {
            if is_placeholder_name(&message.sender_name, &message.sender_id) {
                if let Some(name) = names.get(&message.sender_id) {
                    message.sender_name = name.clone();
                    changed = true;
                }
            }
            if is_placeholder_name(&message.receiver_name, &message.receiver_id) {
                if let Some(name) = names.get(&message.receiver_id) {
                    message.receiver_name = name.clone();
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn apply_presence(&mut self, event: &PresenceEvent) -> bool {
        let status = if event.online {
            OnlineStatus::Online
        } else {
            OnlineStatus::Offline
        };
        let mut changed = false;
        for conversation in &mut self.conversations {
            if same_user(&conversation.other_participant_id, &event.user_id)
                && conversation.online_status != status
            {
                conversation.online_status = status;
                changed = true;
            }
        }
        changed
    }

    /// Update (or create) the summary entry an inbound or outbound message
    /// belongs to.
    fn touch_summary(&mut self, message: &Message) {
        let other = if same_user(&message.sender_id, &self.me.user_id) {
            (message.receiver_id.clone(), message.receiver_name.clone())
        } else {
            (message.sender_id.clone(), message.sender_name.clone())
        };

        let index = self
            .find_conversation(&message.conversation_id)
            .or_else(|| self.find_conversation_with(&other.0).filter(|_| !other.0.is_empty()));

        let index = match index {
            Some(i) => i,
            None => {
                let other_id = if other.0.is_empty() {
                    match derive_other_participant(&message.conversation_id, &self.me.user_id) {
                        Some(id) => id,
                        None => {
                            debug!("No summary entry for {}", message.conversation_id);
                            return;
                        }
                    }
                } else {
                    other.0.clone()
                };
                let mut conversation =
                    Conversation::new_local(&self.me.user_id, &other_id, Some(&other.1));
                conversation.conversation_id = message.conversation_id.clone();
                conversation.is_blocked = self.is_blocked_user(&other_id);
                self.conversations.push(conversation);
                self.conversations.len() - 1
            }
        };

        let conversation = &mut self.conversations[index];
        let newer = conversation
            .last_message_timestamp
            .map(|t| t <= message.timestamp)
            .unwrap_or(true);
        if newer {
            conversation.last_message_text = Some(message.text.clone());
            conversation.last_message_timestamp = Some(message.timestamp);
            conversation.last_message_id = Some(message.message_id.clone());
        }
        sort_conversations(&mut self.conversations);
    }

    // ---- selection and history ---------------------------------------

    /// Open a conversation: clears the message list and starts a new
    /// generation. History is applied separately once fetched.
    pub fn select(&mut self, reference: &ConversationRef) -> Selection {
        let conversation_id = reference
            .conversation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| conversation_id_for(&self.me.user_id, &reference.other_participant_id));

        let existing = self.find_conversation(&conversation_id);
        let display_name = reference
            .display_name
            .clone()
            .filter(|n| !is_placeholder_name(n, &reference.other_participant_id))
            .or_else(|| existing.map(|i| self.conversations[i].display_name.clone()))
            .unwrap_or_else(|| reference.other_participant_id.clone());

        if existing.is_none() {
            let mut conversation = Conversation::new_local(
                &self.me.user_id,
                &reference.other_participant_id,
                Some(&display_name),
            );
            conversation.conversation_id = conversation_id.clone();
            conversation.is_blocked = self.is_blocked_user(&reference.other_participant_id);
            self.conversations.insert(0, conversation);
        }

        self.generation += 1;
        self.messages.clear();
        self.typing.clear();
        self.loading = true;
        self.history_cursor = None;

        let selection = Selection {
            conversation_id,
            other_participant_id: reference.other_participant_id.clone(),
            display_name,
            generation: self.generation,
        };
        info!(
            "Selected conversation {} (generation {})",
            selection.conversation_id, selection.generation
        );
        self.selection = Some(selection.clone());
        selection
    }

    /// Commit the first history page for `generation`. Messages that arrived
    /// while it loaded are merged in, not lost.
    pub fn apply_history(&mut self, generation: u64, page: MessagePage) -> bool {
        if !self.is_current(generation) {
            debug!("Discarding history for stale generation {}", generation);
            return false;
        }
        let arrived = std::mem::take(&mut self.messages);
        self.messages = self.without_blocked(page.messages);
        sort_messages(&mut self.messages);
        for message in arrived {
            let has_server_id = !message.is_optimistic();
            self.merge_message(message, has_server_id);
        }
        self.history_cursor = page.cursor;
        self.loading = false;
        true
    }

    /// Re-fetched first page after a delete, edit or reconnect, merged by
    /// canonical id. Inside the page's time range the page wins; anything
    /// older (paged in earlier) stays along with its cursor. Optimistic
    /// messages still waiting on the backend are kept.
    pub fn replace_history(&mut self, generation: u64, page: MessagePage) -> bool {
        if !self.is_current(generation) {
            debug!("Discarding refetch for stale generation {}", generation);
            return false;
        }
        let fresh = self.without_blocked(page.messages);
        let window_start = fresh.iter().map(|m| m.timestamp).min();
        let reaches_start = page.cursor.is_none();

        let (local, confirmed): (Vec<Message>, Vec<Message>) = std::mem::take(&mut self.messages)
            .into_iter()
            .partition(|m| m.is_optimistic());
        let older: Vec<Message> = confirmed
            .into_iter()
            .filter(|m| match window_start {
                _ if reaches_start => false,
                Some(start) => m.timestamp < start,
                None => true,
            })
            .filter(|m| !fresh.iter().any(|f| f.canonical_id() == m.canonical_id()))
            .collect();

        if older.is_empty() {
            self.history_cursor = page.cursor;
        }
        self.messages = older;
        self.messages.extend(fresh);
        sort_messages(&mut self.messages);
        for message in local {
            self.merge_message(message, false);
        }
        true
    }

    /// Older page from pagination.
    pub fn prepend_older(&mut self, generation: u64, page: MessagePage) -> bool {
        if !self.is_current(generation) {
            debug!("Discarding older page for stale generation {}", generation);
            return false;
        }
        for message in self.without_blocked(page.messages) {
            self.merge_message(message, true);
        }
        self.history_cursor = page.cursor;
        true
    }

    pub fn history_failed(&mut self, generation: u64) {
        if self.is_current(generation) {
            self.loading = false;
        }
    }

    /// After the backend accepted mark-read: messages from the other side
    /// show as read without a reload.
    pub fn mark_incoming_read(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) {
            return false;
        }
        let me = self.me.user_id.clone();
        let mut changed = false;
        for message in self.messages.iter_mut().filter(|m| !same_user(&m.sender_id, &me)) {
            changed |= message.promote_status(MessageStatus::Read);
        }
        changed
    }

    // ---- inbound messages --------------------------------------------

    /// Reconcile one inbound message event.
    pub fn ingest_message(&mut self, event: &MessageEvent) -> Ingest {
        if let Some(sender) = event.sender_id.as_deref() {
            if self.is_blocked_user(sender) {
                debug!("Discarding message from blocked user {}", sender);
                return Ingest::Discarded;
            }
        }

        let route = EventRoute {
            conversation_id: event.conversation_id.as_deref(),
            sender_id: event.sender_id.as_deref(),
            receiver_id: event.receiver_id.as_deref(),
        };
        let outcome = match &self.selection {
            Some(selection) => match_event(
                &route,
                &selection.conversation_id,
                Some(selection.other_participant_id.as_str()),
                &self.me.user_id,
            ),
            None => MatchOutcome::Mismatch,
        };

        let conversation_id = match (event.conversation_id.clone(), &self.selection, outcome) {
            (_, Some(selection), MatchOutcome::Matched(_)) => selection.conversation_id.clone(),
            (Some(id), _, _) => id,
            (None, _, _) => match self.conversation_for_route(&route) {
                Some(id) => id,
                None => {
                    debug!("Message without routing information dropped: {:?}", event.message_id);
                    return Ingest::Elsewhere;
                }
            },
        };

        let (message, has_server_id) = self.message_from_event(event, &conversation_id);
        self.touch_summary(&message);

        if !outcome.is_match() {
            return Ingest::Elsewhere;
        }

        self.typing.stop(&message.sender_id);
        self.merge_message(message, has_server_id)
    }

    fn conversation_for_route(&self, route: &EventRoute<'_>) -> Option<String> {
        match (route.sender_id, route.receiver_id) {
            (Some(sender), Some(receiver)) => Some(conversation_id_for(sender, receiver)),
            (Some(other), None) | (None, Some(other)) if !same_user(other, &self.me.user_id) => {
                Some(conversation_id_for(&self.me.user_id, other))
            }
            _ => None,
        }
    }

    fn message_from_event(&self, event: &MessageEvent, conversation_id: &str) -> (Message, bool) {
        let selection = self.selection.as_ref();
        let other = selection
            .filter(|s| s.conversation_id == conversation_id)
            .map(|s| (s.other_participant_id.clone(), s.display_name.clone()))
            .or_else(|| {
                derive_other_participant(conversation_id, &self.me.user_id).map(|id| (id.clone(), id))
            })
            .unwrap_or_default();

        let sender_id = event.sender_id.clone().unwrap_or_else(|| {
            // only a receiver was given; whoever it is not sent it
            match event.receiver_id.as_deref() {
                Some(receiver) if same_user(receiver, &self.me.user_id) => other.0.clone(),
                Some(_) => self.me.user_id.clone(),
                None => other.0.clone(),
            }
        });
        let outgoing = same_user(&sender_id, &self.me.user_id);
        let receiver_id = event.receiver_id.clone().unwrap_or_else(|| {
            if outgoing {
                other.0.clone()
            } else {
                self.me.user_id.clone()
            }
        });
        let sender_name = event.sender_name.clone().unwrap_or_else(|| {
            if outgoing {
                self.me.name.clone()
            } else if same_user(&sender_id, &other.0) {
                other.1.clone()
            } else {
                sender_id.clone()
            }
        });
        let receiver_name = event.receiver_name.clone().unwrap_or_else(|| {
            if outgoing {
                other.1.clone()
            } else {
                self.me.name.clone()
            }
        });

        let has_server_id = event.message_id.is_some();
        let message = Message {
            message_id: event.message_id.clone().unwrap_or_else(|| {
                format!("{}#{}", conversation_id, event.timestamp.timestamp_millis())
            }),
            conversation_id: conversation_id.to_string(),
            sender_id,
            sender_name,
            receiver_id,
            receiver_name,
            text: event.text.clone(),
            timestamp: event.timestamp,
            status: event.status.unwrap_or(MessageStatus::Delivered),
            is_edited: event.is_edited,
        };
        (message, has_server_id)
    }

    /// Dedup `incoming` against the visible list: same id, then a pending
    /// send it echoes, then same text and sender within the window.
    fn merge_message(&mut self, incoming: Message, has_server_id: bool) -> Ingest {
        let canonical = incoming.canonical_id().to_string();
        if let Some(existing) = self.messages.iter_mut().find(|m| m.canonical_id() == canonical) {
            if incoming.status != existing.status && incoming.status != MessageStatus::Sending {
                existing.promote_status(incoming.status);
            }
            return Ingest::Duplicate;
        }

        let candidate = Candidate {
            message_id: if has_server_id { Some(incoming.message_id.as_str()) } else { None },
            conversation_id: &incoming.conversation_id,
            sender_id: &incoming.sender_id,
            text: &incoming.text,
            timestamp: incoming.timestamp,
        };
        if let Some(temp_id) = self.pending.correlate(&candidate) {
            let real_id = self.pending.get(&temp_id).and_then(|p| p.real_id.clone());
            let position = self.messages.iter().position(|m| {
                m.message_id == temp_id
                    || real_id
                        .as_deref()
                        .map(|r| canonical_message_id(r) == m.canonical_id())
                        .unwrap_or(false)
            });
            if let Some(index) = position {
                upgrade_in_place(&mut self.messages[index], &incoming, has_server_id);
                if has_server_id {
                    self.pending.resolve(&temp_id, &incoming.message_id);
                }
                sort_messages(&mut self.messages);
                debug!("Merged echo of {} into its optimistic copy", temp_id);
                return Ingest::Merged;
            }
        }

        let window = self.duplicate_window;
        let twin = self.messages.iter().position(|m| {
            (!has_server_id || m.is_optimistic())
                && same_user(&m.sender_id, &incoming.sender_id)
                && m.text == incoming.text
                && same_conversation(&m.conversation_id, &incoming.conversation_id).is_some()
                && gap(m.timestamp, incoming.timestamp) <= window
        });
        if let Some(index) = twin {
            if self.messages[index].is_optimistic() && has_server_id {
                upgrade_in_place(&mut self.messages[index], &incoming, true);
                sort_messages(&mut self.messages);
                return Ingest::Merged;
            }
            return Ingest::Duplicate;
        }

        self.messages.push(incoming);
        sort_messages(&mut self.messages);
        Ingest::Appended
    }

    pub fn apply_remote_deletion(&mut self, event: &DeletionEvent) -> bool {
        if !self.event_targets_selection(event.conversation_id.as_deref()) {
            return false;
        }
        self.remove_message(&event.message_id).is_some()
    }

    pub fn apply_remote_edit(&mut self, event: &EditEvent) -> bool {
        if !self.event_targets_selection(event.conversation_id.as_deref()) {
            return false;
        }
        let canonical = canonical_message_id(&event.message_id);
        match self.messages.iter_mut().find(|m| m.canonical_id() == canonical) {
            Some(message) if message.text != event.text => {
                message.text = event.text.clone();
                message.is_edited = true;
                true
            }
            _ => false,
        }
    }

    /// The other side read our messages.
    pub fn apply_read_receipt(&mut self, event: &ReadReceiptEvent) -> bool {
        if event
            .reader_id
            .as_deref()
            .map(|reader| same_user(reader, &self.me.user_id))
            .unwrap_or(false)
        {
            return false;
        }
        if !self.event_targets_selection(event.conversation_id.as_deref()) {
            return false;
        }
        let me = self.me.user_id.clone();
        let wanted: Vec<&str> = event.message_ids.iter().map(|id| canonical_message_id(id)).collect();
        let mut changed = false;
        for message in self.messages.iter_mut().filter(|m| same_user(&m.sender_id, &me)) {
            if message.status != MessageStatus::Delivered {
                continue;
            }
            if wanted.is_empty() || wanted.contains(&message.canonical_id()) {
                changed |= message.promote_status(MessageStatus::Read);
            }
        }
        changed
    }

    fn event_targets_selection(&self, conversation_id: Option<&str>) -> bool {
        match (&self.selection, conversation_id) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(selection), Some(id)) => same_conversation(id, &selection.conversation_id).is_some(),
        }
    }

    // ---- typing ------------------------------------------------------

    /// Inbound typing only counts for the open conversation.
    pub fn apply_typing(&mut self, event: &TypingEvent, now: Instant) -> bool {
        if same_user(&event.user_id, &self.me.user_id) {
            return false;
        }
        let selection = match &self.selection {
            Some(selection) => selection,
            None => return false,
        };
        let route = EventRoute {
            conversation_id: event.conversation_id.as_deref(),
            sender_id: Some(&event.user_id),
            receiver_id: event.receiver_id.as_deref(),
        };
        let outcome = match_event(
            &route,
            &selection.conversation_id,
            Some(selection.other_participant_id.as_str()),
            &self.me.user_id,
        );
        let ours = outcome.is_confident()
            || (event.conversation_id.is_none()
                && same_user(&event.user_id, &selection.other_participant_id));
        if !ours {
            return false;
        }

        if event.is_typing {
            self.typing.start(&event.user_id, now, self.typing_expiry);
            true
        } else {
            self.typing.stop(&event.user_id)
        }
    }

    pub fn prune_typing(&mut self, now: Instant) -> bool {
        self.typing.prune(now)
    }

    // ---- sending -----------------------------------------------------

    /// First phase of a send: validate, then show the message optimistically.
    pub fn begin_send(&mut self, text: &str, now: DateTime<Utc>) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::validation("Message text cannot be empty"));
        }
        let selection = self.selection.clone().ok_or(ChatError::NoConversation)?;
        if self.is_selection_blocked(&selection) {
            return Err(ChatError::Blocked(selection.display_name));
        }

        let message = Message {
            message_id: new_temp_message_id(),
            conversation_id: selection.conversation_id.clone(),
            sender_id: self.me.user_id.clone(),
            sender_name: self.me.name.clone(),
            receiver_id: selection.other_participant_id.clone(),
            receiver_name: selection.display_name.clone(),
            text: text.to_string(),
            timestamp: now,
            status: MessageStatus::Sending,
            is_edited: false,
        };
        self.pending.register(
            &message.message_id,
            &message.conversation_id,
            &message.sender_id,
            &message.text,
            now,
        );
        self.pending.prune(Instant::now());
        self.messages.push(message.clone());
        sort_messages(&mut self.messages);
        self.touch_summary(&message);

        // replying reads the thread
        if let Some(index) = self.find_conversation(&selection.conversation_id) {
            self.conversations[index].unread_count = 0;
        }
        Ok(message)
    }

    /// Second phase: the backend stored it under `receipt.message_id`.
    pub fn confirm_send(&mut self, temp_id: &str, receipt: &SendReceipt) {
        self.pending.resolve(temp_id, &receipt.message_id);
        self.pending.prune(Instant::now());
        let real = canonical_message_id(&receipt.message_id).to_string();

        let temp_index = self.messages.iter().position(|m| m.message_id == temp_id);
        let echo_index = self
            .messages
            .iter()
            .position(|m| m.message_id != temp_id && m.canonical_id() == real);

        match (temp_index, echo_index) {
            (Some(temp), Some(echo)) => {
                self.messages[echo].promote_status(MessageStatus::Delivered);
                self.messages.remove(temp);
            }
            (Some(temp), None) => {
                let message = &mut self.messages[temp];
                message.message_id = receipt.message_id.clone();
                message.timestamp = receipt.timestamp;
                message.promote_status(MessageStatus::Delivered);
            }
            (None, Some(echo)) => {
                self.messages[echo].promote_status(MessageStatus::Delivered);
            }
            (None, None) => {
                debug!("Confirmed message {} is no longer visible", temp_id);
            }
        }
        sort_messages(&mut self.messages);

        if let Some(confirmed) = self.messages.iter().find(|m| m.canonical_id() == real).cloned() {
            self.touch_summary(&confirmed);
        }
    }

    /// The REST send failed; the message stays visible as failed.
    pub fn fail_send(&mut self, temp_id: &str, error: &ChatError) {
        warn!("Send of {} failed: {}", temp_id, error);
        self.pending.prune(Instant::now());
        if let Some(message) = self.messages.iter_mut().find(|m| m.message_id == temp_id) {
            message.promote_status(MessageStatus::Failed);
        }
        self.set_error(error);
    }

    /// Put a failed message back into `sending` for another attempt.
    pub fn prepare_retry(&mut self, message_id: &str, now: DateTime<Utc>) -> Result<Message> {
        let selection = self.selection.clone().ok_or(ChatError::NoConversation)?;
        if self.is_selection_blocked(&selection) {
            return Err(ChatError::Blocked(selection.display_name));
        }
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id)
            .ok_or_else(|| ChatError::validation("Message not found"))?;
        if message.status != MessageStatus::Failed {
            return Err(ChatError::validation("Only failed messages can be retried"));
        }
        message.promote_status(MessageStatus::Sending);
        let message = message.clone();

        if self.pending.get(&message.message_id).is_some() {
            self.pending.reopen(&message.message_id, now);
        } else {
            self.pending.register(
                &message.message_id,
                &message.conversation_id,
                &message.sender_id,
                &message.text,
                now,
            );
        }
        Ok(message)
    }

    // ---- delete / edit -----------------------------------------------

    pub fn find_message(&self, message_id: &str) -> Option<&Message> {
        let canonical = canonical_message_id(message_id);
        self.messages
            .iter()
            .find(|m| m.message_id == message_id || m.canonical_id() == canonical)
    }

    /// Optimistically remove a message; returns what was removed.
    pub fn remove_message(&mut self, message_id: &str) -> Option<Message> {
        let canonical = canonical_message_id(message_id);
        let index = self
            .messages
            .iter()
            .position(|m| m.message_id == message_id || m.canonical_id() == canonical)?;
        let removed = self.messages.remove(index);
        if removed.is_optimistic() {
            self.pending.remove(&removed.message_id);
        }
        Some(removed)
    }

    /// Optimistically apply an edit to one of our own delivered messages.
    pub fn apply_local_edit(&mut self, message_id: &str, new_text: &str) -> Result<LocalEdit> {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return Err(ChatError::validation("Message text cannot be empty"));
        }
        let me = self.me.user_id.clone();
        let canonical = canonical_message_id(message_id).to_string();
        let message = self
            .messages
            .iter_mut()
            .find(|m| m.message_id == message_id || m.canonical_id() == canonical)
            .ok_or_else(|| ChatError::validation("Message not found"))?;
        if !same_user(&message.sender_id, &me) {
            return Err(ChatError::validation("Only your own messages can be edited"));
        }
        if message.is_optimistic() {
            return Err(ChatError::validation("Message has not been sent yet"));
        }
        if message.text == new_text {
            return Ok(LocalEdit::Unchanged);
        }
        message.text = new_text.to_string();
        message.is_edited = true;
        Ok(LocalEdit::Applied {
            conversation_id: message.conversation_id.clone(),
            message_id: message.canonical_id().to_string(),
        })
    }

    // ---- blocking ----------------------------------------------------

    pub fn is_blocked_user(&self, user_id: &str) -> bool {
        self.blocked.keys().any(|id| same_user(id, user_id))
    }

    fn is_selection_blocked(&self, selection: &Selection) -> bool {
        self.is_blocked_user(&selection.other_participant_id)
            || self
                .find_conversation(&selection.conversation_id)
                .map(|i| self.conversations[i].is_blocked)
                .unwrap_or(false)
    }

    pub fn set_blocked_users(&mut self, users: Vec<BlockedUser>) {
        self.blocked = users
            .into_iter()
            .map(|u| (u.blocked_user_id.clone(), u))
            .collect();
        let blocked: Vec<bool> = self
            .conversations
            .iter()
            .map(|c| self.is_blocked_user(&c.other_participant_id))
            .collect();
        for (conversation, blocked) in self.conversations.iter_mut().zip(blocked) {
            if blocked {
                conversation.is_blocked = true;
            }
        }
    }

    /// We blocked or unblocked `user_id`. Blocking drops their visible
    /// messages and typing state.
    pub fn set_blocked(&mut self, user_id: &str, name: Option<&str>, blocked: bool) {
        if blocked {
            let display = name
                .map(|n| n.to_string())
                .or_else(|| {
                    self.find_conversation_with(user_id)
                        .map(|i| self.conversations[i].display_name.clone())
                })
                .unwrap_or_else(|| user_id.to_string());
            self.blocked.insert(
                user_id.to_string(),
                BlockedUser {
                    blocked_user_id: user_id.to_string(),
                    blocked_user_name: display,
                    blocked_at: Utc::now(),
                },
            );
            let before = self.messages.len();
            self.messages.retain(|m| !same_user(&m.sender_id, user_id));
            if before != self.messages.len() {
                debug!("Removed {} messages from blocked user {}", before - self.messages.len(), user_id);
            }
            self.typing.stop(user_id);
        } else {
            self.blocked.retain(|id, _| !same_user(id, user_id));
        }

        for conversation in &mut self.conversations {
            if same_user(&conversation.other_participant_id, user_id) {
                conversation.is_blocked = blocked;
            }
        }
    }

    pub fn apply_block_status(&mut self, event: &BlockStatusEvent) -> bool {
        let me = self.me.user_id.clone();
        let by_me = event
            .blocker_id
            .as_deref()
            .map(|blocker| same_user(blocker, &me))
            .unwrap_or(!same_user(&event.blocked_id, &me));

        if by_me {
            self.set_blocked(&event.blocked_id, event.blocked_name.as_deref(), event.is_blocked);
            return true;
        }

        // someone blocked us: the thread goes read-only
        if same_user(&event.blocked_id, &me) {
            if let Some(blocker) = event.blocker_id.as_deref() {
                let mut changed = false;
                for conversation in &mut self.conversations {
                    if same_user(&conversation.other_participant_id, blocker) {
                        conversation.is_blocked = event.is_blocked;
                        changed = true;
                    }
                }
                return changed;
            }
        }
        false
    }

    fn without_blocked(&self, messages: Vec<Message>) -> Vec<Message> {
        messages
            .into_iter()
            .filter(|m| !self.is_blocked_user(&m.sender_id))
            .collect()
    }
}

fn upgrade_in_place(existing: &mut Message, incoming: &Message, has_server_id: bool) {
    if has_server_id && existing.is_optimistic() {
        existing.message_id = incoming.message_id.clone();
        existing.timestamp = incoming.timestamp;
    }
    let target = if incoming.status == MessageStatus::Read {
        MessageStatus::Read
    } else {
        MessageStatus::Delivered
    };
    if existing.status != target {
        existing.promote_status(target);
    }
}

/// Stable sort, oldest first.
fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}

/// Most recent activity first; conversations with no messages last.
fn sort_conversations(conversations: &mut [Conversation]) {
    conversations.sort_by(|a, b| b.last_message_timestamp.cmp(&a.last_message_timestamp));
}
