// Conversation synchronizer: reconciles the gateway event stream with REST
// history and publishes one snapshot for the view to render.

pub mod matching;
pub mod pending;
pub mod state;
pub mod typing;

use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

use crate::config::SyncConfig;
use crate::error::{ChatError, ErrorKind, Result};
use crate::models::{is_placeholder_name, same_user, ConversationRef, Identity, Message};
use crate::transport::events::{BusEvent, ConnectionEvent, InboundEvent, MessageEvent, TypingEvent};
use crate::transport::rest::OutgoingMessage;
use crate::transport::{ConnectionState, TransportClient};

pub use matching::{match_event, same_conversation, EventRoute, MatchOutcome, MatchReason};
pub use pending::PendingSendRegistry;
pub use state::{ChatSnapshot, ChatState, Ingest, LocalEdit, Selection};

#[derive(Clone)]
pub struct ChatSynchronizer {
    inner: Arc<Inner>,
}

struct Inner {
    me: Identity,
    transport: TransportClient,
    config: SyncConfig,
    state: TokioMutex<ChatState>,
    snapshot: watch::Sender<ChatSnapshot>,
    unread_scheduled: AtomicBool,
    connected_before: AtomicBool,
    event_loop: TokioMutex<Option<JoinHandle<()>>>,
}

impl ChatSynchronizer {
    pub fn new(me: Identity, transport: TransportClient, config: SyncConfig) -> Self {
        let state = ChatState::new(me.clone(), &config);
        let (snapshot, _) = watch::channel(state.snapshot());
        ChatSynchronizer {
            inner: Arc::new(Inner {
                me,
                transport,
                config,
                state: TokioMutex::new(state),
                snapshot,
                unread_scheduled: AtomicBool::new(false),
                connected_before: AtomicBool::new(false),
                event_loop: TokioMutex::new(None),
            }),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.me
    }

    pub fn transport(&self) -> &TransportClient {
        &self.inner.transport
    }

    /// Receiver that sees every published snapshot.
    pub fn watch(&self) -> watch::Receiver<ChatSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Apply `f` to the state and publish the result if it changed. The lock
    /// is never held across a network call.
    async fn mutate<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        let mut state = self.inner.state.lock().await;
        let result = f(&mut state);
        let next = state.snapshot();
        self.inner.snapshot.send_if_modified(|current| {
            if *current != next {
                *current = next;
                true
            } else {
                false
            }
        });
        result
    }

    /// Read (or change unpublished parts of) the state.
    async fn with_state<R>(&self, f: impl FnOnce(&mut ChatState) -> R) -> R {
        let mut state = self.inner.state.lock().await;
        f(&mut state)
    }

    /// Surface an error in the view. Validation failures are only returned,
    /// never shown.
    async fn report(&self, error: &ChatError) {
        if error.kind() == ErrorKind::Validation {
            return;
        }
        self.mutate(|s| s.set_error(error)).await;
    }

    // ---- lifecycle ---------------------------------------------------

    /// Subscribe to the gateway, connect, and load the session.
    pub async fn start(&self) -> Result<()> {
        self.spawn_event_loop().await;
        self.inner.transport.connect(&self.inner.me).await?;
        self.initialize().await
    }

    pub async fn spawn_event_loop(&self) {
        let mut slot = self.inner.event_loop.lock().await;
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let mut subscription = self.inner.transport.subscribe();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        *slot = Some(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                let inner = match weak.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                ChatSynchronizer { inner }.handle_event(event).await;
            }
            debug!("Chat event loop finished");
        }));
    }

    pub async fn shutdown(&self) {
        self.stop_typing().await;
        if let Some(handle) = self.inner.event_loop.lock().await.take() {
            handle.abort();
        }
        self.inner.transport.disconnect().await;
    }

    /// Conversations, blocked users and unread counts for the session, then
    /// display names for anything still showing a placeholder.
    pub async fn initialize(&self) -> Result<()> {
        let api = self.inner.transport.api().clone();
        let user_id = self.inner.me.user_id.clone();

        match api.blocked_users(&user_id).await {
            Ok(blocked) => self.mutate(|s| s.set_blocked_users(blocked)).await,
            Err(e) => warn!("Could not load blocked users: {}", e),
        }
        self.load_conversations().await
    }

    pub async fn load_conversations(&self) -> Result<()> {
        let api = self.inner.transport.api().clone();
        let conversations = match api.list_conversations(&self.inner.me.user_id).await {
            Ok(conversations) => conversations,
            Err(e) => {
                error!("Failed to load conversations: {}", e);
                self.report(&e).await;
                return Err(e);
            }
        };
        info!("Loaded {} conversations", conversations.len());
        self.mutate(|s| s.set_conversations(conversations)).await;
        self.refresh_unread_counts().await;
        self.resolve_missing_names().await;
        Ok(())
    }

    pub async fn clear_error(&self) {
        self.mutate(|s| s.clear_error()).await;
    }

    // ---- selection ---------------------------------------------------

    /// Open a conversation and load its latest history. A selection made
    /// while this one is still loading wins; this one's results are dropped.
    pub async fn select_conversation(&self, reference: ConversationRef) -> Result<()> {
        self.stop_typing().await;
        let selection = self.mutate(|s| s.select(&reference)).await;

        if is_placeholder_name(&selection.display_name, &selection.other_participant_id) {
            let this = self.clone();
            let other = selection.other_participant_id.clone();
            tokio::spawn(async move {
                this.resolve_names(vec![other]).await;
            });
        }

        let api = self.inner.transport.api().clone();
        let page = api
            .fetch_messages(&selection.conversation_id, self.inner.config.history_page_size, None)
            .await;

        let page = match page {
            Ok(page) => page,
            Err(e) => {
                let current = self
                    .mutate(|s| {
                        s.history_failed(selection.generation);
                        s.is_current(selection.generation)
                    })
                    .await;
                if current {
                    error!("Failed to load history for {}: {}", selection.conversation_id, e);
                    self.report(&e).await;
                }
                return Err(e);
            }
        };

        let applied = self.mutate(|s| s.apply_history(selection.generation, page)).await;
        if !applied {
            return Ok(());
        }
        self.mark_read(&selection).await;
        Ok(())
    }

    async fn mark_read(&self, selection: &Selection) {
        let api = self.inner.transport.api().clone();
        match api.mark_read(&selection.conversation_id, &self.inner.me.user_id).await {
            Ok(()) => {
                self.mutate(|s| s.mark_incoming_read(selection.generation)).await;
                self.schedule_unread_refresh();
            }
            Err(e) => warn!("Mark-read for {} failed: {}", selection.conversation_id, e),
        }
    }

    /// Fetch the page before the oldest loaded message.
    pub async fn load_older_messages(&self) -> Result<()> {
        let target = self
            .with_state(|s| {
                let selection = s.selection().cloned()?;
                let cursor = s.history_cursor()?.to_string();
                Some((selection, cursor))
            })
            .await;
        let (selection, cursor) = match target {
            Some(target) => target,
            None => return Ok(()),
        };

        let api = self.inner.transport.api().clone();
        match api
            .fetch_messages(
                &selection.conversation_id,
                self.inner.config.history_page_size,
                Some(&cursor),
            )
            .await
        {
            Ok(page) => {
                self.mutate(|s| s.prepend_older(selection.generation, page)).await;
                Ok(())
            }
            Err(e) => {
                self.report(&e).await;
                Err(e)
            }
        }
    }

    /// Replace the visible history with the backend's copy.
    async fn refetch_history(&self, generation: u64, conversation_id: &str) {
        let api = self.inner.transport.api().clone();
        match api
            .fetch_messages(conversation_id, self.inner.config.history_page_size, None)
            .await
        {
            Ok(page) => {
                self.mutate(|s| s.replace_history(generation, page)).await;
            }
            Err(e) => warn!("Refetch of {} failed: {}", conversation_id, e),
        }
    }

    fn schedule_refetch(&self, generation: u64, conversation_id: String) {
        let this = self.clone();
        let delay = self.inner.config.confirm_refetch_delay();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.refetch_history(generation, &conversation_id).await;
        });
    }

    // ---- sending -----------------------------------------------------

    /// Optimistic send: the message shows immediately, then REST confirms
    /// or fails it.
    pub async fn send(&self, text: &str) -> Result<()> {
        let message = self.mutate(|s| s.begin_send(text, Utc::now())).await?;
        self.stop_typing().await;
        self.submit(message).await
    }

    /// Resubmit a failed message.
    pub async fn retry_send(&self, message_id: &str) -> Result<()> {
        let message = self.mutate(|s| s.prepare_retry(message_id, Utc::now())).await?;
        info!("Retrying send of {}", message.message_id);
        self.submit(message).await
    }

    async fn submit(&self, message: Message) -> Result<()> {
        let outgoing = OutgoingMessage {
            conversation_id: message.conversation_id.clone(),
            sender_id: message.sender_id.clone(),
            sender_name: message.sender_name.clone(),
            receiver_id: message.receiver_id.clone(),
            receiver_name: message.receiver_name.clone(),
            text: message.text.clone(),
        };

        if let Err(e) = self
            .inner
            .transport
            .notify_message(&outgoing, &message.message_id)
            .await
        {
            debug!("Socket notification for {} skipped: {}", message.message_id, e);
        }

        let api = self.inner.transport.api().clone();
        match api.send_message(&outgoing).await {
            Ok(receipt) => {
                debug!("Message {} stored as {}", message.message_id, receipt.message_id);
                self.mutate(|s| s.confirm_send(&message.message_id, &receipt)).await;
                self.schedule_unread_refresh();
                Ok(())
            }
            Err(e) => {
                self.mutate(|s| s.fail_send(&message.message_id, &e)).await;
                Err(e)
            }
        }
    }

    // ---- typing ------------------------------------------------------

    /// Keystroke (`true`) or explicit stop (`false`) in the composer.
    pub async fn set_typing(&self, is_typing: bool) {
        if !is_typing {
            self.stop_typing().await;
            return;
        }

        let armed = self
            .with_state(|s| {
                let selection = s.selection()?.clone();
                let (epoch, started) = s
                    .outbound_typing
                    .keystroke(&selection.conversation_id, &selection.other_participant_id);
                Some((selection, epoch, started))
            })
            .await;
        let (selection, epoch, started) = match armed {
            Some(armed) => armed,
            None => return,
        };

        if started {
            self.send_typing_signal(&selection.conversation_id, &selection.other_participant_id, true)
                .await;
        }

        let this = self.clone();
        let idle = self.inner.config.typing_idle();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            if let Some(active) = this.with_state(|s| s.outbound_typing.expire(epoch)).await {
                this.send_typing_signal(&active.conversation_id, &active.receiver_id, false)
                    .await;
            }
        });
    }

    async fn stop_typing(&self) {
        if let Some(active) = self.with_state(|s| s.outbound_typing.stop()).await {
            self.send_typing_signal(&active.conversation_id, &active.receiver_id, false)
                .await;
        }
    }

    async fn send_typing_signal(&self, conversation_id: &str, receiver_id: &str, is_typing: bool) {
        if let Err(e) = self
            .inner
            .transport
            .send_typing(conversation_id, &self.inner.me.user_id, receiver_id, is_typing)
            .await
        {
            debug!("Typing signal not sent: {}", e);
        }
    }

    // ---- delete / edit -----------------------------------------------

    /// Remove a message now, then confirm with the backend. Unsent messages
    /// only ever existed locally.
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let (removed, generation) = self
            .mutate(|s| {
                let generation = s.selection().map(|sel| sel.generation);
                (s.remove_message(message_id), generation)
            })
            .await;
        let removed = removed.ok_or_else(|| ChatError::validation("Message not found"))?;
        if removed.is_optimistic() {
            info!("Discarded unsent message {}", removed.message_id);
            return Ok(());
        }
        let generation = generation.unwrap_or_default();

        let api = self.inner.transport.api().clone();
        match api
            .delete_message(&removed.conversation_id, removed.canonical_id(), &self.inner.me.user_id)
            .await
        {
            Ok(()) => {
                self.schedule_refetch(generation, removed.conversation_id.clone());
                Ok(())
            }
            Err(e) => {
                error!("Delete of {} failed: {}", removed.message_id, e);
                self.report(&e).await;
                self.refetch_history(generation, &removed.conversation_id).await;
                Err(e)
            }
        }
    }

    pub async fn edit_message(&self, message_id: &str, new_text: &str) -> Result<()> {
        let (edit, generation) = self
            .mutate(|s| {
                let generation = s.selection().map(|sel| sel.generation);
                (s.apply_local_edit(message_id, new_text), generation)
            })
            .await;
        let (conversation_id, canonical_id) = match edit? {
            LocalEdit::Unchanged => return Ok(()),
            LocalEdit::Applied {
                conversation_id,
                message_id,
            } => (conversation_id, message_id),
        };
        let generation = generation.unwrap_or_default();

        let api = self.inner.transport.api().clone();
        match api
            .edit_message(&conversation_id, &canonical_id, &self.inner.me.user_id, new_text.trim())
            .await
        {
            Ok(()) => {
                self.schedule_refetch(generation, conversation_id);
                Ok(())
            }
            Err(e) => {
                error!("Edit of {} failed: {}", canonical_id, e);
                self.report(&e).await;
                self.refetch_history(generation, &conversation_id).await;
                Err(e)
            }
        }
    }

    // ---- blocking ----------------------------------------------------

    pub async fn block(&self, user_id: &str) -> Result<()> {
        if let Err(e) = self
            .inner
            .transport
            .block_user(&self.inner.me.user_id, user_id)
            .await
        {
            self.report(&e).await;
            return Err(e);
        }
        info!("Blocked {}", user_id);
        self.mutate(|s| s.set_blocked(user_id, None, true)).await;
        self.schedule_unread_refresh();
        Ok(())
    }

    pub async fn unblock(&self, user_id: &str) -> Result<()> {
        if let Err(e) = self
            .inner
            .transport
            .unblock_user(&self.inner.me.user_id, user_id)
            .await
        {
            self.report(&e).await;
            return Err(e);
        }
        info!("Unblocked {}", user_id);
        let active = self
            .mutate(|s| {
                s.set_blocked(user_id, None, false);
                s.selection()
                    .filter(|sel| same_user(&sel.other_participant_id, user_id))
                    .map(|sel| (sel.generation, sel.conversation_id.clone()))
            })
            .await;
        // their messages were purged while blocked
        if let Some((generation, conversation_id)) = active {
            self.refetch_history(generation, &conversation_id).await;
        }
        self.schedule_unread_refresh();
        Ok(())
    }

    // ---- unread counts and names -------------------------------------

    pub async fn refresh_unread_counts(&self) {
        let api = self.inner.transport.api().clone();
        match api.unread_counts(&self.inner.me.user_id).await {
            Ok(counts) => self.mutate(|s| s.apply_unread_counts(&counts)).await,
            Err(e) => warn!("Unread count refresh failed: {}", e),
        }
    }

    /// Coalesce bursts of refresh requests into one backend query.
    pub fn schedule_unread_refresh(&self) {
        if self.inner.unread_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = self.clone();
        let delay = self.inner.config.unread_debounce();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.inner.unread_scheduled.store(false, Ordering::SeqCst);
            this.refresh_unread_counts().await;
        });
    }

    async fn resolve_missing_names(&self) {
        let ids = self.with_state(|s| s.unresolved_participants()).await;
        if !ids.is_empty() {
            self.resolve_names(ids).await;
        }
    }

    async fn resolve_names(&self, ids: Vec<String>) {
        let names = self.inner.transport.names().resolve_many(ids).await;
        if !names.is_empty() {
            self.mutate(|s| s.apply_names(&names)).await;
        }
    }

    // ---- inbound events ----------------------------------------------

    pub async fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Connection(event) => self.on_connection(event).await,
            BusEvent::Inbound(InboundEvent::Message(event)) => self.on_message(event).await,
            BusEvent::Inbound(InboundEvent::Typing(event)) => self.on_typing(event).await,
            BusEvent::Inbound(InboundEvent::Deleted(event)) => {
                self.mutate(|s| s.apply_remote_deletion(&event)).await;
                self.schedule_unread_refresh();
            }
            BusEvent::Inbound(InboundEvent::Edited(event)) => {
                self.mutate(|s| s.apply_remote_edit(&event)).await;
            }
            BusEvent::Inbound(InboundEvent::ReadReceipt(event)) => {
                self.mutate(|s| s.apply_read_receipt(&event)).await;
            }
            BusEvent::Inbound(InboundEvent::BlockStatus(event)) => {
                self.mutate(|s| s.apply_block_status(&event)).await;
                self.schedule_unread_refresh();
            }
            BusEvent::Inbound(InboundEvent::Presence(event)) => {
                self.mutate(|s| s.apply_presence(&event)).await;
            }
        }
    }

    async fn on_connection(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.mutate(|s| s.set_connection(ConnectionState::Open)).await;
                if self.inner.connected_before.swap(true, Ordering::SeqCst) {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.catch_up().await;
                    });
                }
            }
            ConnectionEvent::Disconnected { clean } => {
                let state = if clean {
                    ConnectionState::Closed
                } else {
                    ConnectionState::Error
                };
                self.mutate(|s| s.set_connection(state)).await;
            }
            ConnectionEvent::Reconnecting { attempt, delay } => {
                debug!("Reconnect attempt {} in {:?}", attempt, delay);
                self.mutate(|s| s.set_connection(ConnectionState::Connecting)).await;
            }
            ConnectionEvent::ReconnectFailed { attempts } => {
                let error = ChatError::Other(format!(
                    "Lost connection to the chat server after {} reconnect attempts",
                    attempts
                ));
                self.mutate(|s| {
                    s.set_connection(ConnectionState::Failed);
                    s.set_error(&error);
                })
                .await;
            }
        }
    }

    /// Reload whatever may have been missed while the socket was down.
    async fn catch_up(&self) {
        info!("Reconnected, catching up");
        if let Err(e) = self.load_conversations().await {
            warn!("Catch-up conversation reload failed: {}", e);
        }
        let active = self
            .with_state(|s| s.selection().map(|sel| (sel.generation, sel.conversation_id.clone())))
            .await;
        if let Some((generation, conversation_id)) = active {
            self.refetch_history(generation, &conversation_id).await;
        }
    }

    async fn on_message(&self, event: MessageEvent) {
        let (outcome, viewing) = self
            .mutate(|s| {
                let outcome = s.ingest_message(&event);
                (outcome, s.selection().cloned())
            })
            .await;
        if outcome == Ingest::Discarded {
            return;
        }

        let from_other = event
            .sender_id
            .as_deref()
            .map(|sender| !same_user(sender, &self.inner.me.user_id))
            .unwrap_or(true);
        if outcome == Ingest::Appended && from_other {
            if let Some(selection) = viewing {
                let this = self.clone();
                tokio::spawn(async move {
                    this.mark_read(&selection).await;
                });
            }
        }

        self.schedule_unread_refresh();

        let this = self.clone();
        tokio::spawn(async move {
            this.resolve_missing_names().await;
        });
    }

    async fn on_typing(&self, event: TypingEvent) {
        let started = event.is_typing;
        let changed = self.mutate(|s| s.apply_typing(&event, Instant::now())).await;
        if changed && started {
            let this = self.clone();
            let expiry = self.inner.config.typing_expiry();
            tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                this.mutate(|s| s.prune_typing(Instant::now())).await;
            });
        }
    }
}
