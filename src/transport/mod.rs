// Transport client: the one WebSocket connection per signed-in identity plus
// every REST call the synchronizer needs.

pub mod events;
pub mod frames;
pub mod names;
pub mod reconnect;
pub mod rest;
pub mod wire;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::config::TransportConfig;
use crate::error::{ChatError, Result};
use crate::models::{same_user, Identity};

pub use events::{BusEvent, ConnectionEvent, EventBus, InboundEvent, Subscription};
pub use names::NameResolver;
pub use reconnect::ReconnectPolicy;
pub use rest::{ChatApi, HttpChatApi, MessagePage, OutgoingMessage, SendReceipt};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Socket lifecycle. `Failed` is terminal until the next explicit `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closed,
    Error,
    Failed,
}

impl ConnectionState {
    pub fn is_open(self) -> bool {
        self == ConnectionState::Open
    }

    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "connected",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "connection error",
            ConnectionState::Failed => "offline",
        }
    }
}

#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: TransportConfig,
    api: Arc<dyn ChatApi>,
    names: NameResolver,
    bus: EventBus,
    state: watch::Sender<ConnectionState>,
    sink: TokioMutex<Option<WsSink>>,
    identity: TokioMutex<Option<Identity>>,
    intentional_close: AtomicBool,
    driver: TokioMutex<Option<JoinHandle<()>>>,
    liveness: TokioMutex<Option<JoinHandle<()>>>,
}

impl TransportClient {
    pub fn new(config: TransportConfig, api: Arc<dyn ChatApi>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        TransportClient {
            inner: Arc::new(Inner {
                bus: EventBus::new(config.event_buffer),
                names: NameResolver::new(api.clone()),
                config,
                api,
                state,
                sink: TokioMutex::new(None),
                identity: TokioMutex::new(None),
                intentional_close: AtomicBool::new(false),
                driver: TokioMutex::new(None),
                liveness: TokioMutex::new(None),
            }),
        }
    }

    /// Client backed by the HTTP backend described in `config`.
    pub fn with_http(config: TransportConfig) -> Self {
        let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(&config));
        TransportClient::new(config, api)
    }

    pub fn api(&self) -> &Arc<dyn ChatApi> {
        &self.inner.api
    }

    pub fn names(&self) -> &NameResolver {
        &self.inner.names
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.bus
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.bus.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Open the gateway connection for `identity`. Returns once the driver
    /// task is running; `ConnectionEvent::Connected` announces the open.
    pub async fn connect(&self, identity: &Identity) -> Result<()> {
        let state = self.state();
        if state == ConnectionState::Connecting {
            debug!("Connect requested while already connecting, ignoring");
            return Ok(());
        }
        if state == ConnectionState::Open
            && self.inner.identity.lock().await.as_ref() == Some(identity)
        {
            debug!("Already connected as {}", identity.user_id);
            return Ok(());
        }

        self.inner.start_driver(identity).await?;
        self.ensure_liveness().await;
        Ok(())
    }

    /// Intentional close: no reconnect follows.
    pub async fn disconnect(&self) {
        info!("Disconnecting from chat gateway");
        self.inner.intentional_close.store(true, Ordering::SeqCst);
        if let Some(liveness) = self.inner.liveness.lock().await.take() {
            liveness.abort();
        }
        if let Some(driver) = self.inner.driver.lock().await.take() {
            driver.abort();
        }
        self.inner.close_sink().await;

        let was_connected = self.state().is_open();
        self.inner.set_state(ConnectionState::Disconnected);
        if was_connected {
            self.inner
                .bus
                .publish_connection(ConnectionEvent::Disconnected { clean: true });
        }
    }

    /// Send `{action, data}` over the open socket. Not being connected is an
    /// error, never a silent drop.
    pub async fn send_frame(&self, action: &str, data: Value) -> Result<()> {
        if !self.state().is_open() {
            return Err(ChatError::NotConnected);
        }
        let mut guard = self.inner.sink.lock().await;
        let sink = guard.as_mut().ok_or(ChatError::NotConnected)?;
        let frame = json!({ "action": action, "data": data });
        sink.send(WsMessage::Text(frame.to_string())).await?;
        Ok(())
    }

    /// Low-latency notification of a new message. The REST send is still the
    /// path of record.
    pub async fn notify_message(&self, message: &OutgoingMessage, temp_id: &str) -> Result<()> {
        let mut data = serde_json::to_value(message)?;
        data["tempId"] = json!(temp_id);
        self.send_frame("sendMessage", data).await
    }

    pub async fn send_typing(
        &self,
        conversation_id: &str,
        user_id: &str,
        receiver_id: &str,
        is_typing: bool,
    ) -> Result<()> {
        self.send_frame(
            "typing",
            json!({
                "conversationId": conversation_id,
                "userId": user_id,
                "receiverId": receiver_id,
                "isTyping": is_typing,
            }),
        )
        .await
    }

    /// Block over the socket when it is open and the gateway echoes the new
    /// block status, otherwise through REST. `Ok` means the backend confirmed.
    pub async fn block_user(&self, user_id: &str, blocked_user_id: &str) -> Result<()> {
        match self.confirm_block_via_socket("blockUser", user_id, blocked_user_id, true).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Blocking via REST ({})", e);
                self.inner.api.block_user(user_id, blocked_user_id).await
            }
        }
    }

    pub async fn unblock_user(&self, user_id: &str, blocked_user_id: &str) -> Result<()> {
        match self.confirm_block_via_socket("unblockUser", user_id, blocked_user_id, false).await {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!("Unblocking via REST ({})", e);
                self.inner.api.unblock_user(user_id, blocked_user_id).await
            }
        }
    }

    async fn confirm_block_via_socket(
        &self,
        action: &str,
        user_id: &str,
        blocked_user_id: &str,
        is_blocked: bool,
    ) -> Result<()> {
        // subscribe before sending so the echo cannot slip past
        let mut events = self.subscribe();
        let data = json!({ "userId": user_id, "blockedUserId": blocked_user_id });
        self.send_frame(action, data).await?;

        let echoed = async {
            while let Some(event) = events.recv().await {
                if let BusEvent::Inbound(InboundEvent::BlockStatus(status)) = event {
                    if same_user(&status.blocked_id, blocked_user_id) && status.is_blocked == is_blocked {
                        return true;
                    }
                }
            }
            false
        };
        match tokio::time::timeout(self.inner.config.block_ack_timeout(), echoed).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ChatError::NotConnected),
            Err(_) => Err(ChatError::Other(format!(
                "no block status echo for {} from the gateway",
                blocked_user_id
            ))),
        }
    }

    async fn ensure_liveness(&self) {
        let mut slot = self.inner.liveness.lock().await;
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let interval = self.inner.config.liveness_interval();
        *slot = Some(tokio::spawn(run_liveness(Arc::downgrade(&self.inner), interval)));
    }
}

impl Inner {
    /// Replace any running driver with one connecting as `identity`.
    async fn start_driver(self: &Arc<Self>, identity: &Identity) -> Result<()> {
        let url = gateway_url(&self.config.gateway_url, identity)?;
        info!("Connecting to chat gateway as {} ({})", identity.user_id, identity.role);

        *self.identity.lock().await = Some(identity.clone());
        self.intentional_close.store(false, Ordering::SeqCst);

        // a previous connection for another identity has to go first
        if let Some(old) = self.driver.lock().await.take() {
            old.abort();
        }
        self.close_sink().await;

        self.set_state(ConnectionState::Connecting);
        let handle = tokio::spawn(run_driver(self.clone(), url));
        *self.driver.lock().await = Some(handle);
        Ok(())
    }

    async fn close_sink(&self) {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.send(WsMessage::Close(None)).await {
                debug!("Close frame not sent: {}", e);
            }
            if let Err(e) = sink.close().await {
                debug!("Socket close failed: {}", e);
            }
        }
    }

    /// Reopen when the socket is gone without us having noticed a close.
    /// Returns whether a reconnect was started.
    async fn check_liveness(self: &Arc<Self>) -> bool {
        if self.intentional_close.load(Ordering::SeqCst) {
            return false;
        }
        let state = *self.state.borrow();
        if !matches!(
            state,
            ConnectionState::Closed | ConnectionState::Error | ConnectionState::Disconnected
        ) {
            return false;
        }
        let driver_running = self
            .driver
            .lock()
            .await
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if driver_running {
            return false;
        }
        let identity = match self.identity.lock().await.clone() {
            Some(identity) => identity,
            None => return false,
        };

        warn!("Liveness check found the socket {}, reconnecting", state.label());
        match self.start_driver(&identity).await {
            Ok(()) => true,
            Err(e) => {
                error!("Liveness reconnect failed: {}", e);
                false
            }
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!("Connection state {:?} -> {:?}", previous, next);
        }
    }

    fn dispatch(&self, text: &str) {
        match frames::classify(text) {
            Ok(Some(event)) => {
                self.bus.publish(event);
            }
            Ok(None) => debug!("Ignoring unrecognized frame: {}", text),
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }
}

fn gateway_url(base: &str, identity: &Identity) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .append_pair("userId", &identity.user_id)
        .append_pair("userRole", &identity.role)
        .append_pair("userName", &identity.name);
    Ok(url)
}

/// Connect, pump frames, and reconnect with backoff after unclean closes
/// until the policy runs out.
async fn run_driver(inner: Arc<Inner>, url: Url) {
    let mut policy = ReconnectPolicy::new(
        inner.config.backoff_base(),
        inner.config.max_reconnect_attempts,
    );

    loop {
        inner.set_state(ConnectionState::Connecting);
        let clean = match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                policy.reset();
                let (sink, mut stream) = socket.split();
                *inner.sink.lock().await = Some(sink);
                inner.set_state(ConnectionState::Open);
                info!("Connected to chat gateway");
                inner.bus.publish_connection(ConnectionEvent::Connected);

                let clean = read_frames(&inner, &mut stream).await;

                inner.sink.lock().await.take();
                inner.set_state(if clean {
                    ConnectionState::Closed
                } else {
                    ConnectionState::Error
                });
                info!("Chat gateway connection closed (clean: {})", clean);
                inner
                    .bus
                    .publish_connection(ConnectionEvent::Disconnected { clean });
                clean
            }
            Err(e) => {
                warn!("Failed to open chat gateway connection: {}", e);
                inner.set_state(ConnectionState::Error);
                false
            }
        };

        if inner.intentional_close.load(Ordering::SeqCst) {
            inner.set_state(ConnectionState::Disconnected);
            return;
        }
        if clean {
            return;
        }

        match policy.next_delay() {
            Some(delay) => {
                inner.bus.publish_connection(ConnectionEvent::Reconnecting {
                    attempt: policy.attempts(),
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
            None => {
                error!(
                    "Giving up on the chat gateway after {} reconnect attempts",
                    policy.attempts()
                );
                inner.set_state(ConnectionState::Failed);
                inner.bus.publish_connection(ConnectionEvent::ReconnectFailed {
                    attempts: policy.attempts(),
                });
                return;
            }
        }
    }
}

/// Returns whether the socket ended with a normal close.
async fn read_frames<S>(inner: &Inner, stream: &mut S) -> bool
where
    S: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    while let Some(message) = stream.next().await {
        match message {
            Ok(WsMessage::Text(text)) => inner.dispatch(&text),
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => inner.dispatch(&text),
                Err(_) => debug!("Ignoring non-UTF-8 binary frame"),
            },
            Ok(WsMessage::Ping(payload)) => {
                if let Some(sink) = inner.sink.lock().await.as_mut() {
                    if let Err(e) = sink.send(WsMessage::Pong(payload)).await {
                        warn!("Failed to answer ping: {}", e);
                    }
                }
            }
            Ok(WsMessage::Close(frame)) => {
                debug!("Close frame received: {:?}", frame);
                return frame.map(|f| f.code == CloseCode::Normal).unwrap_or(false);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Chat gateway stream error: {}", e);
                return false;
            }
        }
    }
    false
}

async fn run_liveness(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => return,
        };
        inner.check_liveness().await;
    }
}
