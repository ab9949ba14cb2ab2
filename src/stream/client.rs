//! Reconnecting stream client.
//!
//! A single background worker owns the websocket, the outbound queue and the
//! reconnect state. [`WebSocketClient`] handles talk to it over a command
//! channel, so every state transition happens on one task and connection
//! attempts never overlap.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{Credentials, SessionStore};
use crate::config::{ClientConfig, ConfigError};
use crate::retry::{with_timeout, ReconnectDecision, ReconnectState};
use crate::stream::notify::{LogNotifier, Notice, Notifier};
use crate::stream::proto::{classify_close, CloseKind, Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Lifecycle of the stream connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, first attempt not started yet.
    Idle,
    Connecting,
    Open,
    /// Waiting for automatic retry number `attempt`.
    Reconnecting { attempt: u32 },
    /// Closed normally. Only a send reopens it.
    Closed,
    /// Automatic reconnects exhausted.
    GivenUp,
    /// Server rejected the session credentials.
    AuthRejected,
    /// Worker stopped; the client is unusable.
    Shutdown,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "Idle"),
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Reconnecting { attempt } => write!(f, "Reconnecting({attempt})"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::GivenUp => write!(f, "GivenUp"),
            ConnectionState::AuthRejected => write!(f, "AuthRejected"),
            ConnectionState::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Errors produced while building or connecting the stream client.
#[derive(Debug, Error)]
pub enum StreamClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Websocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("no session credentials available")]
    MissingCredentials,

    /// The handshake was refused because of the credentials.
    #[error("server rejected credentials: {0}")]
    AuthRejected(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
}

impl StreamClientError {
    fn is_auth_rejection(&self) -> bool {
        matches!(self, Self::MissingCredentials | Self::AuthRejected(_))
    }
}

/// Builder for [`WebSocketClient`].
pub struct WebSocketClientBuilder {
    config: ClientConfig,
    session: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
}

impl WebSocketClientBuilder {
    pub fn notifier(mut self, notifier: impl Notifier) -> Self {
        self.notifier = Arc::new(notifier);
        self
    }

    pub fn shared_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Validates the configuration, spawns the connection worker on the
    /// current tokio runtime and starts the first connection attempt.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn spawn(self) -> Result<WebSocketClient, StreamClientError> {
        let endpoint = self.config.stream_url()?;

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let shared = Arc::new(Shared::default());

        let worker = Worker {
            endpoint,
            config: self.config,
            session: self.session,
            notifier: self.notifier,
            shared: Arc::clone(&shared),
            state_tx,
            pending: VecDeque::new(),
            reconnect: ReconnectState::default(),
            retry_at: None,
            outage_reported: false,
        };
        tokio::spawn(worker.run(command_rx));

        Ok(WebSocketClient {
            commands: command_tx,
            shared,
            state: state_rx,
        })
    }
}

/// Handle to the reconnecting stream connection.
///
/// Cloning is cheap. The worker closes the socket and stops once every
/// handle is dropped or [`WebSocketClient::close`] is called.
#[derive(Clone)]
pub struct WebSocketClient {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for WebSocketClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketClient")
            .field("state", &*self.state.borrow())
            .field("queued", &self.queued_len())
            .finish_non_exhaustive()
    }
}

impl WebSocketClient {
    pub fn builder(config: ClientConfig, session: Arc<dyn SessionStore>) -> WebSocketClientBuilder {
        WebSocketClientBuilder {
            config,
            session,
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Spawns a client that reports notices through `tracing`.
    pub fn spawn(
        config: ClientConfig,
        session: Arc<dyn SessionStore>,
    ) -> Result<Self, StreamClientError> {
        Self::builder(config, session).spawn()
    }

    /// Sends `message`, connecting first if needed.
    ///
    /// Returns `true` once the message was written to a live socket. `false`
    /// means it was queued for delivery after the next successful connection.
    /// While disconnected this makes exactly one connection attempt and waits
    /// for it. Payload encoding errors surface earlier, from
    /// [`Message::with_payload`].
    pub async fn send_message(&self, message: Message) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Send {
                message,
                reply: reply_tx,
            })
            .is_err()
        {
            warn!(event = "stream_send_after_shutdown");
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    /// Registers `callback` for every inbound message.
    ///
    /// Callbacks run on the connection worker in subscription order and
    /// should return quickly. A panicking callback loses that one delivery;
    /// the connection and the other subscribers are unaffected.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.shared.subscribers.add(Arc::new(callback))
    }

    /// Whether the socket is open right now.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Number of messages waiting for a connection.
    pub fn queued_len(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Closes the socket with a normal closure and stops the worker.
    ///
    /// Returns the messages still waiting for a connection, oldest first.
    pub async fn close(&self) -> Vec<Message> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Close { reply: reply_tx }).is_err() {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// Token returned by [`WebSocketClient::subscribe`].
///
/// Dropping it keeps the callback registered; call
/// [`Subscription::unsubscribe`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    active: Arc<AtomicBool>,
    registry: Weak<Subscribers>,
}

impl Subscription {
    /// Removes this callback. No message is delivered to it afterwards,
    /// including the rest of a dispatch already in progress.
    pub fn unsubscribe(self) {
        self.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Shared {
    connected: AtomicBool,
    queued: AtomicUsize,
    subscribers: Arc<Subscribers>,
}

struct SubscriberEntry {
    id: u64,
    active: Arc<AtomicBool>,
    callback: Callback,
}

/// Ordered callback registry.
#[derive(Default)]
struct Subscribers {
    next_id: AtomicU64,
    entries: Mutex<Vec<SubscriberEntry>>,
}

impl Subscribers {
    fn add(self: &Arc<Self>, callback: Callback) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SubscriberEntry {
                id,
                active: Arc::clone(&active),
                callback,
            });
        Subscription {
            id,
            active,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| entry.id != id);
    }

    fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Invokes callbacks outside the lock so they may (un)subscribe.
    fn dispatch(&self, message: &Message) {
        let snapshot: Vec<(Arc<AtomicBool>, Callback)> = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|entry| (Arc::clone(&entry.active), Arc::clone(&entry.callback)))
            .collect();

        for (active, callback) in snapshot {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                warn!(event = "stream_subscriber_panicked", kind = %message.kind);
            }
        }
    }
}

enum Command {
    Send {
        message: Message,
        reply: oneshot::Sender<bool>,
    },
    Close {
        reply: oneshot::Sender<Vec<Message>>,
    },
}

enum SessionEnd {
    Shutdown,
    Closed { kind: CloseKind, detail: String },
}

enum Transmit {
    Sent,
    /// The socket failed; the message was queued.
    Failed(String),
}

struct Worker {
    endpoint: Url,
    config: ClientConfig,
    session: Arc<dyn SessionStore>,
    notifier: Arc<dyn Notifier>,
    shared: Arc<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    pending: VecDeque<Message>,
    reconnect: ReconnectState,
    retry_at: Option<Instant>,
    outage_reported: bool,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut socket = self.connect_automatic().await;

        loop {
            if let Some(mut ws) = socket.take() {
                match self.run_session(&mut ws, &mut commands).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Closed { kind, detail } => self.on_session_closed(kind, detail),
                }
                continue;
            }

            let retry_at = self.retry_at;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { message, reply }) => {
                        socket = self.connect_for_send(message, reply).await;
                    }
                    Some(Command::Close { reply }) => {
                        let _ = reply.send(self.take_pending());
                        break;
                    }
                    None => break,
                },
                _ = wait_until(retry_at) => {
                    self.retry_at = None;
                    socket = self.connect_automatic().await;
                }
            }
        }

        debug!(event = "stream_worker_stopped");
    }

    /// Attempt driven by construction or a retry timer.
    async fn connect_automatic(&mut self) -> Option<Socket> {
        self.set_state(ConnectionState::Connecting);
        match self.open().await {
            Ok(ws) => Some(ws),
            Err(err) if err.is_auth_rejection() => {
                self.on_auth_rejected(&err.to_string());
                None
            }
            Err(err) => {
                self.report_outage(err.to_string());
                self.schedule_retry();
                None
            }
        }
    }

    /// One fresh attempt on behalf of a send. Failures queue the message and
    /// leave the automatic sequence untouched.
    async fn connect_for_send(
        &mut self,
        message: Message,
        reply: oneshot::Sender<bool>,
    ) -> Option<Socket> {
        let previous = *self.state_tx.borrow();
        self.set_state(ConnectionState::Connecting);

        let mut ws = match self.open().await {
            Ok(ws) => ws,
            Err(err) => {
                if err.is_auth_rejection() {
                    self.on_auth_rejected(&err.to_string());
                } else {
                    debug!(event = "stream_manual_connect_failed", error = %err);
                    self.set_state(previous);
                }
                self.enqueue(message);
                let _ = reply.send(false);
                return None;
            }
        };

        if let Err(detail) = self.flush_pending(&mut ws).await {
            self.enqueue(message);
            let _ = reply.send(false);
            self.on_session_closed(CloseKind::Abnormal, detail);
            return None;
        }

        match self.transmit(&mut ws, message).await {
            Transmit::Sent => {
                let _ = reply.send(true);
                Some(ws)
            }
            Transmit::Failed(detail) => {
                let _ = reply.send(false);
                self.on_session_closed(CloseKind::Abnormal, detail);
                None
            }
        }
    }

    async fn open(&mut self) -> Result<Socket, StreamClientError> {
        let credentials = self
            .session
            .credentials()
            .ok_or(StreamClientError::MissingCredentials)?;
        let url = authenticated_url(&self.endpoint, &credentials);
        let timeout = self.config.connect_timeout;

        let ws = match with_timeout(timeout, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(WsError::Http(response))) if is_auth_status(response.status()) => {
                return Err(StreamClientError::AuthRejected(format!(
                    "handshake refused with {}",
                    response.status()
                )));
            }
            Ok(Err(err)) => return Err(err.into()),
            Err(_) => return Err(StreamClientError::ConnectTimeout(timeout)),
        };

        self.reconnect.reset();
        self.retry_at = None;
        self.outage_reported = false;
        self.shared.connected.store(true, Ordering::Release);
        self.set_state(ConnectionState::Open);
        info!(
            event = "stream_connected",
            endpoint = %self.endpoint,
            pending = self.pending.len()
        );
        Ok(ws)
    }

    async fn run_session(
        &mut self,
        ws: &mut Socket,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        if let Err(detail) = self.flush_pending(ws).await {
            return SessionEnd::Closed {
                kind: CloseKind::Abnormal,
                detail,
            };
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Send { message, reply }) => {
                        match self.transmit(ws, message).await {
                            Transmit::Sent => {
                                let _ = reply.send(true);
                            }
                            Transmit::Failed(detail) => {
                                let _ = reply.send(false);
                                return SessionEnd::Closed { kind: CloseKind::Abnormal, detail };
                            }
                        }
                    }
                    Some(Command::Close { reply }) => {
                        close_normally(ws).await;
                        let _ = reply.send(self.take_pending());
                        return SessionEnd::Shutdown;
                    }
                    None => {
                        close_normally(ws).await;
                        return SessionEnd::Shutdown;
                    }
                },
                frame = ws.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch_text(&text),
                    Some(Ok(WsMessage::Ping(payload))) => {
                        if let Err(err) = ws.send(WsMessage::Pong(payload)).await {
                            return SessionEnd::Closed {
                                kind: CloseKind::Abnormal,
                                detail: err.to_string(),
                            };
                        }
                    }
                    Some(Ok(WsMessage::Binary(data))) => {
                        debug!(event = "stream_binary_frame_ignored", len = data.len());
                    }
                    Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => {}
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|frame| u16::from(frame.code));
                        let detail = match frame {
                            Some(frame) => format!("closed by server ({}): {}", u16::from(frame.code), frame.reason),
                            None => "closed by server without code".to_string(),
                        };
                        return SessionEnd::Closed {
                            kind: classify_close(code, &self.config.auth_close_codes),
                            detail,
                        };
                    }
                    Some(Err(err)) => {
                        return SessionEnd::Closed {
                            kind: CloseKind::Abnormal,
                            detail: err.to_string(),
                        };
                    }
                    None => {
                        return SessionEnd::Closed {
                            kind: CloseKind::Abnormal,
                            detail: "stream ended".to_string(),
                        };
                    }
                }
            }
        }
    }

    fn on_session_closed(&mut self, kind: CloseKind, detail: String) {
        self.shared.connected.store(false, Ordering::Release);
        match kind {
            CloseKind::Normal => {
                info!(event = "stream_closed", %detail);
                self.set_state(ConnectionState::Closed);
            }
            CloseKind::AuthRejected => self.on_auth_rejected(&detail),
            CloseKind::Abnormal => {
                self.report_outage(detail);
                self.schedule_retry();
            }
        }
    }

    fn on_auth_rejected(&mut self, detail: &str) {
        self.shared.connected.store(false, Ordering::Release);
        self.retry_at = None;
        warn!(event = "stream_auth_rejected", %detail);
        self.set_state(ConnectionState::AuthRejected);
        self.notifier.notify(Notice::ReauthenticationRequired);
    }

    fn schedule_retry(&mut self) {
        match self.reconnect.record_failure(&self.config.reconnect) {
            ReconnectDecision::Retry { attempt, delay } => {
                self.retry_at = Some(Instant::now() + delay);
                self.set_state(ConnectionState::Reconnecting { attempt });
                self.notifier.notify(Notice::Reconnecting { attempt, delay });
            }
            ReconnectDecision::GiveUp { attempts } => {
                self.retry_at = None;
                self.set_state(ConnectionState::GivenUp);
                self.notifier
                    .notify(Notice::ReconnectExhausted { attempts });
            }
        }
    }

    fn report_outage(&mut self, detail: String) {
        warn!(
            event = "stream_connection_failed",
            failures = self.reconnect.failures(),
            %detail
        );
        if !self.outage_reported {
            self.outage_reported = true;
            self.notifier.notify(Notice::ConnectionIssue { detail });
        }
    }

    async fn flush_pending(&mut self, ws: &mut Socket) -> Result<(), String> {
        if !self.pending.is_empty() {
            debug!(event = "stream_flush_pending", pending = self.pending.len());
        }
        while let Some(message) = self.pending.pop_front() {
            if let Err(err) = ws.send(WsMessage::Text(message.to_text())).await {
                self.pending.push_front(message);
                self.sync_queue_len();
                return Err(err.to_string());
            }
        }
        self.sync_queue_len();
        Ok(())
    }

    async fn transmit(&mut self, ws: &mut Socket, message: Message) -> Transmit {
        match ws.send(WsMessage::Text(message.to_text())).await {
            Ok(()) => Transmit::Sent,
            Err(err) => {
                self.enqueue(message);
                Transmit::Failed(err.to_string())
            }
        }
    }

    fn take_pending(&mut self) -> Vec<Message> {
        let undelivered: Vec<Message> = self.pending.drain(..).collect();
        self.sync_queue_len();
        undelivered
    }

    fn enqueue(&mut self, message: Message) {
        debug!(event = "stream_message_queued", kind = %message.kind);
        self.pending.push_back(message);
        self.sync_queue_len();
    }

    fn dispatch_text(&self, text: &str) {
        match Message::from_text(text) {
            Ok(message) => self.shared.subscribers.dispatch(&message),
            Err(err) => {
                warn!(event = "stream_inbound_parse_failed", error = %err);
            }
        }
    }

    fn sync_queue_len(&self) {
        self.shared
            .queued
            .store(self.pending.len(), Ordering::Release);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(event = "stream_state", from = %current, to = %state);
            *current = state;
            true
        });
    }
}

impl Drop for Worker {
    // Runs on every exit, including an unwind out of the worker task.
    fn drop(&mut self) {
        self.shared.connected.store(false, Ordering::Release);
        if !self.pending.is_empty() {
            let count = self.pending.len();
            warn!(event = "stream_shutdown_with_pending", pending = count);
            self.take_pending();
            self.notifier.notify(Notice::MessagesDiscarded { count });
        }
        self.set_state(ConnectionState::Shutdown);
    }
}

/// Stream endpoint with the `token` query parameter for `credentials`.
fn authenticated_url(endpoint: &Url, credentials: &Credentials) -> Url {
    let mut url = endpoint.clone();
    url.query_pairs_mut()
        .append_pair("token", &credentials.token_param());
    url
}

fn is_auth_status(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

async fn close_normally(ws: &mut Socket) {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "client closing".into(),
    };
    if let Err(err) = ws.close(Some(frame)).await {
        debug!(event = "stream_close_failed", error = %err);
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use secrecy::SecretString;
    use serde_json::json;

    use super::{authenticated_url, Subscribers};
    use crate::auth::Credentials;
    use crate::config::ClientConfig;
    use crate::stream::proto::Message;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) + Send + Sync + Clone) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (log, move |entry: &str| {
            sink.lock().expect("lock").push(entry.to_string())
        })
    }

    #[test]
    fn token_is_appended_as_query_parameter() {
        let endpoint = ClientConfig::default().stream_url().expect("endpoint");
        let credentials = Credentials::bearer(SecretString::new("abc.def".to_string()));
        let url = authenticated_url(&endpoint, &credentials);

        assert_eq!(url.path(), "/websocket");
        let token = url
            .query_pairs()
            .find(|(key, _)| key == "token")
            .map(|(_, value)| value.into_owned());
        assert_eq!(token.as_deref(), Some("bearer abc.def"));
    }

    #[test]
    fn callbacks_run_in_subscription_order() {
        let registry = Arc::new(Subscribers::default());
        let (log, record) = recorder();

        let first = record.clone();
        let _a = registry.add(Arc::new(move |m: &Message| first(&format!("a:{}", m.kind))));
        let second = record.clone();
        let _b = registry.add(Arc::new(move |m: &Message| second(&format!("b:{}", m.kind))));

        registry.dispatch(&Message::new("x", json!(null)));
        assert_eq!(*log.lock().expect("lock"), vec!["a:x", "b:x"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_callback() {
        let registry = Arc::new(Subscribers::default());
        let (log, record) = recorder();

        let first = record.clone();
        let a = registry.add(Arc::new(move |m: &Message| first(&format!("a:{}", m.kind))));
        let second = record.clone();
        let _b = registry.add(Arc::new(move |m: &Message| second(&format!("b:{}", m.kind))));

        registry.dispatch(&Message::new("one", json!(null)));
        a.unsubscribe();
        registry.dispatch(&Message::new("two", json!(null)));

        assert_eq!(registry.len(), 1);
        assert_eq!(*log.lock().expect("lock"), vec!["a:one", "b:one", "b:two"]);
    }

    #[test]
    fn unsubscribing_mid_dispatch_skips_later_callbacks() {
        let registry = Arc::new(Subscribers::default());
        let (log, record) = recorder();
        let victim: Arc<Mutex<Option<super::Subscription>>> = Arc::new(Mutex::new(None));

        let killer = Arc::clone(&victim);
        let first = record.clone();
        let _a = registry.add(Arc::new(move |_: &Message| {
            first("a");
            if let Some(subscription) = killer.lock().expect("lock").take() {
                subscription.unsubscribe();
            }
        }));
        let second = record.clone();
        let b = registry.add(Arc::new(move |_: &Message| second("b")));
        *victim.lock().expect("lock") = Some(b);

        registry.dispatch(&Message::new("x", json!(null)));
        registry.dispatch(&Message::new("y", json!(null)));

        assert_eq!(*log.lock().expect("lock"), vec!["a", "a"]);
    }

    #[test]
    fn panicking_callback_does_not_skip_later_ones() {
        let registry = Arc::new(Subscribers::default());
        let (log, record) = recorder();

        let _faulty = registry.add(Arc::new(|m: &Message| {
            if m.kind == "boom" {
                panic!("callback failure");
            }
        }));
        let _b = registry.add(Arc::new(move |m: &Message| record(&m.kind)));

        registry.dispatch(&Message::new("boom", json!(null)));
        registry.dispatch(&Message::new("calm", json!(null)));

        assert_eq!(*log.lock().expect("lock"), vec!["boom", "calm"]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn callback_may_unsubscribe_itself() {
        let registry = Arc::new(Subscribers::default());
        let (log, record) = recorder();
        let own: Arc<Mutex<Option<super::Subscription>>> = Arc::new(Mutex::new(None));

        let slot = Arc::clone(&own);
        let once = registry.add(Arc::new(move |_: &Message| {
            record("once");
            if let Some(subscription) = slot.lock().expect("lock").take() {
                subscription.unsubscribe();
            }
        }));
        *own.lock().expect("lock") = Some(once);

        registry.dispatch(&Message::new("x", json!(null)));
        registry.dispatch(&Message::new("y", json!(null)));

        assert_eq!(*log.lock().expect("lock"), vec!["once"]);
        assert_eq!(registry.len(), 0);
    }
}
