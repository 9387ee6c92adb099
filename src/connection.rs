//! Connection lifecycle for the marketplace chat channel.
//!
//! [`ConnectionManager`] is the sole owner of the live transport. It drives
//! the state machine
//!
//! ```text
//! Disconnected → Connecting → Connected
//! Connected → Reconnecting → Connected | Failed
//! Connected | Reconnecting → Disconnected      (explicit disconnect)
//! ```
//!
//! Each transport gets a background *link task* (select over outgoing
//! commands and incoming frames). Connection attempts, including the
//! reconnect delay, run on a single *supervisor task*; concurrent
//! [`connect`](ConnectionManager::connect) calls share one [`ConnectAttempt`].
//!
//! Other components never see the transport. They subscribe through the
//! [`EventRegistry`] and send through [`emit`](ConnectionManager::emit).
//!
//! # Example
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new(LinkConfig::default(), WebSocketConnector::new(url));
//! manager.registry().on(events::NEW_MESSAGE, |payload| println!("{payload}"));
//! manager.connect(Credentials::new(token, "buyer-1")).await?;
//! manager.emit(events::USER_STATUS, &UserStatusPayload { status: PresenceStatus::Away });
//! manager.disconnect().await;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{LinkError, Result};
use crate::error_codes::RejectCode;
use crate::protocol::{
    events, ChatRoomPayload, Frame, PresenceStatus, Role, UserStatusPayload, VerifyAuthAck,
    VerifyAuthRequest,
};
use crate::registry::EventRegistry;
use crate::transport::{Connector, Credentials, Transport};

/// Default number of failed attempts before the link gives up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Default delay before a reconnect and between retries.
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default window for the transport to come up.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Default window for `verify_auth` and message acknowledgements.
const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Default typing inactivity window.
const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

/// Default number of notifications kept.
const DEFAULT_NOTIFICATION_CAPACITY: usize = 5;

/// Default capacity of the application signal channel.
const DEFAULT_SIGNAL_CHANNEL_CAPACITY: usize = 64;

/// Default timeout for closing the transport on disconnect.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Ack id reserved for the `verify_auth` handshake.
const HANDSHAKE_ACK_ID: u64 = 0;

// ── Configuration ───────────────────────────────────────────────────

/// Tuning knobs for the link. All fields have defaults.
///
/// ```
/// use flock_link::LinkConfig;
/// use std::time::Duration;
///
/// let config = LinkConfig::default()
///     .with_max_reconnect_attempts(3)
///     .with_reconnect_delay(Duration::from_millis(500));
/// assert_eq!(config.max_reconnect_attempts, 3);
/// assert_eq!(config.notification_capacity, 5);
/// ```
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Failed attempts after which the link enters `Failed`.
    ///
    /// Defaults to **5**. Values below 1 are clamped to 1.
    pub max_reconnect_attempts: u32,
    /// Delay before a scheduled reconnect and between retries.
    ///
    /// Defaults to **1 second**.
    pub reconnect_delay: Duration,
    /// An attempt that neither connects nor errors within this window counts
    /// as a failed attempt.
    ///
    /// Defaults to **20 seconds**.
    pub connect_timeout: Duration,
    /// How long to wait for `verify_auth` and message acknowledgements.
    ///
    /// Defaults to **10 seconds**.
    pub ack_timeout: Duration,
    /// Typing inactivity window before typing-stop is sent.
    ///
    /// Defaults to **3 seconds**.
    pub typing_timeout: Duration,
    /// Number of notifications kept by the aggregator.
    ///
    /// Defaults to **5**. Values below 1 are clamped to 1.
    pub notification_capacity: usize,
    /// Capacity of the [`LinkSignal`] broadcast channel.
    ///
    /// Defaults to **64**. Values below 1 are clamped to 1.
    pub signal_channel_capacity: usize,
    /// Time given to the link task to send `offline` and close the
    /// transport on [`disconnect`](ConnectionManager::disconnect) before it
    /// is aborted.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
            signal_channel_capacity: DEFAULT_SIGNAL_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl LinkConfig {
    /// Set the attempt budget. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_typing_timeout(mut self, timeout: Duration) -> Self {
        self.typing_timeout = timeout;
        self
    }

    /// Set the notification history size. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = capacity.max(1);
        self
    }

    /// Set the signal channel capacity. Values below 1 are clamped to 1.
    #[must_use]
    pub fn with_signal_channel_capacity(mut self, capacity: usize) -> Self {
        self.signal_channel_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

// ── Public state types ──────────────────────────────────────────────

/// Lifecycle state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Attempt budget exhausted. Stays here until the next `connect()`.
    Failed,
}

/// Identity and room context of one logical connection.
///
/// Created by `connect()`, kept across every reconnect, cleared by
/// `disconnect()`.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub auth_token: String,
    pub user_id: String,
    pub role: Role,
    pub current_chat_room_id: Option<String>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("auth_token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .field("current_chat_room_id", &self.current_chat_room_id)
            .finish()
    }
}

/// Terminal conditions surfaced to the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    /// The attempt budget ran out; real-time features are unavailable until
    /// the next `connect()`.
    Degraded { attempts: u32, last_error: String },
    /// The server rejected the session token. The host should force a new
    /// login; the link will not retry.
    AuthFailed {
        reason: String,
        code: Option<RejectCode>,
    },
}

/// Why a live transport went away.
#[derive(Debug, Clone, PartialEq, Eq)]
enum DisconnectReason {
    /// The server closed the connection.
    ServerClosed,
    /// Send or receive failed.
    TransportError(String),
    /// We closed it.
    ClientClosed,
}

impl DisconnectReason {
    fn is_recoverable(&self) -> bool {
        !matches!(self, Self::ClientClosed)
    }
}

// ── Connect attempt ─────────────────────────────────────────────────

/// A connection attempt in flight, shared by every `connect()` caller.
///
/// Resolves with `Ok(())` once the link is connected and authenticated, or
/// with the terminal error of the attempt sequence ([`LinkError::ConnectionExhausted`],
/// [`LinkError::AuthRejected`], or [`LinkError::Cancelled`] after
/// `disconnect()`).
#[derive(Clone)]
pub struct ConnectAttempt {
    id: u64,
    outcome: Shared<BoxFuture<'static, Result<()>>>,
}

impl ConnectAttempt {
    fn ready(result: Result<()>) -> Self {
        Self {
            id: 0,
            outcome: futures_util::future::ready(result).boxed().shared(),
        }
    }

    fn pending(id: u64, rx: oneshot::Receiver<Result<()>>) -> Self {
        let outcome = async move { rx.await.unwrap_or(Err(LinkError::Cancelled)) }
            .boxed()
            .shared();
        Self { id, outcome }
    }

    /// Identifier of the attempt sequence. Callers that joined the same
    /// in-flight attempt see the same id; `0` means "already connected".
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for ConnectAttempt {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().outcome.poll_unpin(cx)
    }
}

impl std::fmt::Debug for ConnectAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectAttempt")
            .field("id", &self.id)
            .finish()
    }
}

// ── Internal state ──────────────────────────────────────────────────

/// Commands from the manager to a link task.
enum Command {
    Emit(Frame),
    Request {
        event: String,
        data: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Close,
}

/// The live transport, as seen from the manager.
struct LiveLink {
    generation: u64,
    cmd_tx: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct LinkState {
    credentials: Option<Credentials>,
    current_room: Option<String>,
    /// Bumped whenever a session starts or ends; tasks from older epochs
    /// must not touch state.
    epoch: u64,
    generation: u64,
    link: Option<LiveLink>,
    attempts: u32,
    next_attempt_id: u64,
    pending: Option<ConnectAttempt>,
    settle_tx: Option<oneshot::Sender<Result<()>>>,
    /// Attempt loop, including any scheduled reconnect delay.
    supervisor: Option<JoinHandle<()>>,
}

impl LinkState {
    fn new() -> Self {
        Self {
            credentials: None,
            current_room: None,
            epoch: 0,
            generation: 0,
            link: None,
            attempts: 0,
            next_attempt_id: 0,
            pending: None,
            settle_tx: None,
            supervisor: None,
        }
    }

    fn begin_attempt(&mut self) -> ConnectAttempt {
        if let Some(pending) = &self.pending {
            return pending.clone();
        }
        let (tx, rx) = oneshot::channel();
        self.next_attempt_id += 1;
        let attempt = ConnectAttempt::pending(self.next_attempt_id, rx);
        self.settle_tx = Some(tx);
        self.pending = Some(attempt.clone());
        attempt
    }

    fn settle(&mut self, result: Result<()>) {
        self.pending = None;
        if let Some(tx) = self.settle_tx.take() {
            let _ = tx.send(result);
        }
    }

    fn reconnect_scheduled(&self) -> bool {
        self.supervisor.as_ref().is_some_and(|h| !h.is_finished())
    }
}

struct Inner {
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    registry: EventRegistry,
    state_tx: watch::Sender<ConnectionState>,
    signal_tx: broadcast::Sender<LinkSignal>,
    link: Mutex<LinkState>,
}

impl Inner {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            info!(from = ?prev, to = ?next, "connection state changed");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn signal(&self, signal: LinkSignal) {
        if self.signal_tx.send(signal).is_err() {
            debug!("no receivers for link signal");
        }
    }

    fn epoch_is(&self, epoch: u64) -> bool {
        self.link.lock().epoch == epoch
    }

    /// Install a freshly authenticated transport. Returns the transport back
    /// if the session ended while it was being established.
    fn install(
        self: &Arc<Self>,
        epoch: u64,
        transport: Box<dyn Transport>,
        backlog: Vec<Frame>,
    ) -> Option<Box<dyn Transport>> {
        let mut st = self.link.lock();
        if st.epoch != epoch {
            return Some(transport);
        }

        st.generation += 1;
        let generation = st.generation;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        // Queued before the task starts, so they go out ahead of anything
        // emitted by callers once the state flips to Connected.
        queue_event(
            &cmd_tx,
            events::USER_STATUS,
            &UserStatusPayload {
                status: PresenceStatus::Online,
            },
        );
        if let Some(room) = &st.current_room {
            debug!(chat_id = %room, "rejoining chat room");
            queue_event(
                &cmd_tx,
                events::JOIN_CHAT,
                &ChatRoomPayload {
                    chat_id: room.clone(),
                },
            );
        }

        let listeners = self.registry.attach(generation);
        let task = tokio::spawn(link_loop(
            Arc::downgrade(self),
            self.registry.clone(),
            generation,
            transport,
            cmd_rx,
            backlog,
        ));

        st.link = Some(LiveLink {
            generation,
            cmd_tx,
            task,
        });
        st.attempts = 0;
        st.supervisor = None;
        self.set_state(ConnectionState::Connected);
        st.settle(Ok(()));
        info!(generation, listeners, "link established");
        None
    }

    /// Count a failed attempt. Returns `true` if the supervisor should retry.
    fn record_failure(&self, epoch: u64, err: &LinkError) -> bool {
        let mut st = self.link.lock();
        if st.epoch != epoch {
            return false;
        }
        st.attempts += 1;
        let max = self.config.max_reconnect_attempts;
        warn!(attempt = st.attempts, max, error = %err, "connection attempt failed");

        if st.attempts < max {
            return true;
        }

        let attempts = st.attempts;
        st.supervisor = None;
        self.set_state(ConnectionState::Failed);
        st.settle(Err(LinkError::ConnectionExhausted { attempts }));
        drop(st);

        warn!(attempts, "real-time features degraded: giving up on the chat server");
        self.signal(LinkSignal::Degraded {
            attempts,
            last_error: err.to_string(),
        });
        false
    }

    fn reject_auth(&self, epoch: u64, reason: String, code: Option<RejectCode>) {
        let mut st = self.link.lock();
        if st.epoch != epoch {
            return;
        }
        error!(reason = %reason, ?code, "authentication rejected; session closed");
        st.epoch += 1;
        st.credentials = None;
        st.current_room = None;
        st.attempts = 0;
        st.supervisor = None;
        self.set_state(ConnectionState::Disconnected);
        st.settle(Err(LinkError::AuthRejected {
            reason: reason.clone(),
            code,
        }));
        drop(st);

        self.signal(LinkSignal::AuthFailed { reason, code });
    }

    /// Called by a link task when its transport goes away.
    fn link_lost(self: &Arc<Self>, generation: u64, reason: DisconnectReason) {
        let mut st = self.link.lock();
        if st.link.as_ref().map(|l| l.generation) != Some(generation) {
            return;
        }
        st.link = None;
        self.registry.detach(generation);
        info!(generation, ?reason, "transport disconnected");

        let Some(credentials) = st.credentials.clone() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        if !reason.is_recoverable() || st.attempts >= self.config.max_reconnect_attempts {
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        if st.reconnect_scheduled() {
            debug!("reconnect already scheduled");
            return;
        }

        st.attempts += 1;
        self.set_state(ConnectionState::Reconnecting);
        st.begin_attempt();
        let delay = self.config.reconnect_delay;
        info!(attempt = st.attempts, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        st.supervisor = Some(tokio::spawn(run_attempts(
            Arc::downgrade(self),
            st.epoch,
            credentials,
            Some(delay),
        )));
    }
}

fn queue_event<T: Serialize>(cmd_tx: &mpsc::UnboundedSender<Command>, event: &str, payload: &T) {
    match serde_json::to_value(payload) {
        Ok(data) => {
            let _ = cmd_tx.send(Command::Emit(Frame::event(event, data)));
        }
        Err(e) => warn!(event, error = %e, "failed to serialize payload"),
    }
}

// ── Manager handle ──────────────────────────────────────────────────

/// Owner of the single live transport and its reconnection policy.
///
/// Cheap to clone; every clone drives the same connection. Methods that
/// start background work must be called within a Tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager with its own [`EventRegistry`].
    pub fn new(config: LinkConfig, connector: impl Connector) -> Self {
        Self::with_registry(config, Arc::new(connector), EventRegistry::new())
    }

    /// Create a manager that attaches `registry` to its transports.
    pub fn with_registry(
        config: LinkConfig,
        connector: Arc<dyn Connector>,
        registry: EventRegistry,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (signal_tx, _) = broadcast::channel(config.signal_channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                registry,
                state_tx,
                signal_tx,
                link: Mutex::new(LinkState::new()),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start (or join) a connection attempt.
    ///
    /// - Already connected: returns an attempt that resolves immediately.
    /// - Attempt in flight (`Connecting`/`Reconnecting`): returns that same
    ///   attempt; no new transport is created.
    /// - Otherwise: drops any stale transport, opens a new session with
    ///   `credentials`, resets the attempt counter and moves to `Connecting`.
    pub fn connect(&self, credentials: Credentials) -> ConnectAttempt {
        let mut st = self.inner.link.lock();

        if self.inner.state() == ConnectionState::Connected && st.link.is_some() {
            debug!("connect() while connected; nothing to do");
            return ConnectAttempt::ready(Ok(()));
        }
        if let Some(pending) = &st.pending {
            debug!(attempt = pending.id(), "joining in-flight connection attempt");
            return pending.clone();
        }

        if let Some(stale) = st.link.take() {
            self.inner.registry.detach(stale.generation);
            let _ = stale.cmd_tx.send(Command::Close);
        }
        if let Some(supervisor) = st.supervisor.take() {
            supervisor.abort();
        }

        st.epoch += 1;
        st.attempts = 0;
        st.credentials = Some(credentials.clone());
        let attempt = st.begin_attempt();
        self.inner.set_state(ConnectionState::Connecting);
        info!(user_id = %credentials.user_id, attempt = attempt.id(), "connecting");

        st.supervisor = Some(tokio::spawn(run_attempts(
            Arc::downgrade(&self.inner),
            st.epoch,
            credentials,
            None,
        )));
        attempt
    }

    /// End the session: send `offline` if connected, close the transport,
    /// cancel any pending reconnect and forget the session.
    ///
    /// Registry subscriptions are kept for the next `connect()`. Calling this
    /// more than once is harmless.
    pub async fn disconnect(&self) {
        let (link, supervisor) = {
            let mut st = self.inner.link.lock();
            st.epoch += 1;
            st.credentials = None;
            st.current_room = None;
            st.attempts = 0;
            st.settle(Err(LinkError::Cancelled));
            let link = st.link.take();
            if let Some(link) = &link {
                self.inner.registry.detach(link.generation);
            }
            self.inner.set_state(ConnectionState::Disconnected);
            (link, st.supervisor.take())
        };

        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }

        let Some(mut link) = link else {
            return;
        };

        queue_event(
            &link.cmd_tx,
            events::USER_STATUS,
            &UserStatusPayload {
                status: PresenceStatus::Offline,
            },
        );
        let _ = link.cmd_tx.send(Command::Close);

        match tokio::time::timeout(self.inner.config.shutdown_timeout, &mut link.task).await {
            Ok(Ok(())) => {}
            Ok(Err(join_err)) => warn!("link task terminated with join error: {join_err}"),
            Err(_) => {
                warn!("link task did not exit within timeout; aborting");
                link.task.abort();
            }
        }
        info!(generation = link.generation, "disconnected");
    }

    // ── Sending ─────────────────────────────────────────────────────

    /// Send a fire-and-forget event.
    ///
    /// Returns `false` without side effects when not connected, or when the
    /// payload cannot be serialized.
    pub fn emit<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> bool {
        match serde_json::to_value(payload) {
            Ok(data) => self.emit_value(event, data),
            Err(e) => {
                warn!(event, error = %e, "failed to serialize payload");
                false
            }
        }
    }

    /// [`emit`](Self::emit) for an already built JSON payload.
    pub fn emit_value(&self, event: &str, data: Value) -> bool {
        let st = self.inner.link.lock();
        if self.inner.state() != ConnectionState::Connected {
            debug!(event, "emit skipped: not connected");
            return false;
        }
        match &st.link {
            Some(link) => link
                .cmd_tx
                .send(Command::Emit(Frame::event(event, data)))
                .is_ok(),
            None => false,
        }
    }

    /// Send an event and wait for the server's acknowledgement payload.
    ///
    /// # Errors
    ///
    /// - [`LinkError::NotConnected`] if not connected, or if the transport
    ///   drops before the acknowledgement arrives
    /// - [`LinkError::Timeout`] after [`LinkConfig::ack_timeout`]
    pub async fn request<T: Serialize + ?Sized>(&self, event: &str, payload: &T) -> Result<Value> {
        let data = serde_json::to_value(payload)?;
        let reply_rx = {
            let st = self.inner.link.lock();
            if self.inner.state() != ConnectionState::Connected {
                return Err(LinkError::NotConnected);
            }
            let link = st.link.as_ref().ok_or(LinkError::NotConnected)?;
            let (reply, reply_rx) = oneshot::channel();
            link.cmd_tx
                .send(Command::Request {
                    event: event.to_string(),
                    data,
                    reply,
                })
                .map_err(|_| LinkError::NotConnected)?;
            reply_rx
        };

        match tokio::time::timeout(self.inner.config.ack_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::NotConnected),
            Err(_) => Err(LinkError::Timeout),
        }
    }

    // ── Room bookkeeping (used by ChatRoomTracker) ──────────────────

    /// Record `chat_id` as the current room and emit `join_chat` if connected.
    /// Both happen under one lock so a concurrent reconnect cannot send a
    /// second join for the same room.
    pub(crate) fn enter_room(&self, chat_id: &str) -> bool {
        let mut st = self.inner.link.lock();
        st.current_room = Some(chat_id.to_string());
        self.emit_locked(&st, events::JOIN_CHAT, chat_id)
    }

    /// Clear the current room if it is `chat_id`, and emit `leave_chat` if
    /// connected.
    pub(crate) fn exit_room(&self, chat_id: &str) -> bool {
        let mut st = self.inner.link.lock();
        if st.current_room.as_deref() == Some(chat_id) {
            st.current_room = None;
        }
        self.emit_locked(&st, events::LEAVE_CHAT, chat_id)
    }

    fn emit_locked(&self, st: &LinkState, event: &str, chat_id: &str) -> bool {
        if self.inner.state() != ConnectionState::Connected {
            return false;
        }
        let Some(link) = &st.link else {
            return false;
        };
        let payload = ChatRoomPayload {
            chat_id: chat_id.to_string(),
        };
        match serde_json::to_value(&payload) {
            Ok(data) => link
                .cmd_tx
                .send(Command::Emit(Frame::event(event, data)))
                .is_ok(),
            Err(e) => {
                warn!(event, error = %e, "failed to serialize payload");
                false
            }
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Returns `true` while the link is connected and authenticated.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Receive terminal [`LinkSignal`]s (degraded, authentication failed).
    pub fn signals(&self) -> broadcast::Receiver<LinkSignal> {
        self.inner.signal_tx.subscribe()
    }

    /// Snapshot of the current session, if one is open.
    pub fn session(&self) -> Option<Session> {
        let st = self.inner.link.lock();
        st.credentials.as_ref().map(|c| Session {
            auth_token: c.token.clone(),
            user_id: c.user_id.clone(),
            role: c.role,
            current_chat_room_id: st.current_room.clone(),
        })
    }

    /// Id of the signed-in user, if a session is open.
    pub fn user_id(&self) -> Option<String> {
        self.inner
            .link
            .lock()
            .credentials
            .as_ref()
            .map(|c| c.user_id.clone())
    }

    /// The recorded current chat room.
    pub fn current_chat_room(&self) -> Option<String> {
        self.inner.link.lock().current_room.clone()
    }

    /// Failed attempts counted since the last successful connection.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link.lock().attempts
    }

    pub fn registry(&self) -> &EventRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("attempts", &self.reconnect_attempts())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

/// Attempt loop for one session epoch. Retries after `reconnect_delay` until
/// a transport is installed, the budget runs out, authentication is
/// rejected, or the epoch ends.
async fn run_attempts(
    inner: Weak<Inner>,
    epoch: u64,
    credentials: Credentials,
    initial_delay: Option<Duration>,
) {
    if let Some(delay) = initial_delay {
        tokio::time::sleep(delay).await;
    }

    loop {
        let Some(manager) = inner.upgrade() else {
            return;
        };
        if !manager.epoch_is(epoch) {
            return;
        }

        match establish(&manager, &credentials).await {
            Ok((transport, backlog)) => {
                if let Some(mut stale) = manager.install(epoch, transport, backlog) {
                    debug!("session ended while connecting; closing new transport");
                    let _ = stale.close().await;
                }
                return;
            }
            Err(LinkError::AuthRejected { reason, code }) => {
                manager.reject_auth(epoch, reason, code);
                return;
            }
            Err(err) => {
                if !manager.record_failure(epoch, &err) {
                    return;
                }
            }
        }

        let delay = manager.config.reconnect_delay;
        drop(manager);
        tokio::time::sleep(delay).await;
    }
}

/// Open a transport and run the `verify_auth` handshake on it.
///
/// Frames that arrive before the acknowledgement are returned so the link
/// task can deliver them once subscribers are attached.
async fn establish(
    inner: &Inner,
    credentials: &Credentials,
) -> Result<(Box<dyn Transport>, Vec<Frame>)> {
    let mut transport = tokio::time::timeout(
        inner.config.connect_timeout,
        inner.connector.connect(credentials),
    )
    .await
    .map_err(|_| LinkError::Timeout)??;

    match tokio::time::timeout(
        inner.config.ack_timeout,
        handshake(&mut transport, &credentials.token),
    )
    .await
    {
        Ok(Ok(backlog)) => Ok((transport, backlog)),
        Ok(Err(e)) => {
            let _ = transport.close().await;
            Err(e)
        }
        Err(_) => {
            let _ = transport.close().await;
            Err(LinkError::Timeout)
        }
    }
}

async fn handshake(transport: &mut Box<dyn Transport>, token: &str) -> Result<Vec<Frame>> {
    let request = VerifyAuthRequest {
        token: token.to_string(),
    };
    let frame = Frame::event_with_ack(
        events::VERIFY_AUTH,
        serde_json::to_value(&request)?,
        HANDSHAKE_ACK_ID,
    );
    transport.send(serde_json::to_string(&frame)?).await?;

    let mut backlog = Vec::new();
    loop {
        let text = match transport.recv().await {
            Some(Ok(text)) => text,
            Some(Err(e)) => return Err(e),
            None => return Err(LinkError::TransportClosed),
        };
        match serde_json::from_str::<Frame>(&text) {
            Ok(Frame::Ack { id, data }) if id == HANDSHAKE_ACK_ID => {
                let ack: VerifyAuthAck = if data.is_null() {
                    VerifyAuthAck::default()
                } else {
                    serde_json::from_value(data)?
                };
                return match (ack.error, ack.error_code) {
                    (None, None) => Ok(backlog),
                    (reason, code) => Err(LinkError::AuthRejected {
                        reason: reason
                            .or_else(|| code.map(|c| c.description().to_string()))
                            .unwrap_or_default(),
                        code,
                    }),
                };
            }
            Ok(frame) => backlog.push(frame),
            Err(e) => warn!("failed to decode frame during handshake: {e}, raw: {text}"),
        }
    }
}

// ── Link task ───────────────────────────────────────────────────────

/// Per-transport loop multiplexing outgoing commands and incoming frames.
///
/// Exits when the manager closes the link, every command sender is dropped,
/// the server closes the connection, or a transport error occurs.
async fn link_loop(
    inner: Weak<Inner>,
    registry: EventRegistry,
    generation: u64,
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    backlog: Vec<Frame>,
) {
    debug!(generation, "link task started");
    let mut acks: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut next_ack = HANDSHAKE_ACK_ID;

    for frame in backlog {
        handle_inbound(&registry, generation, frame, &mut acks);
    }

    let reason = loop {
        tokio::select! {
            // Outgoing commands go first so `offline` precedes `Close`.
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Emit(frame)) => {
                        if let Err(e) = send_frame(&mut transport, &frame).await {
                            error!(generation, "transport send error: {e}");
                            break DisconnectReason::TransportError(e.to_string());
                        }
                    }
                    Some(Command::Request { event, data, reply }) => {
                        next_ack += 1;
                        let frame = Frame::event_with_ack(event, data, next_ack);
                        match send_frame(&mut transport, &frame).await {
                            Ok(()) => {
                                acks.insert(next_ack, reply);
                            }
                            Err(e) => {
                                error!(generation, "transport send error: {e}");
                                let _ = reply.send(Err(e.clone()));
                                break DisconnectReason::TransportError(e.to_string());
                            }
                        }
                    }
                    Some(Command::Close) | None => {
                        debug!(generation, "closing transport");
                        let _ = transport.close().await;
                        break DisconnectReason::ClientClosed;
                    }
                }
            }

            incoming = transport.recv() => {
                match incoming {
                    Some(Ok(text)) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) => handle_inbound(&registry, generation, frame, &mut acks),
                        Err(e) => warn!("failed to decode frame: {e}, raw: {text}"),
                    },
                    Some(Err(e)) => {
                        error!(generation, "transport receive error: {e}");
                        break DisconnectReason::TransportError(e.to_string());
                    }
                    None => {
                        debug!(generation, "transport closed by server");
                        break DisconnectReason::ServerClosed;
                    }
                }
            }
        }
    };

    // Waiters on outstanding acks observe the dropped senders as NotConnected.
    drop(acks);

    if let Some(inner) = inner.upgrade() {
        inner.link_lost(generation, reason);
    }
    debug!(generation, "link task exited");
}

fn handle_inbound(
    registry: &EventRegistry,
    generation: u64,
    frame: Frame,
    acks: &mut HashMap<u64, oneshot::Sender<Result<Value>>>,
) {
    match frame {
        Frame::Event { event, data, .. } => {
            let delivered = registry.dispatch(generation, &event, &data);
            debug!(generation, event = %event, delivered, "inbound event");
        }
        Frame::Ack { id, data } => match acks.remove(&id) {
            Some(reply) => {
                let _ = reply.send(Ok(data));
            }
            None => debug!(generation, id, "ack without a pending request"),
        },
    }
}

async fn send_frame(transport: &mut Box<dyn Transport>, frame: &Frame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    transport.send(json).await
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct RefusingConnector;

    #[async_trait]
    impl Connector for RefusingConnector {
        async fn connect(&self, _: &Credentials) -> Result<Box<dyn Transport>> {
            Err(LinkError::ConnectFailed("refused".into()))
        }
    }

    #[test]
    fn config_defaults() {
        let config = LinkConfig::default();
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.connect_timeout, Duration::from_secs(20));
        assert_eq!(config.typing_timeout, Duration::from_secs(3));
        assert_eq!(config.notification_capacity, 5);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }

    #[test]
    fn config_values_are_clamped() {
        let config = LinkConfig::default()
            .with_max_reconnect_attempts(0)
            .with_notification_capacity(0)
            .with_signal_channel_capacity(0);
        assert_eq!(config.max_reconnect_attempts, 1);
        assert_eq!(config.notification_capacity, 1);
        assert_eq!(config.signal_channel_capacity, 1);
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = Session {
            auth_token: "jwt-secret".into(),
            user_id: "buyer-1".into(),
            role: Role::Buyer,
            current_chat_room_id: None,
        };
        assert!(!format!("{session:?}").contains("jwt-secret"));
    }

    #[test]
    fn only_client_close_is_unrecoverable() {
        assert!(DisconnectReason::ServerClosed.is_recoverable());
        assert!(DisconnectReason::TransportError("reset".into()).is_recoverable());
        assert!(!DisconnectReason::ClientClosed.is_recoverable());
    }

    #[tokio::test]
    async fn ready_attempt_resolves_immediately() {
        let attempt = ConnectAttempt::ready(Ok(()));
        assert_eq!(attempt.id(), 0);
        assert!(attempt.await.is_ok());
    }

    #[tokio::test]
    async fn dropped_settle_sender_cancels_attempt() {
        let (tx, rx) = oneshot::channel();
        let attempt = ConnectAttempt::pending(7, rx);
        drop(tx);
        assert!(matches!(attempt.await, Err(LinkError::Cancelled)));
    }

    #[tokio::test]
    async fn emit_and_request_fail_when_disconnected() {
        let manager = ConnectionManager::new(LinkConfig::default(), RefusingConnector);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.emit(events::USER_STATUS, &serde_json::json!({ "status": "away" })));
        let err = manager
            .request(events::SEND_MESSAGE, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::NotConnected));
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let manager = ConnectionManager::new(LinkConfig::default(), RefusingConnector);
        manager.disconnect().await;
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.session().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connections_exhaust_budget() {
        let manager = ConnectionManager::new(
            LinkConfig::default().with_max_reconnect_attempts(2),
            RefusingConnector,
        );
        let mut signals = manager.signals();

        let err = manager
            .connect(Credentials::new("jwt", "buyer-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::ConnectionExhausted { attempts: 2 }));
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(matches!(
            signals.recv().await.unwrap(),
            LinkSignal::Degraded { attempts: 2, .. }
        ));
    }
}
