#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for Flock Link integration tests.
//!
//! Provides a scripted [`MockConnector`]. Every accepted connection hands the
//! test a [`ServerEnd`] that plays the chat server: it reads client frames and
//! pushes events, acknowledgements and disconnects.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use flock_link::protocol::{events, Frame};
use flock_link::{
    ConnectionManager, Connector, Credentials, LinkConfig, LinkError, Message, Transport,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// How long helpers wait for something the test expects to happen.
const WAIT: Duration = Duration::from_secs(30);

// ── ChannelTransport ────────────────────────────────────────────────

type Incoming = Option<Result<String, LinkError>>;

/// Client half of an in-memory connection.
pub struct ChannelTransport {
    incoming: mpsc::UnboundedReceiver<Incoming>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: String) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::TransportClosed);
        }
        self.outgoing
            .send(message)
            .map_err(|_| LinkError::TransportSend("server end dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<String, LinkError>> {
        // A dropped server end reads as a clean close.
        self.incoming.recv().await.flatten()
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ── ServerEnd ───────────────────────────────────────────────────────

/// Server half of an in-memory connection.
pub struct ServerEnd {
    to_client: mpsc::UnboundedSender<Incoming>,
    from_client: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
    pub credentials: Credentials,
}

impl ServerEnd {
    /// Next frame the client sent.
    pub async fn next_frame(&mut self) -> Frame {
        let text = tokio::time::timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for a client frame")
            .expect("client end dropped");
        serde_json::from_str(&text).expect("client sent an undecodable frame")
    }

    /// Next event the client sent, as `(name, data, ack)`.
    pub async fn next_event(&mut self) -> (String, Value, Option<u64>) {
        match self.next_frame().await {
            Frame::Event { event, data, ack } => (event, data, ack),
            other => panic!("expected an event frame, got {other:?}"),
        }
    }

    /// Next event, asserting its name.
    pub async fn expect_event(&mut self, name: &str) -> Value {
        let (event, data, _) = self.next_event().await;
        assert_eq!(event, name, "unexpected event with data {data}");
        data
    }

    /// Every frame the client has sent so far that has not been read.
    pub fn drain_events(&mut self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        while let Ok(text) = self.from_client.try_recv() {
            if let Ok(Frame::Event { event, data, .. }) = serde_json::from_str(&text) {
                out.push((event, data));
            }
        }
        out
    }

    /// Answer the `verify_auth` handshake successfully. Returns the token.
    pub async fn accept_auth(&mut self) -> String {
        let (event, data, ack) = self.next_event().await;
        assert_eq!(event, events::VERIFY_AUTH);
        self.ack(ack.expect("verify_auth must request an ack"), json!({}));
        data["token"].as_str().unwrap_or_default().to_string()
    }

    /// Answer the `verify_auth` handshake with an error.
    pub async fn reject_auth(&mut self, reason: &str, code: Option<&str>) {
        let (event, _, ack) = self.next_event().await;
        assert_eq!(event, events::VERIFY_AUTH);
        let mut data = json!({ "error": reason });
        if let Some(code) = code {
            data["errorCode"] = json!(code);
        }
        self.ack(ack.expect("verify_auth must request an ack"), data);
    }

    /// Accept auth and consume the `online` presence the client sends next.
    pub async fn accept_and_expect_online(&mut self) {
        self.accept_auth().await;
        let data = self.expect_event(events::USER_STATUS).await;
        assert_eq!(data["status"], "online");
    }

    pub fn push_event(&self, event: &str, data: Value) {
        self.push_frame(&Frame::event(event, data));
    }

    pub fn push_raw(&self, text: &str) {
        let _ = self.to_client.send(Some(Ok(text.to_string())));
    }

    pub fn ack(&self, id: u64, data: Value) {
        self.push_frame(&Frame::Ack { id, data });
    }

    /// Push a `new_message` event.
    pub fn push_message(&self, message: &Message) {
        self.push_event(
            events::NEW_MESSAGE,
            json!({ "chatId": message.chat_id, "message": message }),
        );
    }

    /// Close the connection from the server side.
    pub fn hang_up(&self) {
        let _ = self.to_client.send(None);
    }

    /// Fail the connection with a transport error.
    pub fn fail(&self, reason: &str) {
        let _ = self
            .to_client
            .send(Some(Err(LinkError::TransportReceive(reason.into()))));
    }

    /// Returns `true` once the client called `close()`.
    pub fn client_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn push_frame(&self, frame: &Frame) {
        let text = serde_json::to_string(frame).unwrap();
        let _ = self.to_client.send(Some(Ok(text)));
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// What the connector does for one `connect` call.
pub enum Step {
    Accept,
    Fail(LinkError),
    /// Never resolve; exercises the connect timeout.
    Hang,
}

/// Scripted [`Connector`]. Steps are consumed in order; once the script is
/// exhausted every call is accepted.
#[derive(Clone)]
pub struct MockConnector {
    script: Arc<StdMutex<VecDeque<Step>>>,
    servers: mpsc::UnboundedSender<ServerEnd>,
    connects: Arc<AtomicUsize>,
}

/// Test-side handle of a [`MockConnector`].
pub struct MockServer {
    script: Arc<StdMutex<VecDeque<Step>>>,
    servers: mpsc::UnboundedReceiver<ServerEnd>,
    connects: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn new() -> (Self, MockServer) {
        let script = Arc::new(StdMutex::new(VecDeque::new()));
        let connects = Arc::new(AtomicUsize::new(0));
        let (servers_tx, servers_rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Arc::clone(&script),
                servers: servers_tx,
                connects: Arc::clone(&connects),
            },
            MockServer {
                script,
                servers: servers_rx,
                connects,
            },
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(Step::Accept);
        match step {
            Step::Accept => {}
            Step::Fail(e) => return Err(e),
            Step::Hang => std::future::pending::<()>().await,
        }

        let (to_client, incoming) = mpsc::unbounded_channel();
        let (outgoing, from_client) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let _ = self.servers.send(ServerEnd {
            to_client,
            from_client,
            closed: Arc::clone(&closed),
            credentials: credentials.clone(),
        });
        Ok(Box::new(ChannelTransport {
            incoming,
            outgoing,
            closed,
        }))
    }
}

impl MockServer {
    /// Queue steps for upcoming `connect` calls.
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.script.lock().unwrap().extend(steps);
    }

    /// Queue `n` refused connections.
    pub fn refuse(&self, n: usize) {
        self.script(
            (0..n).map(|_| Step::Fail(LinkError::ConnectFailed("connection refused".into()))),
        );
    }

    /// Wait for the next accepted connection.
    pub async fn next_connection(&mut self) -> ServerEnd {
        tokio::time::timeout(WAIT, self.servers.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped")
    }

    /// Number of `connect` calls made so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub fn buyer() -> Credentials {
    Credentials::new("jwt-buyer", "buyer-1")
}

/// Config with short timers so real-time tests stay fast.
pub fn fast_config() -> LinkConfig {
    LinkConfig::default()
        .with_reconnect_delay(Duration::from_millis(20))
        .with_typing_timeout(Duration::from_millis(200))
}

/// A manager connected as `buyer-1`, with the `online` presence consumed.
pub async fn connected_manager(config: LinkConfig) -> (ConnectionManager, MockServer, ServerEnd) {
    let (connector, mut server) = MockConnector::new();
    let manager = ConnectionManager::new(config, connector);
    let attempt = manager.connect(buyer());
    let mut end = server.next_connection().await;
    end.accept_and_expect_online().await;
    attempt.await.unwrap();
    (manager, server, end)
}

/// An inbound chat message from `sender` in `chat_id`.
pub fn inbound_message(id: &str, chat_id: &str, sender: &str, content: &str) -> Message {
    Message {
        id: id.into(),
        chat_id: chat_id.into(),
        sender_id: sender.into(),
        sender_name: None,
        content: content.into(),
        attachments: Vec::new(),
        created_at: chrono::Utc::now(),
        status: Default::default(),
    }
}

/// Poll `condition` until it holds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}
