//! # Loopback Connector Example
//!
//! Shows how to implement [`Transport`] and [`Connector`] with in-process
//! channels, and how the link recovers when the "server" drops the
//! connection:
//!
//! 1. A fake chat server answers `verify_auth` on every connection
//! 2. The client joins a chat room and receives a message
//! 3. The server hangs up; the link reconnects and rejoins the room
//! 4. The same subscriber keeps receiving messages
//!
//! ## Running
//!
//! ```sh
//! cargo run --example loopback_connector
//! ```

use std::time::Duration;

use async_trait::async_trait;
use flock_link::protocol::{events, Frame, NewMessagePayload};
use flock_link::{Connector, Credentials, LinkConfig, LinkError, RealtimeHub, Transport};
use serde_json::json;
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Step 1: A channel-based transport
// ─────────────────────────────────────────────────────────────────────

/// Client half of an in-process connection.
pub struct LoopbackTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<String>,
}

/// Server half: read what the client sent, push frames back.
pub struct LoopbackServer {
    pub rx: mpsc::UnboundedReceiver<String>,
    pub tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&mut self, message: String) -> Result<(), LinkError> {
        self.tx
            .send(message)
            .map_err(|e| LinkError::TransportSend(e.to_string()))
    }

    /// `None` once the server half is dropped. Cancel-safe because
    /// `mpsc::UnboundedReceiver::recv` is.
    async fn recv(&mut self) -> Option<Result<String, LinkError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 2: A connector that hands each server half to the fake server
// ─────────────────────────────────────────────────────────────────────

struct LoopbackConnector {
    accepted: mpsc::UnboundedSender<LoopbackServer>,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, LinkError> {
        tracing::info!(user_id = %credentials.user_id, "loopback connect");
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        self.accepted
            .send(LoopbackServer {
                rx: server_rx,
                tx: server_tx,
            })
            .map_err(|_| LinkError::ConnectFailed("server is gone".into()))?;
        Ok(Box::new(LoopbackTransport {
            tx: client_tx,
            rx: client_rx,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────
// Step 3: The fake chat server
// ─────────────────────────────────────────────────────────────────────

/// Serve one connection: acknowledge `verify_auth`, deliver a message after
/// `join_chat`, and hang up after `hang_up_after` messages.
async fn serve(mut conn: LoopbackServer, greeting: &str, hang_up_after: Option<usize>) {
    let mut delivered = 0;
    while let Some(text) = conn.rx.recv().await {
        let Ok(Frame::Event { event, data, ack }) = serde_json::from_str::<Frame>(&text) else {
            continue;
        };
        tracing::info!("server received {event}: {data}");

        if let Some(id) = ack {
            let reply = Frame::Ack { id, data: json!({}) };
            let _ = conn.tx.send(serde_json::to_string(&reply).unwrap_or_default());
        }

        if event == events::JOIN_CHAT {
            let chat_id = data["chatId"].as_str().unwrap_or_default().to_string();
            let message = json!({
                "chatId": chat_id,
                "message": {
                    "id": format!("srv-{delivered}-{greeting}"),
                    "chatId": chat_id,
                    "senderId": "seller-9",
                    "senderName": "Green Acres Poultry",
                    "content": greeting,
                    "createdAt": chrono::Utc::now(),
                }
            });
            let frame = Frame::event(events::NEW_MESSAGE, message);
            let _ = conn.tx.send(serde_json::to_string(&frame).unwrap_or_default());
            delivered += 1;
            if hang_up_after == Some(delivered) {
                tracing::warn!("server hanging up");
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
    let config = LinkConfig::default().with_reconnect_delay(Duration::from_millis(200));
    let hub = RealtimeHub::init(config, LoopbackConnector { accepted: accepted_tx });

    // ── Subscribe before connecting; survives the reconnect ─────────
    let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
    hub.registry()
        .on_typed::<NewMessagePayload, _>(events::NEW_MESSAGE, move |payload| {
            let _ = seen_tx.send(payload.message.content);
        });

    // ── Fake server: first connection hangs up, second stays ────────
    let server = tokio::spawn(async move {
        if let Some(conn) = accepted_rx.recv().await {
            serve(conn, "Fresh eggs every morning", Some(1)).await;
        }
        if let Some(conn) = accepted_rx.recv().await {
            serve(conn, "We're back, pullets ship Friday", None).await;
        }
    });

    hub.chat().join_chat("chat-42");
    hub.connect(Credentials::new("demo-token", "buyer-1")).await?;

    for _ in 0..2 {
        match tokio::time::timeout(Duration::from_secs(5), seen_rx.recv()).await {
            Ok(Some(content)) => tracing::info!("subscriber got: {content}"),
            _ => return Err("no message received".into()),
        }
    }

    tracing::info!(
        unread = hub.notifications().unread_count(),
        room = ?hub.chat().current_chat(),
        "still subscribed after reconnect"
    );

    hub.dispose().await;
    server.abort();
    tracing::info!("Done. Custom connector works!");
    Ok(())
}
