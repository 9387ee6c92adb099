//! # Marketplace Chat Example
//!
//! A buyer-side chat session against a Flock chat server:
//!
//! 1. Connect over WebSocket with a bearer token
//! 2. Join a conversation with a seller and send a message
//! 3. Print inbound messages, typing indicators and unread counts
//! 4. Log out on Ctrl+C, or when the server rejects the token
//!
//! ## Running
//!
//! ```sh
//! FLOCK_TOKEN=<jwt> FLOCK_USER=buyer-1 FLOCK_CHAT=chat-42 \
//!     cargo run --example marketplace_chat
//!
//! # Override the server URL:
//! FLOCK_CHAT_URL=wss://chat.flock.example/ws cargo run --example marketplace_chat
//! ```

use flock_link::protocol::{events, NewMessagePayload, TypingPayload};
use flock_link::{
    ConnectionState, Credentials, LinkConfig, LinkSignal, RealtimeHub, Role, Visibility,
    WebSocketConnector,
};

/// Default server URL when `FLOCK_CHAT_URL` is not set.
const DEFAULT_URL: &str = "ws://localhost:4000/ws";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let url = std::env::var("FLOCK_CHAT_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    let token = std::env::var("FLOCK_TOKEN").unwrap_or_else(|_| "dev-token".to_string());
    let user_id = std::env::var("FLOCK_USER").unwrap_or_else(|_| "buyer-1".to_string());
    let chat_id = std::env::var("FLOCK_CHAT").unwrap_or_else(|_| "chat-42".to_string());
    tracing::info!("Connecting to {url} as {user_id}");

    let hub = RealtimeHub::init(LinkConfig::default(), WebSocketConnector::new(url));

    // ── Subscriptions ───────────────────────────────────────────────
    // Registered before connecting; they stay attached across reconnects.
    hub.registry()
        .on_typed::<NewMessagePayload, _>(events::NEW_MESSAGE, |payload| {
            let m = payload.message;
            tracing::info!(
                "[{}] {}: {}",
                m.chat_id,
                m.sender_name.as_deref().unwrap_or(&m.sender_id),
                m.content
            );
        });
    hub.registry()
        .on_typed::<TypingPayload, _>(events::TYPING, |payload| {
            if payload.is_typing {
                tracing::info!("{} is typing in {}", payload.user_id, payload.chat_id);
            }
        });

    let mut signals = hub.manager().signals();
    let mut states = hub.manager().subscribe_state();
    let mut unread = hub.notifications().subscribe_unread();

    // ── Connect and chat ────────────────────────────────────────────
    let credentials = Credentials::new(token, user_id).with_role(Role::Buyer);
    hub.connect(credentials).await?;

    hub.chat().join_chat(&chat_id);
    hub.presence().visibility_changed(Visibility::Visible);
    hub.typing().notify_typing(&chat_id);

    match hub
        .chat()
        .send_message(&chat_id, "Hi! Are the point-of-lay pullets still available?", vec![])
        .await
    {
        Ok(message) => tracing::info!("Message stored as {}", message.id),
        Err(e) => tracing::warn!("Message not sent: {e}"),
    }
    hub.typing().stop_typing(&chat_id);

    // ── Event loop ──────────────────────────────────────────────────
    loop {
        tokio::select! {
            signal = signals.recv() => {
                match signal {
                    Ok(LinkSignal::AuthFailed { reason, .. }) => {
                        tracing::error!("Session rejected ({reason}); please log in again");
                        break;
                    }
                    Ok(LinkSignal::Degraded { attempts, .. }) => {
                        tracing::warn!("Chat unavailable after {attempts} attempts; retry later");
                        break;
                    }
                    Err(_) => break,
                }
            }

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                tracing::info!("Connection state: {state:?}");
                if state == ConnectionState::Disconnected {
                    break;
                }
            }

            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                tracing::info!("Unread messages: {}", *unread.borrow_and_update());
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, leaving chat");
                hub.chat().leave_chat(&chat_id);
                hub.presence().page_unload();
                break;
            }
        }
    }

    // ── Clean shutdown ──────────────────────────────────────────────
    hub.dispose().await;
    tracing::info!("Disconnected");
    Ok(())
}
