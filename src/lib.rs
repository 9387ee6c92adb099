//! # Flock Link
//!
//! Real-time chat link for the Flock poultry marketplace.
//!
//! This crate keeps one authenticated connection to the marketplace chat
//! server alive across network interruptions and fans inbound events out to
//! any number of independent subscribers. It speaks JSON text frames over any
//! bidirectional transport.
//!
//! ## Features
//!
//! - **Reconnection** that is invisible to subscribers: listeners, the current
//!   chat room and presence are restored on every new transport
//! - **Transport-agnostic**: implement [`Transport`] and [`Connector`] for any backend
//! - **WebSocket built-in**: the default `transport-websocket` feature provides
//!   [`WebSocketConnector`]
//! - **Typing, presence and notifications** on top of the same link
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn example() -> Result<(), flock_link::LinkError> {
//! use flock_link::{Credentials, LinkConfig, RealtimeHub, WebSocketConnector};
//!
//! let hub = RealtimeHub::init(
//!     LinkConfig::default(),
//!     WebSocketConnector::new("wss://chat.flock.example/ws"),
//! );
//! hub.registry().on("new_message", |payload| println!("{payload}"));
//! hub.connect(Credentials::new("jwt", "buyer-1")).await?;
//!
//! hub.chat().join_chat("chat-42");
//! hub.typing().notify_typing("chat-42");
//! let sent = hub.chat().send_message("chat-42", "Are the pullets vaccinated?", vec![]).await?;
//! println!("delivered as {}", sent.id);
//!
//! hub.dispose().await;
//! # Ok(())
//! # }
//! ```

pub mod chat;
pub mod connection;
pub mod error;
pub mod error_codes;
pub mod hub;
pub mod notifications;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod transports;
pub mod typing;

// Re-export primary types for ergonomic imports.
pub use chat::ChatRoomTracker;
pub use connection::{
    ConnectAttempt, ConnectionManager, ConnectionState, LinkConfig, LinkSignal, Session,
};
pub use error::LinkError;
pub use error_codes::RejectCode;
pub use hub::RealtimeHub;
pub use notifications::{Notification, NotificationAggregator, NotificationSound};
pub use presence::{PresenceSignaler, Visibility};
pub use protocol::{Frame, Message, MessageStatus, PresenceStatus, Role};
pub use registry::{EventRegistry, Listener, Subscription};
pub use transport::{Connector, Credentials, Transport};
pub use transports::FallbackConnector;
pub use typing::TypingCoordinator;

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
