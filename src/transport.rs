//! Transport abstraction for the marketplace chat channel.
//!
//! A [`Transport`] is one live bidirectional text channel. Transports are
//! disposable: when one drops, the [`ConnectionManager`](crate::ConnectionManager)
//! asks its [`Connector`] for a fresh one. Subscribers never see the swap.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use flock_link::error::LinkError;
//! use flock_link::transport::{Connector, Credentials, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, message: String) -> Result<(), LinkError> {
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<String, LinkError>> {
//!         // Return None when the server closes the connection cleanly
//!         todo!()
//!     }
//!
//!     async fn close(&mut self) -> Result<(), LinkError> {
//!         todo!()
//!     }
//! }
//!
//! struct MyConnector;
//!
//! #[async_trait]
//! impl Connector for MyConnector {
//!     async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, LinkError> {
//!         Ok(Box::new(MyTransport { /* ... */ }))
//!     }
//! }
//! ```

use async_trait::async_trait;

use crate::error::LinkError;
use crate::protocol::Role;

/// A bidirectional text message transport.
///
/// Each call to [`send`](Transport::send) transmits one complete JSON frame.
/// Each call to [`recv`](Transport::recv) returns one complete JSON frame.
///
/// # Object Safety
///
/// This trait is object-safe; connectors hand out `Box<dyn Transport>`.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because it is polled
/// inside `tokio::select!`. Channel-based implementations are naturally
/// cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send a JSON text frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, message: String) -> Result<(), LinkError>;

    /// Receive the next JSON text frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(text))`: a complete frame was received
    /// - `Some(Err(e))`: a transport error occurred
    /// - `None`: the server closed the connection cleanly
    async fn recv(&mut self) -> Option<Result<String, LinkError>>;

    /// Close the transport connection gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources in that case.
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Identity presented when opening a transport.
///
/// The bearer token is sent with the connect request and verified again by
/// the `verify_auth` handshake once the transport is up.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token issued at login.
    pub token: String,
    /// Marketplace user id of the signed-in user.
    pub user_id: String,
    /// Role hint forwarded to the server.
    pub role: Role,
}

impl Credentials {
    /// Create credentials with the default (`buyer`) role.
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
            role: Role::default(),
        }
    }

    /// Set the role hint.
    #[must_use]
    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// `Authorization` header value for the connect request.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &"<redacted>")
            .field("user_id", &self.user_id)
            .field("role", &self.role)
            .finish()
    }
}

/// Factory for fresh transport instances.
///
/// The connection manager calls [`connect`](Connector::connect) once per
/// attempt, including every reconnect, and enforces its own timeout around it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a new transport authenticated with `credentials`.
    ///
    /// # Errors
    ///
    /// Any error counts as a failed attempt against the reconnect budget.
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, LinkError>;
}
