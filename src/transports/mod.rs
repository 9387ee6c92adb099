//! Connector and transport implementations.
//!
//! | Feature                | Items                                          |
//! |------------------------|------------------------------------------------|
//! | `transport-websocket`  | [`WebSocketTransport`], [`WebSocketConnector`] |
//! | (always)               | [`FallbackConnector`]                          |

pub mod fallback;

#[cfg(feature = "transport-websocket")]
pub mod websocket;

pub use fallback::FallbackConnector;

#[cfg(feature = "transport-websocket")]
pub use websocket::{WebSocketConnector, WebSocketTransport};
