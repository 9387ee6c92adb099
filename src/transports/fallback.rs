//! Primary/fallback connector composition.
//!
//! The chat server accepts WebSocket connections and, for networks that
//! block upgrades, a long-poll channel. [`FallbackConnector`] tries the
//! primary connector first and falls back within the same attempt, so the
//! reconnect budget counts one attempt per pair.

use async_trait::async_trait;

use crate::error::LinkError;
use crate::transport::{Connector, Credentials, Transport};

/// Tries `primary`, then `fallback` if the primary fails with a retryable error.
#[derive(Debug, Clone)]
pub struct FallbackConnector<P, F> {
    primary: P,
    fallback: F,
}

impl<P: Connector, F: Connector> FallbackConnector<P, F> {
    pub fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl<P: Connector, F: Connector> Connector for FallbackConnector<P, F> {
    async fn connect(&self, credentials: &Credentials) -> Result<Box<dyn Transport>, LinkError> {
        match self.primary.connect(credentials).await {
            Ok(transport) => Ok(transport),
            Err(e) if e.is_retryable() => {
                tracing::warn!(error = %e, "primary transport failed, trying fallback");
                self.fallback.connect(credentials).await
            }
            Err(e) => Err(e),
        }
    }
}
