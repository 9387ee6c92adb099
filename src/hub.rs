//! One place to build and tear down the real-time stack.

use std::sync::Arc;

use tracing::info;

use crate::chat::ChatRoomTracker;
use crate::connection::{ConnectAttempt, ConnectionManager, LinkConfig};
use crate::notifications::NotificationAggregator;
use crate::presence::PresenceSignaler;
use crate::registry::EventRegistry;
use crate::transport::{Connector, Credentials};
use crate::typing::TypingCoordinator;

/// Every real-time component wired around a single [`ConnectionManager`].
///
/// Create one per signed-in application and share it by cloning. Must be
/// created within a Tokio runtime.
#[derive(Debug, Clone)]
pub struct RealtimeHub {
    manager: ConnectionManager,
    chat: ChatRoomTracker,
    presence: PresenceSignaler,
    typing: TypingCoordinator,
    notifications: NotificationAggregator,
}

impl RealtimeHub {
    pub fn init(config: LinkConfig, connector: impl Connector) -> Self {
        let registry = EventRegistry::new();
        let capacity = config.notification_capacity;
        let manager =
            ConnectionManager::with_registry(config, Arc::new(connector), registry.clone());
        Self {
            chat: ChatRoomTracker::new(manager.clone()),
            presence: PresenceSignaler::new(manager.clone()),
            typing: TypingCoordinator::new(manager.clone()),
            notifications: NotificationAggregator::new(registry, capacity),
            manager,
        }
    }

    /// Start notifications for the user and connect.
    pub fn connect(&self, credentials: Credentials) -> ConnectAttempt {
        self.notifications.initialize(&credentials.user_id);
        self.manager.connect(credentials)
    }

    /// Disconnect and drop every registration, including ones made by the
    /// application through [`registry`](Self::registry).
    pub async fn dispose(&self) {
        self.manager.disconnect().await;
        self.notifications.shutdown();
        self.manager.registry().remove_all(None);
        info!("real-time hub disposed");
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn registry(&self) -> &EventRegistry {
        self.manager.registry()
    }

    pub fn chat(&self) -> &ChatRoomTracker {
        &self.chat
    }

    pub fn presence(&self) -> &PresenceSignaler {
        &self.presence
    }

    pub fn typing(&self) -> &TypingCoordinator {
        &self.typing
    }

    pub fn notifications(&self) -> &NotificationAggregator {
        &self.notifications
    }
}
