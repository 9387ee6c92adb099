//! Presence signalling driven by application visibility.

use tracing::debug;

use crate::connection::ConnectionManager;
use crate::protocol::{events, PresenceStatus, UserStatusPayload};

/// Visibility of the host application window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

impl Visibility {
    /// Presence status reported for this visibility.
    pub fn presence(self) -> PresenceStatus {
        match self {
            Self::Visible => PresenceStatus::Online,
            Self::Hidden => PresenceStatus::Away,
        }
    }
}

/// Maps visibility changes and page unload onto `user_status` events.
///
/// Every call emits when connected, even if the status did not change. The
/// server treats repeats as heartbeats.
#[derive(Debug, Clone)]
pub struct PresenceSignaler {
    manager: ConnectionManager,
}

impl PresenceSignaler {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Report a visibility change. Returns `true` if a status was emitted.
    pub fn visibility_changed(&self, visibility: Visibility) -> bool {
        self.set_status(visibility.presence())
    }

    /// Report that the application is going away.
    pub fn page_unload(&self) -> bool {
        self.set_status(PresenceStatus::Offline)
    }

    /// Emit an explicit status.
    pub fn set_status(&self, status: PresenceStatus) -> bool {
        let sent = self
            .manager
            .emit(events::USER_STATUS, &UserStatusPayload { status });
        debug!(?status, sent, "presence update");
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_maps_to_presence() {
        assert_eq!(Visibility::Visible.presence(), PresenceStatus::Online);
        assert_eq!(Visibility::Hidden.presence(), PresenceStatus::Away);
    }
}
