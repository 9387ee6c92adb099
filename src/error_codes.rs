//! Structured rejection codes sent by the marketplace chat server.
//!
//! Codes appear in `verify_auth` and `send_message` acknowledgements and
//! serialize as `SCREAMING_SNAKE_CASE` strings (e.g. `"TOKEN_EXPIRED"`).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Structured rejection codes returned by the chat server.
///
/// Use [`description()`](RejectCode::description) for a human-readable explanation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    // Authentication
    Unauthorized,
    InvalidToken,
    TokenExpired,
    AccountSuspended,
    RoleNotPermitted,

    // Chat membership
    ChatNotFound,
    NotAChatMember,
    ChatClosed,

    // Message validation
    EmptyMessage,
    MessageTooLarge,
    TooManyAttachments,
    UnsupportedAttachment,

    // Rate limiting
    RateLimitExceeded,

    // Server
    InternalError,
    ServiceUnavailable,
}

impl RejectCode {
    /// Returns a human-readable description of this code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Unauthorized => "You are not signed in. Please log in again.",
            Self::InvalidToken => {
                "Your session token is invalid or malformed. Please log in again."
            }
            Self::TokenExpired => "Your session has expired. Please log in again.",
            Self::AccountSuspended => {
                "This account has been suspended. Contact marketplace support for assistance."
            }
            Self::RoleNotPermitted => "Your account role is not allowed to use chat.",

            Self::ChatNotFound => "This conversation no longer exists.",
            Self::NotAChatMember => "You are not a participant in this conversation.",
            Self::ChatClosed => "This conversation has been closed by the seller or an admin.",

            Self::EmptyMessage => "Messages must contain text or at least one attachment.",
            Self::MessageTooLarge => "The message is too long. Please shorten it and try again.",
            Self::TooManyAttachments => "Too many attachments. Remove some and try again.",
            Self::UnsupportedAttachment => "One of the attachments has an unsupported file type.",

            Self::RateLimitExceeded => {
                "You are sending messages too quickly. Please wait a moment and try again."
            }

            Self::InternalError => "Something went wrong on our side. Please try again.",
            Self::ServiceUnavailable => {
                "Chat is temporarily unavailable. Please try again in a few moments."
            }
        }
    }

    /// Returns `true` if the code means the user must sign in again.
    pub fn requires_login(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::InvalidToken | Self::TokenExpired
        )
    }
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&RejectCode::NotAChatMember).unwrap();
        assert_eq!(json, "\"NOT_A_CHAT_MEMBER\"");

        let code: RejectCode = serde_json::from_str("\"TOKEN_EXPIRED\"").unwrap();
        assert_eq!(code, RejectCode::TokenExpired);
    }

    #[test]
    fn login_codes() {
        assert!(RejectCode::TokenExpired.requires_login());
        assert!(RejectCode::InvalidToken.requires_login());
        assert!(!RejectCode::RateLimitExceeded.requires_login());
    }

    #[test]
    fn display_uses_description() {
        assert_eq!(
            RejectCode::ChatClosed.to_string(),
            RejectCode::ChatClosed.description()
        );
    }
}
