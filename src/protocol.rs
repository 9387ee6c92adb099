//! Wire types for the marketplace chat channel.
//!
//! Every frame is a single JSON text message. Application events travel as
//! [`Frame::Event`]; replies to events that requested an acknowledgement
//! travel as [`Frame::Ack`] carrying the same id. Payload field names are
//! camelCase to match the server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error_codes::RejectCode;

/// Prefix of client-generated message ids that have not been reconciled yet.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Event names used on the channel.
pub mod events {
    /// Post-connect token verification (acknowledged).
    pub const VERIFY_AUTH: &str = "verify_auth";
    /// Join a chat room.
    pub const JOIN_CHAT: &str = "join_chat";
    /// Leave a chat room.
    pub const LEAVE_CHAT: &str = "leave_chat";
    /// Inbound chat message.
    pub const NEW_MESSAGE: &str = "new_message";
    /// Delivery/read receipts, both directions.
    pub const MESSAGE_STATUS: &str = "message_status";
    /// Typing indicator, both directions.
    pub const TYPING: &str = "typing";
    /// Presence broadcast.
    pub const USER_STATUS: &str = "user_status";
    /// Outgoing chat message (acknowledged).
    pub const SEND_MESSAGE: &str = "send_message";
}

// ── Enums ───────────────────────────────────────────────────────────

/// Marketplace role hint supplied at connect time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Buyer,
    Seller,
    Admin,
    DeliveryPartner,
}

impl Role {
    /// The string form sent in the connect request.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buyer => "buyer",
            Self::Seller => "seller",
            Self::Admin => "admin",
            Self::DeliveryPartner => "delivery_partner",
        }
    }
}

/// Presence value broadcast with `user_status`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

/// Delivery state of a chat message. Ordered: `Sent < Delivered < Read`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

// ── Messages ────────────────────────────────────────────────────────

/// A file attached to a chat message (photos of birds, invoices, ...).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

impl Attachment {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            mime_type: None,
            file_name: None,
        }
    }
}

/// A chat message.
///
/// Content and attachments never change after creation; only `status` moves,
/// and only forward (see [`advance_status`](Message::advance_status)).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    /// Display name of the sender, when the server includes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    /// Build an optimistic outgoing message with a temporary client id.
    pub fn outgoing(
        chat_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        attachments: Vec<Attachment>,
    ) -> Self {
        Self {
            id: format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4()),
            chat_id: chat_id.into(),
            sender_id: sender_id.into(),
            sender_name: None,
            content: content.into(),
            attachments,
            created_at: Utc::now(),
            status: MessageStatus::Sent,
        }
    }

    /// Returns `true` while the message still carries its client-generated id.
    pub fn is_pending(&self) -> bool {
        self.id.starts_with(TEMP_ID_PREFIX)
    }

    /// Move the status forward. Returns `false` (and leaves the status alone)
    /// if `status` would not advance it.
    pub fn advance_status(&mut self, status: MessageStatus) -> bool {
        if status > self.status {
            self.status = status;
            true
        } else {
            false
        }
    }

    /// Adopt the server-assigned id, timestamp and status from `confirmed`.
    pub fn reconcile(&mut self, confirmed: &Message) {
        self.id.clone_from(&confirmed.id);
        self.created_at = confirmed.created_at;
        self.advance_status(confirmed.status);
    }

    /// Short preview of the content, at most `max_chars` characters.
    ///
    /// Messages without text fall back to an attachment placeholder.
    pub fn snippet(&self, max_chars: usize) -> String {
        let trimmed = self.content.trim();
        if trimmed.is_empty() && !self.attachments.is_empty() {
            return "Sent an attachment".to_string();
        }
        if trimmed.chars().count() <= max_chars {
            return trimmed.to_string();
        }
        let mut out: String = trimmed.chars().take(max_chars).collect();
        out.push('…');
        out
    }
}

// ── Payloads ────────────────────────────────────────────────────────

/// Payload of `new_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub chat_id: String,
    pub message: Message,
}

/// Payload of `message_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusPayload {
    pub chat_id: String,
    pub message_id: String,
    pub status: MessageStatus,
}

/// Payload of `typing`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    pub chat_id: String,
    pub is_typing: bool,
    pub user_id: String,
}

/// Payload of `user_status`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserStatusPayload {
    pub status: PresenceStatus,
}

/// Payload of `join_chat` and `leave_chat`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatRoomPayload {
    pub chat_id: String,
}

/// Request half of the `verify_auth` handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyAuthRequest {
    pub token: String,
}

/// Acknowledgement of `verify_auth`. Absence of `error` means success.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyAuthAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<RejectCode>,
}

/// Request half of `send_message`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub chat_id: String,
    pub temp_id: String,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Acknowledgement of `send_message`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<RejectCode>,
}

// ── Frames ──────────────────────────────────────────────────────────

/// A single frame on the channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// A named event. `ack` is set when the sender expects an [`Frame::Ack`] back.
    Event {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ack: Option<u64>,
    },
    /// Reply to an event that carried an ack id.
    Ack {
        id: u64,
        #[serde(default)]
        data: serde_json::Value,
    },
}

impl Frame {
    /// Build a fire-and-forget event frame.
    pub fn event(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Event {
            event: event.into(),
            data,
            ack: None,
        }
    }

    /// Build an event frame that requests acknowledgement `id`.
    pub fn event_with_ack(event: impl Into<String>, data: serde_json::Value, id: u64) -> Self {
        Self::Event {
            event: event.into(),
            data,
            ack: Some(id),
        }
    }
}
