//! Chat room membership and message sending.
//!
//! The server only fans out `new_message`, `typing` and `message_status` for a
//! chat to sockets that joined its room. [`ChatRoomTracker`] records the room
//! the user is looking at so the [`ConnectionManager`] can rejoin it after a
//! reconnect.

use tracing::{debug, info, warn};

use crate::connection::ConnectionManager;
use crate::error::{LinkError, Result};
use crate::protocol::{
    events, Attachment, Message, MessageStatus, MessageStatusPayload, SendMessageAck,
    SendMessageRequest,
};

/// Joins and leaves chat rooms and sends messages into them.
#[derive(Debug, Clone)]
pub struct ChatRoomTracker {
    manager: ConnectionManager,
}

impl ChatRoomTracker {
    pub fn new(manager: ConnectionManager) -> Self {
        Self { manager }
    }

    /// Make `chat_id` the current room.
    ///
    /// The room is recorded whether or not the link is up; `join_chat` is
    /// emitted only when connected (otherwise the next connection sends it).
    /// Returns `true` if the join was emitted now.
    pub fn join_chat(&self, chat_id: &str) -> bool {
        let sent = self.manager.enter_room(chat_id);
        debug!(chat_id, sent, "join chat");
        sent
    }

    /// Leave `chat_id`.
    ///
    /// Clears the recorded room only if it is `chat_id`. `leave_chat` is
    /// emitted when connected. Returns `true` if the leave was emitted.
    pub fn leave_chat(&self, chat_id: &str) -> bool {
        let sent = self.manager.exit_room(chat_id);
        debug!(chat_id, sent, "leave chat");
        sent
    }

    /// The room that will be rejoined on reconnect.
    pub fn current_chat(&self) -> Option<String> {
        self.manager.current_chat_room()
    }

    /// Send a message and wait for the server to confirm it.
    ///
    /// The message is built locally with a temporary id (see
    /// [`Message::outgoing`]) and reconciled with the stored copy the server
    /// acknowledges with.
    ///
    /// # Errors
    ///
    /// - [`LinkError::NotConnected`] when offline, or if the link drops
    ///   before the acknowledgement
    /// - [`LinkError::MessageRejected`] when the server refuses the message
    /// - [`LinkError::Timeout`] when no acknowledgement arrives in time
    pub async fn send_message(
        &self,
        chat_id: &str,
        content: &str,
        attachments: Vec<Attachment>,
    ) -> Result<Message> {
        let sender_id = self.manager.user_id().ok_or(LinkError::NotConnected)?;
        let mut message = Message::outgoing(chat_id, sender_id, content, attachments);

        let request = SendMessageRequest {
            chat_id: chat_id.to_string(),
            temp_id: message.id.clone(),
            content: message.content.clone(),
            attachments: message.attachments.clone(),
        };
        let reply = self.manager.request(events::SEND_MESSAGE, &request).await?;
        let ack: SendMessageAck = if reply.is_null() {
            SendMessageAck::default()
        } else {
            serde_json::from_value(reply)?
        };

        if ack.error.is_some() || ack.error_code.is_some() {
            let reason = ack
                .error
                .or_else(|| ack.error_code.map(|c| c.description().to_string()))
                .unwrap_or_default();
            warn!(chat_id, temp_id = %message.id, reason = %reason, "message rejected");
            return Err(LinkError::MessageRejected {
                reason,
                code: ack.error_code,
            });
        }

        match ack.message {
            Some(confirmed) => {
                info!(chat_id, temp_id = %message.id, id = %confirmed.id, "message confirmed");
                message.reconcile(&confirmed);
            }
            None => debug!(chat_id, temp_id = %message.id, "message accepted without echo"),
        }
        Ok(message)
    }

    /// Send a delivery or read receipt for `message_id`.
    /// Returns `true` if it was emitted.
    pub fn mark_status(&self, chat_id: &str, message_id: &str, status: MessageStatus) -> bool {
        self.manager.emit(
            events::MESSAGE_STATUS,
            &MessageStatusPayload {
                chat_id: chat_id.to_string(),
                message_id: message_id.to_string(),
                status,
            },
        )
    }
}
