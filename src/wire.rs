//! JSON frame protocol spoken over the persistent channel.
//!
//! Unknown or malformed inbound frames are tolerated: the connection logs
//! and skips them rather than dropping the channel.

use crate::delivery::DeliveryStatus;
use crate::types::chat::{ChatId, UserId};
use crate::types::message::{Message, ServerMessageId};
use serde::{Deserialize, Serialize};

/// Frames this client sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    /// First frame after the transport comes up; the server answers with
    /// `authOk` or `authErr`.
    Auth { credential: String },
    Subscribe { chat_id: ChatId },
    Unsubscribe { chat_id: ChatId },
    #[serde(rename = "typing:start")]
    TypingStart { chat_id: ChatId },
    #[serde(rename = "typing:stop")]
    TypingStop { chat_id: ChatId },
    Ping,
}

/// Frames the server pushes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    AuthOk {
        session_id: String,
    },
    AuthErr {
        reason: String,
    },
    /// A new message arrived in a subscribed chat (or an own message was
    /// confirmed; those echo `localId`).
    Message {
        message: Box<Message>,
    },
    /// Status transition for an existing message id.
    MessageStatus {
        chat_id: ChatId,
        message_id: ServerMessageId,
        status: DeliveryStatus,
    },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        started: bool,
    },
    /// Reaction change; `emoji: None` clears the user's reaction.
    Reaction {
        chat_id: ChatId,
        message_id: ServerMessageId,
        user_id: UserId,
        emoji: Option<String>,
    },
    Pong,
}

pub fn encode(frame: &ClientFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}

pub fn decode(raw: &str) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_str(raw)
}
