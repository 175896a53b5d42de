use crate::delivery::DeliveryStatus;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

/// Id assigned by the server, globally unique. Never generated locally.
pub type ServerMessageId = String;
/// Transient id generated by this client for a not-yet-confirmed message.
/// Doubles as the correlation token echoed back in the server's confirmation.
pub type LocalMessageId = String;

/// A message is keyed either by its transient local id (pending, not yet
/// acknowledged by the server) or by its server-assigned id. Exactly one
/// reconciliation step replaces the former with the latter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Local(LocalMessageId),
    Server(ServerMessageId),
}

impl MessageId {
    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Local(id) => id,
            MessageId::Server(id) => id,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, MessageId::Local(_))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// On the wire a message id is a plain string and always server-assigned;
// local ids only ever travel in the dedicated `localId` correlation field.
impl Serialize for MessageId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(MessageId::Server(String::deserialize(deserializer)?))
    }
}

/// Server-side reference to an uploaded media object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub url: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

/// Message body, discriminated by content type. Media variants carry an
/// optional caption in `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "contentType", rename_all = "lowercase")]
pub enum MessageContent {
    Text {
        content: String,
    },
    Emoji {
        content: String,
    },
    Image {
        #[serde(default)]
        content: String,
        media: MediaRef,
    },
    File {
        #[serde(default)]
        content: String,
        media: MediaRef,
    },
}

impl MessageContent {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageContent::Text { .. } => "text",
            MessageContent::Emoji { .. } => "emoji",
            MessageContent::Image { .. } => "image",
            MessageContent::File { .. } => "file",
        }
    }

    pub fn text(&self) -> &str {
        match self {
            MessageContent::Text { content }
            | MessageContent::Emoji { content }
            | MessageContent::Image { content, .. }
            | MessageContent::File { content, .. } => content,
        }
    }

    pub fn media(&self) -> Option<&MediaRef> {
        match self {
            MessageContent::Image { media, .. } | MessageContent::File { media, .. } => Some(media),
            _ => None,
        }
    }
}

/// One user's emoji reaction to a message. At most one per (message, user);
/// a later reaction from the same user replaces the earlier one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub user_id: super::UserId,
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

/// The atomic unit of conversation content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub chat_id: super::ChatId,
    pub sender_id: super::UserId,
    pub receiver_id: super::UserId,
    #[serde(flatten)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ServerMessageId>,
    /// Correlation token echoed by the server for messages this client sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<LocalMessageId>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

impl Message {
    /// Total display-order key: primary `created_at`, ties broken by lexical
    /// id so every reader observes the same order.
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Generates a local message id by hashing the current time, the sender
/// identity and fresh random bytes. The fixed prefix keeps local ids
/// visually distinct from anything the server assigns.
pub fn generate_local_id(sender_id: &str) -> LocalMessageId {
    let mut data = Vec::with_capacity(8 + sender_id.len() + 16);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    data.extend_from_slice(&timestamp.to_be_bytes());
    data.extend_from_slice(sender_id.as_bytes());

    let mut random_bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut random_bytes);
    data.extend_from_slice(&random_bytes);

    let hash = Sha256::digest(&data);
    format!("LM{}", hex::encode(&hash[..9]).to_uppercase())
}
