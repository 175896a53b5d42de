//! Client-observable contract of the REST history backend. The transport
//! and persistence behind these calls live outside this subsystem; the
//! embedding application supplies an implementation.

use crate::types::chat::{Chat, ChatId, UserId};
use crate::types::message::{
    LocalMessageId, Message, MessageContent, ServerMessageId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One page of history, newest-page-first pagination. Messages are ordered
/// ascending by `created_at` within the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<Message>,
    /// Cursor for the next *older* page. `None` means no more history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Payload for submitting a new message. `local_id` is the correlation
/// token; the server echoes it in the confirmed message so the optimistic
/// entry can be reconciled.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageRequest {
    pub chat_id: ChatId,
    pub local_id: LocalMessageId,
    pub sender_id: UserId,
    pub receiver_id: UserId,
    #[serde(flatten)]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ServerMessageId>,
}

/// Failure classification for gateway calls. The class decides the retry
/// behavior: only `Transient`/`Timeout` are ever retried.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("transient network error: {0}")]
    Transient(String),
    #[error("request timed out")]
    Timeout,
    #[error("request rejected: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("permanently rejected: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_) | GatewayError::Timeout)
    }
}

/// REST-style history backend, one method per consumed endpoint.
#[async_trait]
pub trait HistoryGateway: Send + Sync {
    /// Fetch chat metadata (participants, settings).
    async fn chat(&self, chat_id: &str) -> Result<Chat, GatewayError>;

    /// Fetch a page of message history. `cursor` of `None` requests the
    /// newest page.
    async fn fetch_page(
        &self,
        chat_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<MessagePage, GatewayError>;

    /// Submit a new message; returns the server-confirmed message with its
    /// assigned id, echoing `local_id`.
    async fn submit(&self, request: NewMessageRequest) -> Result<Message, GatewayError>;

    async fn delete_message(&self, chat_id: &str, message_id: &str) -> Result<(), GatewayError>;

    async fn mark_read(
        &self,
        chat_id: &str,
        message_ids: &[ServerMessageId],
    ) -> Result<(), GatewayError>;

    /// Set (`Some`) or clear (`None`) the calling user's reaction.
    async fn set_reaction(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: Option<&str>,
    ) -> Result<(), GatewayError>;

    async fn clear_history(&self, chat_id: &str) -> Result<(), GatewayError>;
}
