//! The per-conversation message cache: the authoritative, time-ordered
//! view the presentation layer reads. All mutation goes through the sync
//! coordinator's event-handling path; this module itself is single-threaded
//! data structure code.

use crate::delivery::{self, DeliveryStatus};
use crate::history::MessagePage;
use crate::reactions;
use crate::types::chat::ChatId;
use crate::types::message::{Message, MessageId};
use chrono::{DateTime, Utc};
use log::debug;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("message {0} not found")]
    UnknownMessage(String),
}

/// What an upsert did with the incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry inserted at its ordered position.
    Inserted,
    /// An entry with the same id existed and was updated in place.
    Updated,
    /// A pending local entry was replaced by its server-confirmed form.
    Reconciled,
}

#[derive(Debug, Default)]
struct ChatCache {
    /// Ascending by `(created_at, id)`.
    messages: Vec<Message>,
    /// Cursor for the next older page; `None` once history is exhausted.
    oldest_cursor: Option<String>,
    has_more: bool,
    seeded: bool,
}

/// Read-only view handed to consumers.
#[derive(Debug, Clone)]
pub struct ConversationSnapshot {
    pub chat_id: ChatId,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    chats: HashMap<ChatId, ChatCache>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn cache_mut(&mut self, chat_id: &str) -> &mut ChatCache {
        self.chats.entry(chat_id.to_owned()).or_default()
    }

    /// Seeds the cache from the first (newest) history page. Re-seeding an
    /// already-seeded chat merges messages but keeps the deeper pagination
    /// cursor.
    pub fn seed(&mut self, chat_id: &str, page: MessagePage) {
        let first_seed = !self.chats.get(chat_id).map(|c| c.seeded).unwrap_or(false);
        let outcome_count = page.messages.len();
        if first_seed {
            let cache = self.cache_mut(chat_id);
            cache.seeded = true;
            cache.has_more = page.next_cursor.is_some();
            cache.oldest_cursor = page.next_cursor.clone();
        }
        for message in page.messages {
            let _ = self.upsert(message);
        }
        debug!(target: "Store", "Seeded {chat_id} with {outcome_count} messages");
    }

    /// Merges an older page beneath the existing entries and advances the
    /// pagination cursor. A page with no further cursor flips `has_more`
    /// off; that is the "no more history" signal, not an error.
    pub fn merge_older(&mut self, chat_id: &str, page: MessagePage) {
        {
            let cache = self.cache_mut(chat_id);
            cache.has_more = page.next_cursor.is_some();
            cache.oldest_cursor = page.next_cursor.clone();
        }
        for message in page.messages {
            let _ = self.upsert(message);
        }
    }

    /// Inserts or updates one message, deduplicating by id.
    ///
    /// A message carrying a `local_id` correlation token replaces the
    /// pending entry it confirms; a message whose id is already present
    /// updates that entry in place (status forward-only); anything else is
    /// inserted at its ordered position. Duplicate push deliveries
    /// therefore leave exactly one entry per id.
    pub fn upsert(&mut self, message: Message) -> UpsertOutcome {
        let cache = self.cache_mut(&message.chat_id.clone());

        if let Some(token) = message.local_id.as_deref()
            && !message.id.is_local()
            && let Some(idx) = cache
                .messages
                .iter()
                .position(|m| matches!(&m.id, MessageId::Local(id) if id.as_str() == token))
        {
            let pending = cache.messages.remove(idx);
            let mut confirmed = message;
            confirmed.status = delivery::advance(pending.status, confirmed.status);
            Self::insert_ordered(&mut cache.messages, confirmed);
            return UpsertOutcome::Reconciled;
        }

        if let Some(idx) = cache.messages.iter().position(|m| m.id == message.id) {
            let old_status = cache.messages[idx].status;
            let needs_move = cache.messages[idx].created_at != message.created_at;
            let mut updated = message;
            updated.status = delivery::advance(old_status, updated.status);
            if needs_move {
                cache.messages.remove(idx);
                Self::insert_ordered(&mut cache.messages, updated);
            } else {
                cache.messages[idx] = updated;
            }
            return UpsertOutcome::Updated;
        }

        Self::insert_ordered(&mut cache.messages, message);
        UpsertOutcome::Inserted
    }

    fn insert_ordered(messages: &mut Vec<Message>, message: Message) {
        let pos = messages
            .binary_search_by(|m| m.order_key().cmp(&message.order_key()))
            .unwrap_or_else(|pos| pos);
        messages.insert(pos, message);
    }

    /// Applies a status event to an existing entry, forward-only. Returns
    /// whether the stored status changed.
    pub fn apply_status(
        &mut self,
        chat_id: &str,
        id: &MessageId,
        status: DeliveryStatus,
    ) -> Result<bool, StoreError> {
        let message = self
            .find_mut(chat_id, id)
            .ok_or_else(|| StoreError::UnknownMessage(id.to_string()))?;
        let next = delivery::advance(message.status, status);
        let changed = next != message.status;
        message.status = next;
        Ok(changed)
    }

    /// Applies a reaction add/replace/remove to an existing entry.
    pub fn apply_reaction(
        &mut self,
        chat_id: &str,
        message_id: &str,
        user_id: &str,
        emoji: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let id = MessageId::Server(message_id.to_owned());
        let message = self
            .find_mut(chat_id, &id)
            .ok_or_else(|| StoreError::UnknownMessage(message_id.to_owned()))?;
        Ok(reactions::apply(&mut message.reactions, user_id, emoji, at))
    }

    /// In-place mutation hook for the sync coordinator (attaching an
    /// uploaded media reference, advancing a pending entry's status).
    pub(crate) fn modify(
        &mut self,
        chat_id: &str,
        id: &MessageId,
        f: impl FnOnce(&mut Message),
    ) -> Result<(), StoreError> {
        let message = self
            .find_mut(chat_id, id)
            .ok_or_else(|| StoreError::UnknownMessage(id.to_string()))?;
        f(message);
        Ok(())
    }

    pub fn remove(&mut self, chat_id: &str, id: &MessageId) -> bool {
        match self.chats.get_mut(chat_id) {
            Some(cache) => match cache.messages.iter().position(|m| &m.id == id) {
                Some(idx) => {
                    cache.messages.remove(idx);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn clear(&mut self, chat_id: &str) {
        if let Some(cache) = self.chats.get_mut(chat_id) {
            cache.messages.clear();
            cache.has_more = false;
            cache.oldest_cursor = None;
        }
    }

    pub fn contains(&self, chat_id: &str, id: &MessageId) -> bool {
        self.find(chat_id, id).is_some()
    }

    pub fn find(&self, chat_id: &str, id: &MessageId) -> Option<&Message> {
        self.chats
            .get(chat_id)
            .and_then(|c| c.messages.iter().find(|m| &m.id == id))
    }

    fn find_mut(&mut self, chat_id: &str, id: &MessageId) -> Option<&mut Message> {
        self.chats
            .get_mut(chat_id)
            .and_then(|c| c.messages.iter_mut().find(|m| &m.id == id))
    }

    pub fn has_more(&self, chat_id: &str) -> bool {
        self.chats.get(chat_id).map(|c| c.has_more).unwrap_or(false)
    }

    pub fn next_cursor(&self, chat_id: &str) -> Option<String> {
        self.chats.get(chat_id).and_then(|c| c.oldest_cursor.clone())
    }

    pub fn snapshot(&self, chat_id: &str) -> Option<ConversationSnapshot> {
        self.chats.get(chat_id).map(|c| ConversationSnapshot {
            chat_id: chat_id.to_owned(),
            messages: c.messages.clone(),
            has_more: c.has_more,
        })
    }
}
