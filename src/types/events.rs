use crate::types::chat::{ChatId, UserId};
use crate::types::message::MessageId;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// The channel came up (subscriptions for all open chats have been
/// re-established, so the session is fully recovered).
#[derive(Debug, Clone)]
pub struct Connected;

#[derive(Debug, Clone)]
pub struct Disconnected {
    /// True when the disconnect was requested locally.
    pub expected: bool,
}

/// A chat's cached message sequence changed (new message, reconciliation,
/// status or reaction update, removal). Consumers re-read the snapshot.
#[derive(Debug, Clone)]
pub struct ChatUpdated {
    pub chat_id: ChatId,
}

#[derive(Debug, Clone)]
pub struct TypingUpdate {
    pub chat_id: ChatId,
    pub user_id: UserId,
    pub is_typing: bool,
}

/// An outbound message gave up (validation rejection or exhausted retry
/// budget). The entry stays in history as `failed` with a retry affordance.
#[derive(Debug, Clone)]
pub struct SendFailed {
    pub chat_id: ChatId,
    pub message_id: MessageId,
    pub error: String,
}

/// A user-visible, non-fatal notice (e.g. reacting to a message that was
/// deleted in the meantime).
#[derive(Debug, Clone)]
pub struct Notice {
    pub chat_id: Option<ChatId>,
    pub text: String,
}

// Macro to generate EventBus fields and constructor
macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus that provides separate broadcast channels for each event type.
        /// Subscribers pick the channels they care about; lagging subscribers drop
        /// oldest events rather than blocking the producers.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    // Connection lifecycle
    (connected, Arc<Connected>),
    (disconnected, Arc<Disconnected>),

    // Conversation state
    (chat_updated, Arc<ChatUpdated>),
    (typing, Arc<TypingUpdate>),
    (send_failed, Arc<SendFailed>),
    (notice, Arc<Notice>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
