pub mod chat;
pub mod events;
pub mod message;

pub use chat::{Chat, ChatId, ChatSettings, Credential, UserId};
pub use message::{
    LocalMessageId, MediaRef, Message, MessageContent, MessageId, Reaction, ServerMessageId,
};
