pub mod connection;
pub mod delivery;
pub mod error;
pub mod history;
pub mod keepalive;
pub mod presence;
pub mod reactions;
pub mod store;
pub mod sync;
pub mod transport;
pub mod types;
pub mod upload;
pub mod wire;

pub use connection::{ConnectionCommand, ConnectionEvent, ConnectionStatus, PushEvent};
pub use delivery::{DeliveryStatus, SendRetryPolicy};
pub use error::ChatError;
pub use history::{GatewayError, HistoryGateway, MessagePage, NewMessageRequest};
pub use store::{ConversationSnapshot, MessageStore};
pub use sync::{Draft, DraftContent, SyncConfig, SyncCoordinator};
pub use types::{
    Chat, ChatId, ChatSettings, Credential, LocalMessageId, MediaRef, Message, MessageContent,
    MessageId, Reaction, ServerMessageId, UserId,
};
pub use upload::{MediaFile, MediaGateway, UploadPolicy, UploadStatus};
