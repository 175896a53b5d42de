//! The sync coordinator: single entry point for the presentation layer.
//!
//! It hides whether data arrived by push or by pull. Every mutation of a
//! chat's cached state — user action, push event, completed fetch, send
//! result — funnels through one serialized event loop, so partial updates
//! never interleave. Callers do their network waits outside the loop and
//! hand the results in as actions.

use crate::connection::{
    ConnectionCommand, ConnectionEvent, ConnectionStatus, PushEvent, spawn_connection_manager,
};
use crate::delivery::{DeliveryStatus, SendRetryPolicy};
use crate::error::ChatError;
use crate::history::{GatewayError, HistoryGateway, MessagePage, NewMessageRequest};
use crate::presence::PresenceTracker;
use crate::store::{ConversationSnapshot, MessageStore};
use crate::transport::TransportFactory;
use crate::types::chat::{Chat, ChatId, Credential, UserId};
use crate::types::events::{ChatUpdated, Connected, Disconnected, EventBus, Notice, SendFailed};
use crate::types::message::{
    self, LocalMessageId, MediaRef, Message, MessageContent, MessageId, ServerMessageId,
};
use crate::upload::{MediaFile, MediaGateway, UploadCoordinator, UploadError, UploadPolicy};
use dashmap::DashMap;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::timeout;

const DEFAULT_PAGE_SIZE: usize = 30;
const ACTION_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub credential: Credential,
    pub user_id: UserId,
    pub page_size: usize,
    pub retry: SendRetryPolicy,
    pub upload_policy: UploadPolicy,
}

impl SyncConfig {
    pub fn new(credential: Credential, user_id: impl Into<UserId>) -> Self {
        Self {
            credential,
            user_id: user_id.into(),
            page_size: DEFAULT_PAGE_SIZE,
            retry: SendRetryPolicy::default(),
            upload_policy: UploadPolicy::default(),
        }
    }
}

/// What the caller wants to say.
#[derive(Debug, Clone)]
pub enum DraftContent {
    Text(String),
    Emoji(String),
    Media { file: MediaFile, caption: String },
}

#[derive(Debug, Clone)]
pub struct Draft {
    pub content: DraftContent,
    pub reply_to: Option<ServerMessageId>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: DraftContent::Text(text.into()),
            reply_to: None,
        }
    }

    pub fn media(file: MediaFile, caption: impl Into<String>) -> Self {
        Self {
            content: DraftContent::Media {
                file,
                caption: caption.into(),
            },
            reply_to: None,
        }
    }
}

/// Book-keeping for a message that has not been confirmed by the server.
/// Owned by the sync loop; drivers report in through actions.
struct PendingSend {
    chat_id: ChatId,
    receiver_id: UserId,
    draft: Draft,
    /// Set once the attachment upload finished; a manual retry reuses it
    /// instead of re-uploading.
    media_ref: Option<MediaRef>,
    upload_abort: Option<AbortHandle>,
    /// Waiting for the channel to recover before retrying.
    parked: bool,
}

enum SyncAction {
    OpenChat {
        chat: Box<Chat>,
        page: MessagePage,
        ack: oneshot::Sender<()>,
    },
    CloseChat {
        chat_id: ChatId,
    },
    StartSend {
        message: Box<Message>,
        receiver_id: UserId,
        draft: Draft,
        ack: oneshot::Sender<()>,
    },
    RegisterUpload {
        local_id: LocalMessageId,
        abort: AbortHandle,
    },
    UploadDone {
        chat_id: ChatId,
        local_id: LocalMessageId,
        media: MediaRef,
    },
    SendCancelled {
        chat_id: ChatId,
        local_id: LocalMessageId,
    },
    SendFinished {
        chat_id: ChatId,
        local_id: LocalMessageId,
        result: Result<Box<Message>, ChatError>,
    },
    ParkSend {
        local_id: LocalMessageId,
    },
    RetrySend {
        chat_id: ChatId,
        local_id: LocalMessageId,
        ack: oneshot::Sender<Result<(), ChatError>>,
    },
    MarkReadLocal {
        chat_id: ChatId,
        message_ids: Vec<ServerMessageId>,
    },
    ApplyReaction {
        chat_id: ChatId,
        message_id: ServerMessageId,
        user_id: UserId,
        emoji: Option<String>,
        ack: Option<oneshot::Sender<Result<(), ChatError>>>,
    },
    RemoveMessage {
        chat_id: ChatId,
        message_id: ServerMessageId,
    },
    ClearChat {
        chat_id: ChatId,
    },
    MergeOlder {
        chat_id: ChatId,
        page: MessagePage,
        ack: oneshot::Sender<bool>,
    },
    Stop,
}

/// Shared context handed to send-driver tasks.
#[derive(Clone)]
struct DriverCtx {
    history: Arc<dyn HistoryGateway>,
    uploads: Arc<UploadCoordinator>,
    actions: mpsc::Sender<SyncAction>,
    status: Arc<ConnectionStatus>,
    retry: SendRetryPolicy,
}

pub struct SyncCoordinator {
    config: SyncConfig,
    history: Arc<dyn HistoryGateway>,
    store: Arc<RwLock<MessageStore>>,
    chats: Arc<DashMap<ChatId, Chat>>,
    presence: PresenceTracker,
    bus: Arc<EventBus>,
    conn_tx: mpsc::Sender<ConnectionCommand>,
    conn_status: Arc<ConnectionStatus>,
    action_tx: mpsc::Sender<SyncAction>,
}

impl SyncCoordinator {
    /// Builds the coordinator, spawns the connection actor and the sync
    /// loop, and starts bringing the channel up. Must be called within a
    /// tokio runtime.
    pub fn start(
        config: SyncConfig,
        history: Arc<dyn HistoryGateway>,
        media: Arc<dyn MediaGateway>,
        transport: Arc<dyn TransportFactory>,
    ) -> Arc<Self> {
        let (conn_tx, conn_events, conn_status) =
            spawn_connection_manager(transport, config.credential.clone());
        let bus = Arc::new(EventBus::new());
        let presence = PresenceTracker::new(conn_tx.clone(), bus.clone());
        let store = Arc::new(RwLock::new(MessageStore::new()));
        let chats: Arc<DashMap<ChatId, Chat>> = Arc::new(DashMap::new());
        let uploads = Arc::new(UploadCoordinator::new(media, config.upload_policy.clone()));
        let (action_tx, action_rx) = mpsc::channel(ACTION_BUFFER);

        let worker = SyncWorker {
            config: config.clone(),
            history: history.clone(),
            uploads,
            store: store.clone(),
            chats: chats.clone(),
            presence: presence.clone(),
            bus: bus.clone(),
            conn_tx: conn_tx.clone(),
            conn_status: conn_status.clone(),
            action_tx: action_tx.clone(),
            pending: HashMap::new(),
        };
        tokio::spawn(worker.run(action_rx, conn_events));

        if conn_tx.try_send(ConnectionCommand::Connect).is_err() {
            warn!(target: "Sync", "Connection actor unavailable at startup");
        }

        Arc::new(Self {
            config,
            history,
            store,
            chats,
            presence,
            bus,
            conn_tx,
            conn_status,
            action_tx,
        })
    }

    /// Seeds the conversation from the newest history page and registers
    /// the chat on the push channel.
    pub async fn open_chat(&self, chat_id: &str) -> Result<(), ChatError> {
        let chat = self.history.chat(chat_id).await?;
        let page = self
            .history
            .fetch_page(chat_id, None, self.config.page_size)
            .await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.dispatch(SyncAction::OpenChat {
            chat: Box::new(chat),
            page,
            ack: ack_tx,
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| ChatError::Transient("sync loop stopped".to_string()))
    }

    /// Unsubscribes the chat and cancels in-flight uploads for its unsent
    /// messages. Already-submitted sends keep reconciling in the
    /// background.
    pub async fn close_chat(&self, chat_id: &str) {
        let _ = self
            .dispatch(SyncAction::CloseChat {
                chat_id: chat_id.to_owned(),
            })
            .await;
    }

    /// Sends a message with an optimistic local entry. Returns the local
    /// correlation id; the entry is visible (status `sending`, or
    /// `composing` while an attachment uploads) before the server ever
    /// responds. Validation failures are synchronous and leave no entry.
    pub async fn send_message(
        &self,
        chat_id: &str,
        draft: Draft,
    ) -> Result<LocalMessageId, ChatError> {
        let chat = self
            .chats
            .get(chat_id)
            .map(|entry| entry.clone())
            .ok_or_else(|| ChatError::ChatNotOpen(chat_id.to_owned()))?;
        if chat.settings.blocked {
            return Err(ChatError::Permanent("chat is blocked".to_string()));
        }
        let receiver_id = chat
            .peer_of(&self.config.user_id)
            .cloned()
            .ok_or_else(|| {
                ChatError::Validation("current user is not a participant".to_string())
            })?;

        match &draft.content {
            DraftContent::Text(text) if text.trim().is_empty() => {
                return Err(ChatError::Validation("message text is empty".to_string()));
            }
            DraftContent::Emoji(emoji) if emoji.is_empty() => {
                return Err(ChatError::Validation("emoji content is empty".to_string()));
            }
            DraftContent::Media { file, .. } => {
                // Fail fast, before any entry exists or any byte moves.
                self.config.upload_policy.validate(file)?;
            }
            _ => {}
        }

        let local_id = message::generate_local_id(&self.config.user_id);
        let has_media = matches!(draft.content, DraftContent::Media { .. });
        let optimistic = Message {
            id: MessageId::Local(local_id.clone()),
            chat_id: chat_id.to_owned(),
            sender_id: self.config.user_id.clone(),
            receiver_id: receiver_id.clone(),
            content: build_content(&draft.content, None),
            reply_to: draft.reply_to.clone(),
            local_id: Some(local_id.clone()),
            status: if has_media {
                DeliveryStatus::Composing
            } else {
                DeliveryStatus::Sending
            },
            created_at: chrono::Utc::now(),
            reactions: vec![],
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        self.dispatch(SyncAction::StartSend {
            message: Box::new(optimistic),
            receiver_id,
            draft,
            ack: ack_tx,
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| ChatError::Transient("sync loop stopped".to_string()))?;
        Ok(local_id)
    }

    /// Manually retries a failed send with the same content; an
    /// already-uploaded attachment is reused, not re-uploaded.
    pub async fn retry_message(
        &self,
        chat_id: &str,
        local_id: &str,
    ) -> Result<(), ChatError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.dispatch(SyncAction::RetrySend {
            chat_id: chat_id.to_owned(),
            local_id: local_id.to_owned(),
            ack: ack_tx,
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| ChatError::Transient("sync loop stopped".to_string()))?
    }

    /// Marks the given (received) messages as read, server first, then the
    /// local cache.
    pub async fn mark_read(
        &self,
        chat_id: &str,
        message_ids: Vec<ServerMessageId>,
    ) -> Result<(), ChatError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        self.history.mark_read(chat_id, &message_ids).await?;
        self.dispatch(SyncAction::MarkReadLocal {
            chat_id: chat_id.to_owned(),
            message_ids,
        })
        .await
    }

    /// Sets (`Some`) or clears (`None`) the current user's reaction.
    /// Reacting to a message that no longer exists is surfaced as a
    /// conflict notice and leaves local state unchanged.
    pub async fn react(
        &self,
        chat_id: &str,
        message_id: &str,
        emoji: Option<String>,
    ) -> Result<(), ChatError> {
        let known = self
            .store_read()
            .contains(chat_id, &MessageId::Server(message_id.to_owned()));
        if !known {
            self.notify_conflict(chat_id, "that message no longer exists");
            return Err(ChatError::Conflict("message no longer exists".to_string()));
        }

        match self.history.set_reaction(chat_id, message_id, emoji.as_deref()).await {
            Ok(()) => {}
            Err(GatewayError::Conflict(reason)) => {
                self.notify_conflict(chat_id, &reason);
                return Err(ChatError::Conflict(reason));
            }
            Err(e) => return Err(e.into()),
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.dispatch(SyncAction::ApplyReaction {
            chat_id: chat_id.to_owned(),
            message_id: message_id.to_owned(),
            user_id: self.config.user_id.clone(),
            emoji,
            ack: Some(ack_tx),
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| ChatError::Transient("sync loop stopped".to_string()))?
    }

    pub async fn delete_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<(), ChatError> {
        self.history.delete_message(chat_id, message_id).await?;
        self.dispatch(SyncAction::RemoveMessage {
            chat_id: chat_id.to_owned(),
            message_id: message_id.to_owned(),
        })
        .await
    }

    pub async fn clear_history(&self, chat_id: &str) -> Result<(), ChatError> {
        self.history.clear_history(chat_id).await?;
        self.dispatch(SyncAction::ClearChat {
            chat_id: chat_id.to_owned(),
        })
        .await
    }

    /// Fetches the next older page and merges it beneath the existing
    /// entries. Returns whether more history remains; once it returns
    /// `false`, further calls are free no-ops.
    pub async fn load_older(&self, chat_id: &str) -> Result<bool, ChatError> {
        let (has_more, cursor) = {
            let store = self.store_read();
            (store.has_more(chat_id), store.next_cursor(chat_id))
        };
        if !has_more {
            return Ok(false);
        }

        let page = self
            .history
            .fetch_page(chat_id, cursor.as_deref(), self.config.page_size)
            .await?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.dispatch(SyncAction::MergeOlder {
            chat_id: chat_id.to_owned(),
            page,
            ack: ack_tx,
        })
        .await?;
        ack_rx
            .await
            .map_err(|_| ChatError::Transient("sync loop stopped".to_string()))
    }

    /// Keystroke hook; debounced internally (see [`PresenceTracker`]).
    pub fn set_typing(&self, chat_id: &str, is_typing: bool) {
        self.presence.set_typing(chat_id, is_typing);
    }

    pub fn is_peer_typing(&self, chat_id: &str) -> bool {
        self.presence.is_peer_typing(chat_id)
    }

    /// Current cached view of a conversation, or `None` before the first
    /// seed.
    pub fn conversation(&self, chat_id: &str) -> Option<ConversationSnapshot> {
        self.store_read().snapshot(chat_id)
    }

    pub fn chat(&self, chat_id: &str) -> Option<Chat> {
        self.chats.get(chat_id).map(|entry| entry.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.conn_status.is_connected()
    }

    /// Event channels for observers.
    pub fn events(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Closes the channel and stops the sync loop.
    pub async fn shutdown(&self) {
        let _ = self.conn_tx.send(ConnectionCommand::Disconnect).await;
        let _ = self.action_tx.send(SyncAction::Stop).await;
    }

    fn store_read(&self) -> RwLockReadGuard<'_, MessageStore> {
        self.store.read().expect("message store lock poisoned")
    }

    fn notify_conflict(&self, chat_id: &str, text: &str) {
        let _ = self.bus.notice.send(Arc::new(Notice {
            chat_id: Some(chat_id.to_owned()),
            text: text.to_owned(),
        }));
    }

    async fn dispatch(&self, action: SyncAction) -> Result<(), ChatError> {
        self.action_tx
            .send(action)
            .await
            .map_err(|_| ChatError::Transient("sync loop stopped".to_string()))
    }
}

/// The serialized event loop. Owns all mutable session state.
struct SyncWorker {
    config: SyncConfig,
    history: Arc<dyn HistoryGateway>,
    uploads: Arc<UploadCoordinator>,
    store: Arc<RwLock<MessageStore>>,
    chats: Arc<DashMap<ChatId, Chat>>,
    presence: PresenceTracker,
    bus: Arc<EventBus>,
    conn_tx: mpsc::Sender<ConnectionCommand>,
    conn_status: Arc<ConnectionStatus>,
    action_tx: mpsc::Sender<SyncAction>,
    pending: HashMap<LocalMessageId, PendingSend>,
}

impl SyncWorker {
    async fn run(
        mut self,
        mut actions: mpsc::Receiver<SyncAction>,
        mut conn_events: mpsc::Receiver<ConnectionEvent>,
    ) {
        info!(target: "Sync", "Sync loop started");
        loop {
            tokio::select! {
                maybe_action = actions.recv() => match maybe_action {
                    Some(SyncAction::Stop) | None => break,
                    Some(action) => self.handle_action(action).await,
                },
                maybe_event = conn_events.recv() => match maybe_event {
                    Some(event) => self.handle_connection_event(event),
                    None => break,
                },
            }
        }
        info!(target: "Sync", "Sync loop stopped");
    }

    async fn handle_action(&mut self, action: SyncAction) {
        match action {
            SyncAction::OpenChat { chat, page, ack } => {
                let chat_id = chat.id.clone();
                self.chats.insert(chat_id.clone(), *chat);
                self.store_write().seed(&chat_id, page);
                if self
                    .conn_tx
                    .send(ConnectionCommand::Subscribe(chat_id.clone()))
                    .await
                    .is_err()
                {
                    warn!(target: "Sync", "Connection actor gone; no push events for {chat_id}");
                }
                self.publish_update(&chat_id);
                let _ = ack.send(());
            }
            SyncAction::CloseChat { chat_id } => {
                let _ = self
                    .conn_tx
                    .send(ConnectionCommand::Unsubscribe(chat_id.clone()))
                    .await;
                self.presence.reset(&chat_id);
                // Abort uploads that have not finished; their drivers
                // report back as cancelled and the entries are dropped.
                for pending in self.pending.values_mut() {
                    if pending.chat_id == chat_id
                        && pending.media_ref.is_none()
                        && let Some(abort) = pending.upload_abort.take()
                    {
                        abort.abort();
                    }
                }
            }
            SyncAction::StartSend {
                message,
                receiver_id,
                draft,
                ack,
            } => {
                let chat_id = message.chat_id.clone();
                let local_id = match &message.id {
                    MessageId::Local(id) => id.clone(),
                    MessageId::Server(id) => {
                        debug!(target: "Sync", "StartSend with server id {id}; ignoring");
                        let _ = ack.send(());
                        return;
                    }
                };
                self.store_write().upsert(*message);
                self.pending.insert(
                    local_id.clone(),
                    PendingSend {
                        chat_id: chat_id.clone(),
                        receiver_id,
                        draft,
                        media_ref: None,
                        upload_abort: None,
                        parked: false,
                    },
                );
                self.publish_update(&chat_id);
                self.spawn_driver(&local_id);
                let _ = ack.send(());
            }
            SyncAction::RegisterUpload { local_id, abort } => {
                if let Some(pending) = self.pending.get_mut(&local_id) {
                    pending.upload_abort = Some(abort);
                }
            }
            SyncAction::UploadDone {
                chat_id,
                local_id,
                media,
            } => {
                if let Some(pending) = self.pending.get_mut(&local_id) {
                    pending.media_ref = Some(media.clone());
                    pending.upload_abort = None;
                }
                let id = MessageId::Local(local_id);
                let result = self.store_write().modify(&chat_id, &id, |message| {
                    if let MessageContent::Image { media: slot, .. }
                    | MessageContent::File { media: slot, .. } = &mut message.content
                    {
                        *slot = media;
                    }
                    message.status =
                        crate::delivery::advance(message.status, DeliveryStatus::Sending);
                });
                if result.is_ok() {
                    self.publish_update(&chat_id);
                }
            }
            SyncAction::SendCancelled { chat_id, local_id } => {
                self.pending.remove(&local_id);
                if self
                    .store_write()
                    .remove(&chat_id, &MessageId::Local(local_id))
                {
                    self.publish_update(&chat_id);
                }
            }
            SyncAction::SendFinished {
                chat_id,
                local_id,
                result,
            } => self.finish_send(&chat_id, &local_id, result),
            SyncAction::ParkSend { local_id } => {
                if let Some(pending) = self.pending.get_mut(&local_id) {
                    debug!(target: "Sync", "Send {local_id} parked until the channel recovers");
                    pending.parked = true;
                }
            }
            SyncAction::RetrySend {
                chat_id,
                local_id,
                ack,
            } => {
                let result = self.retry_send(&chat_id, &local_id);
                let _ = ack.send(result);
            }
            SyncAction::MarkReadLocal {
                chat_id,
                message_ids,
            } => {
                let mut changed = false;
                {
                    let mut store = self.store_write();
                    for message_id in &message_ids {
                        let id = MessageId::Server(message_id.clone());
                        match store.apply_status(&chat_id, &id, DeliveryStatus::Read) {
                            Ok(did) => changed |= did,
                            Err(e) => {
                                debug!(target: "Sync", "mark_read skipped {message_id}: {e}")
                            }
                        }
                    }
                }
                if changed {
                    self.publish_update(&chat_id);
                }
            }
            SyncAction::ApplyReaction {
                chat_id,
                message_id,
                user_id,
                emoji,
                ack,
            } => {
                let applied = self.store_write().apply_reaction(
                    &chat_id,
                    &message_id,
                    &user_id,
                    emoji,
                    chrono::Utc::now(),
                );
                let result = match applied {
                    Ok(changed) => {
                        if changed {
                            self.publish_update(&chat_id);
                        }
                        Ok(())
                    }
                    Err(e) => Err(ChatError::Conflict(e.to_string())),
                };
                if let Some(ack) = ack {
                    let _ = ack.send(result);
                }
            }
            SyncAction::RemoveMessage {
                chat_id,
                message_id,
            } => {
                if self
                    .store_write()
                    .remove(&chat_id, &MessageId::Server(message_id))
                {
                    self.publish_update(&chat_id);
                }
            }
            SyncAction::ClearChat { chat_id } => {
                self.store_write().clear(&chat_id);
                self.publish_update(&chat_id);
            }
            SyncAction::MergeOlder { chat_id, page, ack } => {
                let has_more = {
                    let mut store = self.store_write();
                    store.merge_older(&chat_id, page);
                    store.has_more(&chat_id)
                };
                self.publish_update(&chat_id);
                let _ = ack.send(has_more);
            }
            SyncAction::Stop => unreachable!("handled by run"),
        }
    }

    fn handle_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                let _ = self.bus.connected.send(Arc::new(Connected));
                // Sends that waited out the outage go again, from attempt
                // one.
                let parked: Vec<LocalMessageId> = self
                    .pending
                    .iter()
                    .filter(|(_, p)| p.parked)
                    .map(|(id, _)| id.clone())
                    .collect();
                for local_id in parked {
                    info!(target: "Sync", "Channel recovered; resuming send {local_id}");
                    self.spawn_driver(&local_id);
                }
            }
            ConnectionEvent::Disconnected { expected } => {
                let _ = self
                    .bus
                    .disconnected
                    .send(Arc::new(Disconnected { expected }));
            }
            ConnectionEvent::AuthFailed { reason } => {
                let _ = self.bus.notice.send(Arc::new(Notice {
                    chat_id: None,
                    text: format!("session rejected: {reason}"),
                }));
            }
            ConnectionEvent::Push(push) => self.handle_push(push),
        }
    }

    fn handle_push(&mut self, push: PushEvent) {
        match push {
            PushEvent::Message(message) => {
                let chat_id = message.chat_id.clone();
                if let Some(token) = message.local_id.as_deref()
                    && self.pending.remove(token).is_some()
                {
                    debug!(target: "Sync", "Send {token} confirmed via push");
                }
                self.store_write().upsert(*message);
                self.publish_update(&chat_id);
            }
            PushEvent::MessageStatus {
                chat_id,
                message_id,
                status,
            } => {
                let id = MessageId::Server(message_id.clone());
                match self.store_write().apply_status(&chat_id, &id, status) {
                    Ok(true) => self.publish_update(&chat_id),
                    Ok(false) => {
                        debug!(target: "Sync", "Stale status {status} for {message_id} ignored")
                    }
                    Err(e) => debug!(target: "Sync", "Status for unknown message: {e}"),
                }
            }
            PushEvent::Typing {
                chat_id,
                user_id,
                started,
            } => {
                if user_id != self.config.user_id {
                    self.presence.handle_remote(&chat_id, &user_id, started);
                }
            }
            PushEvent::Reaction {
                chat_id,
                message_id,
                user_id,
                emoji,
            } => {
                let applied = self.store_write().apply_reaction(
                    &chat_id,
                    &message_id,
                    &user_id,
                    emoji,
                    chrono::Utc::now(),
                );
                match applied {
                    Ok(true) => self.publish_update(&chat_id),
                    Ok(false) => {}
                    Err(e) => debug!(target: "Sync", "Reaction for unknown message: {e}"),
                }
            }
        }
    }

    fn finish_send(
        &mut self,
        chat_id: &str,
        local_id: &str,
        result: Result<Box<Message>, ChatError>,
    ) {
        match result {
            Ok(mut confirmed) => {
                self.pending.remove(local_id);
                if confirmed.local_id.is_none() {
                    // Defensive: older backends may omit the echo.
                    confirmed.local_id = Some(local_id.to_owned());
                }
                self.store_write().upsert(*confirmed);
                self.publish_update(chat_id);
            }
            Err(error) => {
                if !self.pending.contains_key(local_id) {
                    debug!(target: "Sync", "Late send result for {local_id}; already reconciled");
                    return;
                }
                let id = MessageId::Local(local_id.to_owned());
                match self
                    .store_write()
                    .apply_status(chat_id, &id, DeliveryStatus::Failed)
                {
                    Ok(_) => {
                        warn!(target: "Sync", "Send {local_id} failed: {error}");
                        let _ = self.bus.send_failed.send(Arc::new(SendFailed {
                            chat_id: chat_id.to_owned(),
                            message_id: id,
                            error: error.to_string(),
                        }));
                        self.publish_update(chat_id);
                    }
                    Err(e) => debug!(target: "Sync", "Failed send for unknown entry: {e}"),
                }
            }
        }
    }

    fn retry_send(&mut self, chat_id: &str, local_id: &str) -> Result<(), ChatError> {
        if !self.pending.contains_key(local_id) {
            return Err(ChatError::Conflict(
                "nothing to retry for that message".to_string(),
            ));
        }
        let id = MessageId::Local(local_id.to_owned());
        self.store_write()
            .apply_status(chat_id, &id, DeliveryStatus::Sending)
            .map_err(|e| ChatError::Conflict(e.to_string()))?;
        self.publish_update(chat_id);
        self.spawn_driver(local_id);
        Ok(())
    }

    fn spawn_driver(&mut self, local_id: &str) {
        let Some(pending) = self.pending.get_mut(local_id) else {
            return;
        };
        pending.parked = false;
        let ctx = DriverCtx {
            history: self.history.clone(),
            uploads: self.uploads.clone(),
            actions: self.action_tx.clone(),
            status: self.conn_status.clone(),
            retry: self.config.retry.clone(),
        };
        let chat_id = pending.chat_id.clone();
        let receiver_id = pending.receiver_id.clone();
        let draft = pending.draft.clone();
        let media_ref = pending.media_ref.clone();
        let sender_id = self.config.user_id.clone();
        let local_id = local_id.to_owned();
        tokio::spawn(drive_send(
            ctx,
            chat_id,
            local_id,
            sender_id,
            receiver_id,
            draft,
            media_ref,
        ));
    }

    fn store_write(&self) -> RwLockWriteGuard<'_, MessageStore> {
        self.store.write().expect("message store lock poisoned")
    }

    fn publish_update(&self, chat_id: &str) {
        let _ = self.bus.chat_updated.send(Arc::new(ChatUpdated {
            chat_id: chat_id.to_owned(),
        }));
    }
}

/// Builds the wire/store content for a draft. Before the upload finished
/// the media reference is a local placeholder (empty url, local file
/// metadata) so the optimistic entry can be rendered.
fn build_content(draft: &DraftContent, media: Option<&MediaRef>) -> MessageContent {
    match draft {
        DraftContent::Text(text) => MessageContent::Text {
            content: text.clone(),
        },
        DraftContent::Emoji(emoji) => MessageContent::Emoji {
            content: emoji.clone(),
        },
        DraftContent::Media { file, caption } => {
            let media = media.cloned().unwrap_or_else(|| MediaRef {
                url: String::new(),
                file_name: file.file_name.clone(),
                file_size: file.data.len() as u64,
                mime_type: file.mime_type.clone(),
            });
            if file.mime_type.starts_with("image/") {
                MessageContent::Image {
                    content: caption.clone(),
                    media,
                }
            } else {
                MessageContent::File {
                    content: caption.clone(),
                    media,
                }
            }
        }
    }
}

/// Drives one outbound send to completion: optional upload, then the
/// submit with bounded timeout and retry. Reports every state change back
/// into the sync loop; never touches the store directly.
async fn drive_send(
    ctx: DriverCtx,
    chat_id: ChatId,
    local_id: LocalMessageId,
    sender_id: UserId,
    receiver_id: UserId,
    draft: Draft,
    mut media_ref: Option<MediaRef>,
) {
    if let DraftContent::Media { file, .. } = &draft.content
        && media_ref.is_none()
    {
        let task = match ctx.uploads.start(local_id.clone(), file.clone()) {
            Ok(task) => task,
            Err(e) => {
                let _ = ctx
                    .actions
                    .send(SyncAction::SendFinished {
                        chat_id,
                        local_id,
                        result: Err(e.into()),
                    })
                    .await;
                return;
            }
        };
        let _ = ctx
            .actions
            .send(SyncAction::RegisterUpload {
                local_id: local_id.clone(),
                abort: task.abort_handle(),
            })
            .await;

        match task.wait().await {
            Ok(media) => {
                media_ref = Some(media.clone());
                let _ = ctx
                    .actions
                    .send(SyncAction::UploadDone {
                        chat_id: chat_id.clone(),
                        local_id: local_id.clone(),
                        media,
                    })
                    .await;
            }
            Err(UploadError::Cancelled) => {
                let _ = ctx
                    .actions
                    .send(SyncAction::SendCancelled { chat_id, local_id })
                    .await;
                return;
            }
            Err(e) => {
                let _ = ctx
                    .actions
                    .send(SyncAction::SendFinished {
                        chat_id,
                        local_id,
                        result: Err(e.into()),
                    })
                    .await;
                return;
            }
        }
    }

    let request = NewMessageRequest {
        chat_id: chat_id.clone(),
        local_id: local_id.clone(),
        sender_id,
        receiver_id,
        content: build_content(&draft.content, media_ref.as_ref()),
        reply_to: draft.reply_to.clone(),
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let failure = match timeout(ctx.retry.attempt_timeout, ctx.history.submit(request.clone()))
            .await
        {
            Ok(Ok(confirmed)) => {
                let _ = ctx
                    .actions
                    .send(SyncAction::SendFinished {
                        chat_id,
                        local_id,
                        result: Ok(Box::new(confirmed)),
                    })
                    .await;
                return;
            }
            Ok(Err(e)) => {
                if !e.is_retryable() {
                    let _ = ctx
                        .actions
                        .send(SyncAction::SendFinished {
                            chat_id,
                            local_id,
                            result: Err(e.into()),
                        })
                        .await;
                    return;
                }
                e.to_string()
            }
            Err(_) => "request timed out".to_string(),
        };

        if !ctx.status.is_connected() {
            // The whole channel is down; park instead of burning the
            // retry budget. The sync loop resumes us after reconnect.
            let _ = ctx.actions.send(SyncAction::ParkSend { local_id }).await;
            return;
        }

        if attempt >= ctx.retry.max_attempts {
            let _ = ctx
                .actions
                .send(SyncAction::SendFinished {
                    chat_id,
                    local_id,
                    result: Err(ChatError::Transient(failure)),
                })
                .await;
            return;
        }

        let backoff = ctx.retry.backoff(attempt);
        warn!(
            target: "Sync",
            "Send attempt {attempt} failed ({failure}); retrying in {backoff:?}"
        );
        tokio::time::sleep(backoff).await;
    }
}
