//! Typing presence, both directions.
//!
//! Outbound: keystroke-driven `set_typing(true)` calls are debounced so the
//! channel sees at most one `typing:start` per quiet window, and an
//! automatic stop fires after the inactivity timeout.
//!
//! Inbound: a peer's typing flag auto-expires after the same timeout even
//! if the explicit stop signal was lost.

use crate::connection::ConnectionCommand;
use crate::types::chat::{ChatId, UserId};
use crate::types::events::{EventBus, TypingUpdate};
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};

/// Quiet period after which a typing indicator goes stale, in both
/// directions. Bounds the damage of a lost stop signal.
pub const TYPING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct LocalTyping {
    started: bool,
    stop_task: Option<JoinHandle<()>>,
}

struct RemoteTyping {
    user_id: UserId,
    until: Instant,
    expiry_task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct PresenceTracker {
    inner: Arc<PresenceInner>,
}

struct PresenceInner {
    commands: mpsc::Sender<ConnectionCommand>,
    bus: Arc<EventBus>,
    local: DashMap<ChatId, LocalTyping>,
    remote: DashMap<ChatId, RemoteTyping>,
}

impl PresenceTracker {
    pub fn new(commands: mpsc::Sender<ConnectionCommand>, bus: Arc<EventBus>) -> Self {
        Self {
            inner: Arc::new(PresenceInner {
                commands,
                bus,
                local: DashMap::new(),
                remote: DashMap::new(),
            }),
        }
    }

    /// Called on every keystroke while composing. Emission is
    /// fire-and-forget: a lost typing signal is an acceptable degradation.
    pub fn set_typing(&self, chat_id: &str, is_typing: bool) {
        if is_typing {
            let mut entry = self.inner.local.entry(chat_id.to_owned()).or_default();
            if !entry.started {
                entry.started = true;
                self.inner.send_signal(chat_id, true);
            }
            if let Some(task) = entry.stop_task.take() {
                task.abort();
            }
            let inner = self.inner.clone();
            let chat = chat_id.to_owned();
            entry.stop_task = Some(tokio::spawn(async move {
                sleep(TYPING_TIMEOUT).await;
                inner.finish_local(&chat);
            }));
        } else if let Some((_, mut entry)) = self.inner.local.remove(chat_id) {
            if let Some(task) = entry.stop_task.take() {
                task.abort();
            }
            if entry.started {
                self.inner.send_signal(chat_id, false);
            }
        }
    }

    /// Current remote indicator for a chat: is the other participant
    /// typing right now. Reads past the expiry deadline see `false` even
    /// before the expiry task has run.
    pub fn is_peer_typing(&self, chat_id: &str) -> bool {
        self.inner
            .remote
            .get(chat_id)
            .map(|entry| Instant::now() < entry.until)
            .unwrap_or(false)
    }

    /// Routes an inbound typing push event. Refreshing an active indicator
    /// pushes its expiry deadline out; the auto-expiry broadcasts the flip
    /// to `false` so observers need not poll.
    pub(crate) fn handle_remote(&self, chat_id: &str, user_id: &str, started: bool) {
        if started {
            if let Some((_, old)) = self.inner.remote.remove(chat_id) {
                old.expiry_task.abort();
            }
            let inner = self.inner.clone();
            let chat = chat_id.to_owned();
            let expiry_task = tokio::spawn(async move {
                sleep(TYPING_TIMEOUT).await;
                inner.expire_remote(&chat);
            });
            self.inner.remote.insert(
                chat_id.to_owned(),
                RemoteTyping {
                    user_id: user_id.to_owned(),
                    until: Instant::now() + TYPING_TIMEOUT,
                    expiry_task,
                },
            );
            self.inner.publish(chat_id, user_id, true);
        } else if let Some((_, entry)) = self.inner.remote.remove(chat_id) {
            entry.expiry_task.abort();
            self.inner.publish(chat_id, &entry.user_id, false);
        }
    }

    /// Drops all typing state for a chat (view closed). Emits a stop for a
    /// still-active local indicator so the peer is not left hanging.
    pub(crate) fn reset(&self, chat_id: &str) {
        self.set_typing(chat_id, false);
        if let Some((_, entry)) = self.inner.remote.remove(chat_id) {
            entry.expiry_task.abort();
        }
    }
}

impl PresenceInner {
    fn send_signal(&self, chat_id: &str, started: bool) {
        let command = ConnectionCommand::SendTyping {
            chat_id: chat_id.to_owned(),
            started,
        };
        if self.commands.try_send(command).is_err() {
            debug!(target: "Presence", "Dropping typing signal for {chat_id}: channel busy or closed");
        }
    }

    fn finish_local(&self, chat_id: &str) {
        if let Some(mut entry) = self.local.get_mut(chat_id)
            && entry.started
        {
            entry.started = false;
            entry.stop_task = None;
            self.send_signal(chat_id, false);
        }
    }

    fn expire_remote(&self, chat_id: &str) {
        let expired = self
            .remote
            .get(chat_id)
            .map(|entry| Instant::now() >= entry.until)
            .unwrap_or(false);
        if expired && let Some((_, entry)) = self.remote.remove(chat_id) {
            self.publish(chat_id, &entry.user_id, false);
        }
    }

    fn publish(&self, chat_id: &str, user_id: &str, is_typing: bool) {
        let _ = self.bus.typing.send(Arc::new(TypingUpdate {
            chat_id: chat_id.to_owned(),
            user_id: user_id.to_owned(),
            is_typing,
        }));
    }
}
