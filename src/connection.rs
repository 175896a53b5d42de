//! The connection manager: a command/event actor owning the one logical
//! persistent channel per session. It connects and authenticates,
//! re-establishes chat subscriptions before reporting itself connected,
//! reconnects with bounded backoff on unexpected loss, heartbeats the
//! server, and forwards inbound push events to its single consumer.
//!
//! No other component opens or closes the channel.

use crate::delivery::DeliveryStatus;
use crate::keepalive::{KeepaliveAction, KeepaliveState};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::types::chat::{ChatId, Credential, UserId};
use crate::types::message::{Message, ServerMessageId};
use crate::wire::{self, ClientFrame, ServerFrame};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, sleep_until, timeout};

const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_MAX_DELAY_SECS: u64 = 30;
const CHANNEL_BUFFER: usize = 64;

/// Instructions accepted by the actor.
#[derive(Debug)]
pub enum ConnectionCommand {
    Connect,
    Disconnect,
    Subscribe(ChatId),
    Unsubscribe(ChatId),
    /// Fire-and-forget; a lost typing signal is never an error.
    SendTyping { chat_id: ChatId, started: bool },
}

/// Server-originated events routed to the sync coordinator.
#[derive(Debug, Clone)]
pub enum PushEvent {
    Message(Box<Message>),
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
    Reaction {
        chat_id: ChatId,
        message_id: ServerMessageId,
        user_id: UserId,
        emoji: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The channel is up, authenticated, and every registered chat
    /// subscription has been re-established.
    Connected,
    Disconnected { expected: bool },
    /// The server rejected the credential. Terminal: no reconnect is
    /// scheduled until a fresh `Connect` command arrives.
    AuthFailed { reason: String },
    Push(PushEvent),
}

/// Connection flags shared with observers. Written only by the actor.
#[derive(Debug, Default)]
pub struct ConnectionStatus {
    connected: AtomicBool,
    connecting: AtomicBool,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Error)]
enum ConnectError {
    #[error("credential rejected: {0}")]
    AuthRejected(String),
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

pub struct ConnectionManager {
    command_rx: mpsc::Receiver<ConnectionCommand>,
    event_tx: mpsc::Sender<ConnectionEvent>,
    factory: Arc<dyn TransportFactory>,
    credential: Credential,

    transport: Option<Arc<dyn Transport>>,
    transport_events: Option<mpsc::Receiver<TransportEvent>>,
    keepalive: Option<KeepaliveState>,

    /// Chat subscriptions survive reconnects; they are replayed on every
    /// successful connect before `Connected` is emitted.
    subscriptions: HashSet<ChatId>,
    status: Arc<ConnectionStatus>,

    /// Whether the owner wants the channel up. `Disconnect` clears it,
    /// cancelling any pending reconnect.
    want_connected: bool,
    reconnect_errors: u32,
}

impl ConnectionManager {
    pub fn new(
        command_rx: mpsc::Receiver<ConnectionCommand>,
        event_tx: mpsc::Sender<ConnectionEvent>,
        factory: Arc<dyn TransportFactory>,
        credential: Credential,
        status: Arc<ConnectionStatus>,
    ) -> Self {
        Self {
            command_rx,
            event_tx,
            factory,
            credential,
            transport: None,
            transport_events: None,
            keepalive: None,
            subscriptions: HashSet::new(),
            status,
            want_connected: false,
            reconnect_errors: 0,
        }
    }

    pub async fn run(mut self) {
        info!(target: "Connection", "Connection manager started");
        loop {
            if self.transport.is_some() {
                self.online_loop().await;
            } else if self.want_connected {
                if !self.backoff_wait().await {
                    // Shut down or disconnect requested while waiting.
                    if self.command_rx.is_closed() {
                        break;
                    }
                    continue;
                }
                // Counts this attempt; a fully successful connect resets it.
                self.reconnect_errors += 1;
                match self.try_connect().await {
                    Ok(()) => {
                        self.reconnect_errors = 0;
                        self.status.connected.store(true, Ordering::Relaxed);
                        self.emit(ConnectionEvent::Connected).await;
                    }
                    Err(ConnectError::AuthRejected(reason)) => {
                        warn!(target: "Connection", "Authentication rejected: {reason}");
                        self.want_connected = false;
                        self.emit(ConnectionEvent::AuthFailed { reason }).await;
                    }
                    Err(ConnectError::Transport(e)) => {
                        error!(target: "Connection", "Connection attempt failed: {e:?}");
                    }
                }
            } else {
                match self.command_rx.recv().await {
                    Some(command) => self.handle_offline_command(command),
                    None => break,
                }
            }
        }
        info!(target: "Connection", "Connection manager stopped");
    }

    /// Sleeps out the reconnect backoff, still reacting to commands.
    /// Returns whether a connection attempt should proceed.
    async fn backoff_wait(&mut self) -> bool {
        let delay_secs = u64::from(self.reconnect_errors * 2).min(RECONNECT_MAX_DELAY_SECS);
        if delay_secs == 0 {
            return true;
        }
        let delay = Duration::from_secs(delay_secs);
        info!(
            target: "Connection",
            "Will attempt to reconnect in {:?} (attempt {})",
            delay,
            self.reconnect_errors + 1
        );
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = sleep_until(deadline) => return true,
                maybe = self.command_rx.recv() => match maybe {
                    Some(command) => {
                        self.handle_offline_command(command);
                        if !self.want_connected {
                            debug!(target: "Connection", "Pending reconnect cancelled");
                            return false;
                        }
                    }
                    None => return false,
                },
            }
        }
    }

    fn handle_offline_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect => {
                self.want_connected = true;
                self.reconnect_errors = 0;
            }
            ConnectionCommand::Disconnect => {
                // Idempotent; also cancels a scheduled reconnect.
                self.want_connected = false;
            }
            ConnectionCommand::Subscribe(chat_id) => {
                self.subscriptions.insert(chat_id);
            }
            ConnectionCommand::Unsubscribe(chat_id) => {
                self.subscriptions.remove(&chat_id);
            }
            ConnectionCommand::SendTyping { chat_id, .. } => {
                debug!(target: "Connection", "Dropping typing signal for {chat_id}: not connected");
            }
        }
    }

    async fn try_connect(&mut self) -> Result<(), ConnectError> {
        self.status.connecting.store(true, Ordering::Relaxed);
        let status = self.status.clone();
        let _guard = scopeguard::guard((), move |_| {
            status.connecting.store(false, Ordering::Relaxed);
        });

        info!(target: "Connection", "Connecting transport");
        let (transport, mut events) = self.factory.create_transport().await?;

        let auth_frame = wire::encode(&ClientFrame::Auth {
            credential: self.credential.0.clone(),
        })
        .map_err(|e| ConnectError::Transport(e.into()))?;
        transport.send_frame(&auth_frame).await?;

        match timeout(AUTH_TIMEOUT, wait_for_auth(&mut events)).await {
            Ok(Ok(session_id)) => {
                debug!(target: "Connection", "Authenticated, session {session_id}")
            }
            Ok(Err(outcome)) => {
                transport.disconnect().await;
                return Err(outcome);
            }
            Err(_) => {
                transport.disconnect().await;
                return Err(ConnectError::Transport(anyhow::anyhow!(
                    "timed out waiting for auth response"
                )));
            }
        }

        // Re-establish every active subscription before the session counts
        // as recovered.
        for chat_id in &self.subscriptions {
            let frame = wire::encode(&ClientFrame::Subscribe {
                chat_id: chat_id.clone(),
            })
            .map_err(|e| ConnectError::Transport(e.into()))?;
            transport.send_frame(&frame).await?;
        }

        self.transport = Some(transport);
        self.transport_events = Some(events);
        self.keepalive = Some(KeepaliveState::new());
        info!(target: "Connection", "Connection established ({} subscriptions restored)", self.subscriptions.len());
        Ok(())
    }

    async fn online_loop(&mut self) {
        let Some(mut events) = self.transport_events.take() else {
            error!(target: "Connection", "Online with no transport event stream; dropping connection");
            self.drop_connection(false).await;
            return;
        };

        loop {
            let keepalive_deadline = self.keepalive.as_ref().map(|k| k.deadline());
            tokio::select! {
                maybe_command = self.command_rx.recv() => match maybe_command {
                    Some(ConnectionCommand::Disconnect) => {
                        self.want_connected = false;
                        self.drop_connection(true).await;
                        return;
                    }
                    Some(command) => self.handle_online_command(command).await,
                    None => {
                        // Owner gone; close down quietly.
                        self.want_connected = false;
                        self.drop_connection(true).await;
                        return;
                    }
                },
                maybe_event = events.recv() => match maybe_event {
                    Some(TransportEvent::FrameReceived(raw)) => {
                        if self.handle_frame(&raw).await {
                            return;
                        }
                    }
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::Disconnected) | None => {
                        warn!(target: "Connection", "Connection lost");
                        self.drop_connection(false).await;
                        return;
                    }
                },
                _ = async {
                    match keepalive_deadline {
                        Some(deadline) => sleep_until(deadline).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let action = match self.keepalive.as_mut() {
                        Some(keepalive) => keepalive.on_deadline(),
                        None => KeepaliveAction::Idle,
                    };
                    match action {
                        KeepaliveAction::SendPing => {
                            debug!(target: "Connection/Keepalive", "Sending keepalive ping");
                            self.send_frame_logged(&ClientFrame::Ping).await;
                        }
                        KeepaliveAction::ForceReconnect => {
                            self.drop_connection(false).await;
                            return;
                        }
                        KeepaliveAction::Idle => {}
                    }
                }
            }
        }
    }

    async fn handle_online_command(&mut self, command: ConnectionCommand) {
        match command {
            ConnectionCommand::Connect => {
                warn!(target: "Connection", "Connect command received but already connected.");
            }
            ConnectionCommand::Disconnect => unreachable!("handled by online_loop"),
            ConnectionCommand::Subscribe(chat_id) => {
                if self.subscriptions.insert(chat_id.clone()) {
                    self.send_frame_logged(&ClientFrame::Subscribe { chat_id }).await;
                }
            }
            ConnectionCommand::Unsubscribe(chat_id) => {
                if self.subscriptions.remove(&chat_id) {
                    self.send_frame_logged(&ClientFrame::Unsubscribe { chat_id }).await;
                }
            }
            ConnectionCommand::SendTyping { chat_id, started } => {
                let frame = if started {
                    ClientFrame::TypingStart { chat_id }
                } else {
                    ClientFrame::TypingStop { chat_id }
                };
                // Best effort only; no retry, no error surfaced.
                self.send_frame_logged(&frame).await;
            }
        }
    }

    /// Handles one inbound frame. Returns true when the connection was
    /// torn down as a result.
    async fn handle_frame(&mut self, raw: &str) -> bool {
        let frame = match wire::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "Connection", "Skipping undecodable frame: {e}");
                return false;
            }
        };

        match frame {
            ServerFrame::Pong => {
                if let Some(keepalive) = self.keepalive.as_mut() {
                    keepalive.on_pong();
                }
            }
            ServerFrame::AuthOk { .. } => {
                debug!(target: "Connection", "Ignoring duplicate auth acknowledgement");
            }
            ServerFrame::AuthErr { reason } => {
                // Mid-session credential invalidation is terminal.
                warn!(target: "Connection", "Server invalidated session: {reason}");
                self.want_connected = false;
                self.emit(ConnectionEvent::AuthFailed { reason }).await;
                self.drop_connection(false).await;
                return true;
            }
            ServerFrame::Message { message } => {
                self.emit(ConnectionEvent::Push(PushEvent::Message(message))).await;
            }
            ServerFrame::MessageStatus {
                chat_id,
                message_id,
                status,
            } => {
                self.emit(ConnectionEvent::Push(PushEvent::MessageStatus {
                    chat_id,
                    message_id,
                    status,
                }))
                .await;
            }
            ServerFrame::Typing {
                chat_id,
                user_id,
                started,
            } => {
                self.emit(ConnectionEvent::Push(PushEvent::Typing {
                    chat_id,
                    user_id,
                    started,
                }))
                .await;
            }
            ServerFrame::Reaction {
                chat_id,
                message_id,
                user_id,
                emoji,
            } => {
                self.emit(ConnectionEvent::Push(PushEvent::Reaction {
                    chat_id,
                    message_id,
                    user_id,
                    emoji,
                }))
                .await;
            }
        }
        false
    }

    async fn send_frame_logged(&self, frame: &ClientFrame) {
        let Some(transport) = self.transport.as_ref() else {
            debug!(target: "Connection", "No transport; dropping outbound frame");
            return;
        };
        match wire::encode(frame) {
            Ok(raw) => {
                if let Err(e) = transport.send_frame(&raw).await {
                    debug!(target: "Connection", "Failed to send frame: {e:?}");
                }
            }
            Err(e) => error!(target: "Connection", "Failed to encode frame: {e}"),
        }
    }

    async fn drop_connection(&mut self, expected: bool) {
        if let Some(transport) = self.transport.take() {
            transport.disconnect().await;
        }
        self.transport_events = None;
        self.keepalive = None;
        self.status.connected.store(false, Ordering::Relaxed);
        self.emit(ConnectionEvent::Disconnected { expected }).await;
    }

    async fn emit(&self, event: ConnectionEvent) {
        if self.event_tx.send(event).await.is_err() {
            error!(target: "Connection", "Event receiver dropped");
        }
    }
}

/// Reads transport events until the server answers the auth frame.
async fn wait_for_auth(
    events: &mut mpsc::Receiver<TransportEvent>,
) -> Result<String, ConnectError> {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Connected => {}
            TransportEvent::Disconnected => {
                return Err(ConnectError::Transport(anyhow::anyhow!(
                    "transport dropped during authentication"
                )));
            }
            TransportEvent::FrameReceived(raw) => match wire::decode(&raw) {
                Ok(ServerFrame::AuthOk { session_id }) => return Ok(session_id),
                Ok(ServerFrame::AuthErr { reason }) => {
                    return Err(ConnectError::AuthRejected(reason));
                }
                Ok(other) => {
                    debug!(target: "Connection", "Dropping pre-auth frame: {other:?}");
                }
                Err(e) => warn!(target: "Connection", "Skipping undecodable frame: {e}"),
            },
        }
    }
    Err(ConnectError::Transport(anyhow::anyhow!(
        "transport closed during authentication"
    )))
}

/// Spawns the connection manager in its own task.
pub fn spawn_connection_manager(
    factory: Arc<dyn TransportFactory>,
    credential: Credential,
) -> (
    mpsc::Sender<ConnectionCommand>,
    mpsc::Receiver<ConnectionEvent>,
    Arc<ConnectionStatus>,
) {
    let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER);
    let (event_tx, event_rx) = mpsc::channel(CHANNEL_BUFFER);
    let status = Arc::new(ConnectionStatus::default());

    let manager = ConnectionManager::new(
        command_rx,
        event_tx,
        factory,
        credential,
        status.clone(),
    );
    tokio::spawn(manager.run());

    (command_tx, event_rx, status)
}
