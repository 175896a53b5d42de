// Integration test: drives a full conversation session through the public
// SyncCoordinator API against a scripted fake server (transport + REST
// gateways), covering optimistic sends, dedup, pagination, typing,
// uploads and outage recovery.

use async_trait::async_trait;
use chatwire::history::{GatewayError, HistoryGateway, MessagePage, NewMessageRequest};
use chatwire::sync::{Draft, SyncConfig, SyncCoordinator};
use chatwire::transport::{Transport, TransportEvent, TransportFactory};
use chatwire::upload::{MediaFile, MediaGateway};
use chatwire::wire::ServerFrame;
use chatwire::{
    Chat, ChatError, ChatSettings, Credential, DeliveryStatus, MediaRef, Message, MessageContent,
    MessageId, SendRetryPolicy,
};
use chrono::{TimeZone, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::time::{Duration, sleep};

const CHAT: &str = "c-123";

// === Fake transport ===============================================

struct FakeConn {
    sent: Arc<Mutex<Vec<String>>>,
    events: mpsc::Sender<TransportEvent>,
}

impl FakeConn {
    async fn push(&self, frame: &ServerFrame) {
        let raw = serde_json::to_string(frame).expect("encode server frame");
        let _ = self.events.send(TransportEvent::FrameReceived(raw)).await;
    }

    async fn drop_connection(&self) {
        let _ = self.events.send(TransportEvent::Disconnected).await;
    }

    async fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

struct FakeWire {
    sent: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Transport for FakeWire {
    async fn send_frame(&self, frame: &str) -> Result<(), anyhow::Error> {
        self.sent.lock().await.push(frame.to_owned());
        Ok(())
    }

    async fn disconnect(&self) {}
}

/// Accepts every dial while `online`, answering auth automatically, and
/// records each accepted connection so tests can push frames.
struct FakeServer {
    conns: Arc<std::sync::Mutex<Vec<Arc<FakeConn>>>>,
    online: AtomicBool,
}

impl FakeServer {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            conns: Arc::new(std::sync::Mutex::new(Vec::new())),
            online: AtomicBool::new(true),
        })
    }

    fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    fn connection(&self, idx: usize) -> Arc<FakeConn> {
        self.conns.lock().unwrap()[idx].clone()
    }

    fn connection_count(&self) -> usize {
        self.conns.lock().unwrap().len()
    }

    async fn latest(&self) -> Arc<FakeConn> {
        for _ in 0..400 {
            if let Some(conn) = self.conns.lock().unwrap().last().cloned() {
                return conn;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("no connection was ever established");
    }
}

#[async_trait]
impl TransportFactory for FakeServer {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("network is down"));
        }
        let (event_tx, event_rx) = mpsc::channel(100);
        let sent = Arc::new(Mutex::new(Vec::new()));
        let conn = Arc::new(FakeConn {
            sent: sent.clone(),
            events: event_tx.clone(),
        });

        let _ = event_tx.send(TransportEvent::Connected).await;
        // The server accepts any credential in these tests.
        conn.push(&ServerFrame::AuthOk {
            session_id: "s-test".to_string(),
        })
        .await;

        self.conns.lock().unwrap().push(conn);
        Ok((Arc::new(FakeWire { sent }), event_rx))
    }
}

// === Fake REST backend ============================================

struct FakeHistory {
    chat: Chat,
    /// Pages keyed by the cursor they are fetched with (None = newest).
    pages: std::sync::Mutex<HashMap<Option<String>, MessagePage>>,
    /// Scripted submit outcomes, consumed front to back; an empty queue
    /// means "accept".
    submit_script: std::sync::Mutex<VecDeque<GatewayError>>,
    /// Gate for holding submissions open (0 permits = server hangs).
    submit_gate: Option<Arc<Semaphore>>,
    submit_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    next_id: AtomicUsize,
    marked_read: std::sync::Mutex<Vec<String>>,
}

impl FakeHistory {
    fn new(chat: Chat) -> Self {
        Self {
            chat,
            pages: std::sync::Mutex::new(HashMap::new()),
            submit_script: std::sync::Mutex::new(VecDeque::new()),
            submit_gate: None,
            submit_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
            marked_read: std::sync::Mutex::new(Vec::new()),
        }
    }

    fn with_page(self, cursor: Option<&str>, page: MessagePage) -> Self {
        self.pages
            .lock()
            .unwrap()
            .insert(cursor.map(str::to_owned), page);
        self
    }

    fn script_submit_failures(&self, failures: impl IntoIterator<Item = GatewayError>) {
        self.submit_script.lock().unwrap().extend(failures);
    }
}

#[async_trait]
impl HistoryGateway for FakeHistory {
    async fn chat(&self, _chat_id: &str) -> Result<Chat, GatewayError> {
        Ok(self.chat.clone())
    }

    async fn fetch_page(
        &self,
        _chat_id: &str,
        cursor: Option<&str>,
        _limit: usize,
    ) -> Result<MessagePage, GatewayError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.pages
            .lock()
            .unwrap()
            .get(&cursor.map(str::to_owned))
            .cloned()
            .ok_or_else(|| GatewayError::Permanent("no such page".to_string()))
    }

    async fn submit(&self, request: NewMessageRequest) -> Result<Message, GatewayError> {
        if let Some(gate) = &self.submit_gate {
            let permit = gate.acquire().await.expect("gate closed");
            permit.forget();
        }
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.submit_script.lock().unwrap().pop_front() {
            return Err(error);
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Message {
            id: MessageId::Server(format!("m-{n}")),
            chat_id: request.chat_id,
            sender_id: request.sender_id,
            receiver_id: request.receiver_id,
            content: request.content,
            reply_to: request.reply_to,
            local_id: Some(request.local_id),
            status: DeliveryStatus::Sent,
            created_at: Utc::now(),
            reactions: vec![],
        })
    }

    async fn delete_message(&self, _chat_id: &str, _message_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn mark_read(&self, _chat_id: &str, ids: &[String]) -> Result<(), GatewayError> {
        self.marked_read.lock().unwrap().extend(ids.iter().cloned());
        Ok(())
    }

    async fn set_reaction(
        &self,
        _chat_id: &str,
        message_id: &str,
        _emoji: Option<&str>,
    ) -> Result<(), GatewayError> {
        if message_id == "m-deleted" {
            return Err(GatewayError::Conflict("message was deleted".to_string()));
        }
        Ok(())
    }

    async fn clear_history(&self, _chat_id: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

struct FakeMediaStore {
    uploads: AtomicUsize,
}

#[async_trait]
impl MediaGateway for FakeMediaStore {
    async fn upload(
        &self,
        file: MediaFile,
        progress: mpsc::Sender<u8>,
    ) -> Result<MediaRef, GatewayError> {
        for step in [25u8, 75, 100] {
            let _ = progress.send(step).await;
        }
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MediaRef {
            url: format!("https://cdn.example/u/{n}"),
            file_name: file.file_name,
            file_size: file.data.len() as u64,
            mime_type: file.mime_type,
        })
    }
}

// === Helpers ======================================================

fn two_party_chat(blocked: bool) -> Chat {
    Chat {
        id: CHAT.to_string(),
        participants: ["alice".to_string(), "bob".to_string()],
        created_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        updated_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        settings: ChatSettings {
            muted: false,
            blocked,
        },
    }
}

fn incoming(id: &str, secs: i64, text: &str) -> Message {
    Message {
        id: MessageId::Server(id.to_string()),
        chat_id: CHAT.to_string(),
        sender_id: "bob".to_string(),
        receiver_id: "alice".to_string(),
        content: MessageContent::Text {
            content: text.to_string(),
        },
        reply_to: None,
        local_id: None,
        status: DeliveryStatus::Sent,
        created_at: Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap(),
        reactions: vec![],
    }
}

fn empty_page() -> MessagePage {
    MessagePage {
        messages: vec![],
        next_cursor: None,
    }
}

fn test_config() -> SyncConfig {
    let mut config = SyncConfig::new(Credential("token".to_string()), "alice");
    config.retry = SendRetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(20),
        attempt_timeout: Duration::from_millis(500),
    };
    config
}

fn start(
    history: FakeHistory,
    server: &Arc<FakeServer>,
) -> (Arc<SyncCoordinator>, Arc<FakeHistory>, Arc<FakeMediaStore>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let history = Arc::new(history);
    let media = Arc::new(FakeMediaStore {
        uploads: AtomicUsize::new(0),
    });
    let coordinator = SyncCoordinator::start(
        test_config(),
        history.clone(),
        media.clone(),
        server.clone(),
    );
    (coordinator, history, media)
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

// === Scenarios ====================================================

#[tokio::test]
async fn test_send_text_is_optimistic_then_reconciled() {
    let server = FakeServer::new();
    let mut history = FakeHistory::new(two_party_chat(false)).with_page(None, empty_page());
    // Hold submissions open so the optimistic state is observable.
    let gate = Arc::new(Semaphore::new(0));
    history.submit_gate = Some(gate.clone());
    let (coordinator, _history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");

    let local_id = coordinator
        .send_message(CHAT, Draft::text("hello"))
        .await
        .expect("send");

    // The entry is visible immediately, before the server answers.
    let snapshot = coordinator.conversation(CHAT).expect("snapshot");
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].status, DeliveryStatus::Sending);
    assert_eq!(snapshot.messages[0].content.text(), "hello");
    assert_eq!(snapshot.messages[0].id, MessageId::Local(local_id.clone()));

    // Server confirms; the temporary entry is replaced, not duplicated.
    gate.add_permits(1);
    eventually("reconciliation with m-1", || {
        let s = coordinator.conversation(CHAT).unwrap();
        s.messages.len() == 1
            && s.messages[0].id == MessageId::Server("m-1".to_string())
            && s.messages[0].status == DeliveryStatus::Sent
    })
    .await;
    assert_eq!(
        coordinator.conversation(CHAT).unwrap().messages[0]
            .content
            .text(),
        "hello"
    );
}

#[tokio::test]
async fn test_duplicate_push_stores_single_entry() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(None, empty_page());
    let (coordinator, _history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    let conn = server.latest().await;

    let message = incoming("m-9", 10, "knock knock");
    for _ in 0..3 {
        conn.push(&ServerFrame::Message {
            message: Box::new(message.clone()),
        })
        .await;
    }

    eventually("message arrival", || {
        coordinator
            .conversation(CHAT)
            .map(|s| !s.messages.is_empty())
            .unwrap_or(false)
    })
    .await;
    // Give the remaining duplicates time to be (not) applied.
    sleep(Duration::from_millis(100)).await;

    let snapshot = coordinator.conversation(CHAT).unwrap();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id, MessageId::Server("m-9".to_string()));
}

#[tokio::test]
async fn test_load_older_merges_pages_without_gaps_or_duplicates() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false))
        .with_page(
            None,
            MessagePage {
                messages: vec![incoming("m-3", 30, "three"), incoming("m-4", 40, "four")],
                next_cursor: Some("p2".to_string()),
            },
        )
        .with_page(
            Some("p2"),
            MessagePage {
                // The boundary message m-3 appears in both pages.
                messages: vec![
                    incoming("m-1", 10, "one"),
                    incoming("m-2", 20, "two"),
                    incoming("m-3", 30, "three"),
                ],
                next_cursor: None,
            },
        );
    let (coordinator, history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    assert!(coordinator.conversation(CHAT).unwrap().has_more);

    let more = coordinator.load_older(CHAT).await.expect("load older");
    assert!(!more);

    let snapshot = coordinator.conversation(CHAT).unwrap();
    let ids: Vec<&str> = snapshot.messages.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, ["m-1", "m-2", "m-3", "m-4"]);
    assert!(!snapshot.has_more);

    // Once exhausted, further pagination is a free local no-op.
    let fetches_before = history.fetch_calls.load(Ordering::SeqCst);
    assert!(!coordinator.load_older(CHAT).await.expect("noop"));
    assert_eq!(history.fetch_calls.load(Ordering::SeqCst), fetches_before);
}

#[tokio::test]
async fn test_upload_failure_then_retry_reuses_media_ref() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(None, empty_page());
    // Every submit attempt times out; the upload itself succeeds.
    history.script_submit_failures([
        GatewayError::Timeout,
        GatewayError::Timeout,
        GatewayError::Timeout,
    ]);
    let (coordinator, history, media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    // Wait out the initial connect so a failed attempt retries instead of
    // parking for channel recovery.
    eventually("connect", || coordinator.is_connected()).await;

    let file = MediaFile {
        file_name: "beach.jpg".to_string(),
        mime_type: "image/jpeg".to_string(),
        data: vec![0u8; 2048],
    };
    let local_id = coordinator
        .send_message(CHAT, Draft::media(file, "holiday"))
        .await
        .expect("send media");

    eventually("send failure after retries", || {
        coordinator
            .conversation(CHAT)
            .map(|s| s.messages.first().map(|m| m.status) == Some(DeliveryStatus::Failed))
            .unwrap_or(false)
    })
    .await;
    assert_eq!(media.uploads.load(Ordering::SeqCst), 1);
    assert_eq!(history.submit_calls.load(Ordering::SeqCst), 3);

    // Manual retry: same content, same already-uploaded media reference.
    coordinator
        .retry_message(CHAT, &local_id)
        .await
        .expect("retry");

    eventually("retry confirmation", || {
        coordinator
            .conversation(CHAT)
            .map(|s| s.messages.first().map(|m| m.status) == Some(DeliveryStatus::Sent))
            .unwrap_or(false)
    })
    .await;

    assert_eq!(media.uploads.load(Ordering::SeqCst), 1, "no re-upload");
    let snapshot = coordinator.conversation(CHAT).unwrap();
    let media_ref = snapshot.messages[0].content.media().expect("media ref");
    assert_eq!(media_ref.url, "https://cdn.example/u/1");
}

#[tokio::test]
async fn test_outage_parks_send_and_recovers_subscriptions() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(None, empty_page());
    let (coordinator, history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    let first = server.latest().await;
    eventually("initial connect", || coordinator.is_connected()).await;

    // The network goes away entirely.
    server.set_online(false);
    history.script_submit_failures([GatewayError::Transient("connection refused".to_string())]);
    first.drop_connection().await;
    eventually("disconnect observed", || !coordinator.is_connected()).await;

    // A message sent during the outage stays `sending`, not `failed`.
    coordinator
        .send_message(CHAT, Draft::text("are you there?"))
        .await
        .expect("send during outage");
    sleep(Duration::from_millis(300)).await;
    let snapshot = coordinator.conversation(CHAT).unwrap();
    assert_eq!(snapshot.messages[0].status, DeliveryStatus::Sending);

    // Network returns; the manager reconnects with backoff on its own.
    server.set_online(true);
    eventually("reconnect", || coordinator.is_connected()).await;

    // The chat subscription was re-established on the new connection and
    // the parked send went through.
    eventually("parked send confirmed", || {
        coordinator
            .conversation(CHAT)
            .map(|s| s.messages.first().map(|m| m.status) == Some(DeliveryStatus::Sent))
            .unwrap_or(false)
    })
    .await;

    assert!(server.connection_count() >= 2);
    let second = server.connection(server.connection_count() - 1);
    let frames = second.sent_frames().await;
    assert!(
        frames
            .iter()
            .any(|f| f.contains("\"type\":\"subscribe\"") && f.contains(CHAT)),
        "subscription not restored: {frames:?}"
    );
}

#[tokio::test]
async fn test_typing_debounce_and_auto_stop() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(None, empty_page());
    let (coordinator, _history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    let conn = server.latest().await;
    eventually("connect", || coordinator.is_connected()).await;

    // Three keystrokes inside 200ms.
    for _ in 0..3 {
        coordinator.set_typing(CHAT, true);
        sleep(Duration::from_millis(70)).await;
    }
    sleep(Duration::from_millis(100)).await;

    let starts = conn
        .sent_frames()
        .await
        .iter()
        .filter(|f| f.contains("typing:start"))
        .count();
    assert_eq!(starts, 1, "debounce failed");

    // No keystroke for over a second: the stop goes out by itself.
    sleep(Duration::from_millis(1100)).await;
    let frames = conn.sent_frames().await;
    assert_eq!(
        frames.iter().filter(|f| f.contains("typing:stop")).count(),
        1
    );

    // Peer typing indicator expires locally without an explicit stop.
    conn.push(&ServerFrame::Typing {
        chat_id: CHAT.to_string(),
        user_id: "bob".to_string(),
        started: true,
    })
    .await;
    eventually("peer typing on", || coordinator.is_peer_typing(CHAT)).await;
    eventually("peer typing expired", || !coordinator.is_peer_typing(CHAT)).await;
}

#[tokio::test]
async fn test_blocked_chat_rejects_send_without_entry() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(true)).with_page(None, empty_page());
    let (coordinator, _history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    let result = coordinator.send_message(CHAT, Draft::text("hi")).await;
    assert!(matches!(result, Err(ChatError::Permanent(_))));
    assert!(coordinator.conversation(CHAT).unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_empty_draft_is_a_validation_error() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(None, empty_page());
    let (coordinator, _history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    let result = coordinator.send_message(CHAT, Draft::text("   ")).await;
    assert!(matches!(result, Err(ChatError::Validation(_))));

    // Oversized attachments are rejected synchronously too.
    let oversized = Draft::media(
        MediaFile {
            file_name: "huge.bin".to_string(),
            mime_type: "application/octet-stream".to_string(),
            data: vec![0u8; 26 * 1024 * 1024],
        },
        "",
    );
    let result = coordinator.send_message(CHAT, oversized).await;
    assert!(matches!(result, Err(ChatError::Validation(_))));
    assert!(coordinator.conversation(CHAT).unwrap().messages.is_empty());
}

#[tokio::test]
async fn test_reactions_replace_and_conflict_notice() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(
        None,
        MessagePage {
            messages: vec![
                incoming("m-1", 10, "react to me"),
                incoming("m-deleted", 20, "going away"),
            ],
            next_cursor: None,
        },
    );
    let (coordinator, _history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    let mut notices = coordinator.events().notice.subscribe();

    // Reacting to a message that is not in the cache is a conflict.
    let result = coordinator.react(CHAT, "m-404", Some("👍".to_string())).await;
    assert!(matches!(result, Err(ChatError::Conflict(_))));
    let notice = notices.recv().await.expect("conflict notice");
    assert_eq!(notice.chat_id.as_deref(), Some(CHAT));

    // Still cached locally, but the server deleted it in the meantime: the
    // backend conflict surfaces as a notice and local state is unchanged.
    let result = coordinator
        .react(CHAT, "m-deleted", Some("👍".to_string()))
        .await;
    assert!(matches!(result, Err(ChatError::Conflict(_))));
    let notice = notices.recv().await.expect("server conflict notice");
    assert!(notice.text.contains("deleted"));
    let snapshot = coordinator.conversation(CHAT).unwrap();
    assert!(snapshot.messages[1].reactions.is_empty());

    // A normal reaction, then a replacement by the same user.
    coordinator
        .react(CHAT, "m-1", Some("👍".to_string()))
        .await
        .expect("react");
    coordinator
        .react(CHAT, "m-1", Some("❤️".to_string()))
        .await
        .expect("replace");

    let snapshot = coordinator.conversation(CHAT).unwrap();
    assert_eq!(snapshot.messages[0].reactions.len(), 1);
    assert_eq!(snapshot.messages[0].reactions[0].emoji, "❤️");
    assert_eq!(snapshot.messages[0].reactions[0].user_id, "alice");

    // Clearing it again.
    coordinator
        .react(CHAT, "m-1", None)
        .await
        .expect("remove reaction");
    assert!(
        coordinator.conversation(CHAT).unwrap().messages[0]
            .reactions
            .is_empty()
    );
}

#[tokio::test]
async fn test_mark_read_is_forward_only_and_hits_the_backend() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(
        None,
        MessagePage {
            messages: vec![incoming("m-1", 10, "unread")],
            next_cursor: None,
        },
    );
    let (coordinator, history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    coordinator
        .mark_read(CHAT, vec!["m-1".to_string()])
        .await
        .expect("mark read");

    assert_eq!(*history.marked_read.lock().unwrap(), vec!["m-1".to_string()]);
    let snapshot = coordinator.conversation(CHAT).unwrap();
    assert_eq!(snapshot.messages[0].status, DeliveryStatus::Read);

    // A stale `delivered` push afterwards cannot regress it.
    let conn = server.latest().await;
    conn.push(&ServerFrame::MessageStatus {
        chat_id: CHAT.to_string(),
        message_id: "m-1".to_string(),
        status: DeliveryStatus::Delivered,
    })
    .await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        coordinator.conversation(CHAT).unwrap().messages[0].status,
        DeliveryStatus::Read
    );
}

#[tokio::test]
async fn test_status_pushes_advance_own_message() {
    let server = FakeServer::new();
    let history = FakeHistory::new(two_party_chat(false)).with_page(None, empty_page());
    let (coordinator, _history, _media) = start(history, &server);

    coordinator.open_chat(CHAT).await.expect("open chat");
    coordinator
        .send_message(CHAT, Draft::text("hello"))
        .await
        .expect("send");

    eventually("confirmed", || {
        coordinator
            .conversation(CHAT)
            .map(|s| s.messages.first().map(|m| m.status) == Some(DeliveryStatus::Sent))
            .unwrap_or(false)
    })
    .await;

    let conn = server.latest().await;
    conn.push(&ServerFrame::MessageStatus {
        chat_id: CHAT.to_string(),
        message_id: "m-1".to_string(),
        status: DeliveryStatus::Delivered,
    })
    .await;
    conn.push(&ServerFrame::MessageStatus {
        chat_id: CHAT.to_string(),
        message_id: "m-1".to_string(),
        status: DeliveryStatus::Read,
    })
    .await;

    eventually("read receipt applied", || {
        coordinator
            .conversation(CHAT)
            .map(|s| s.messages[0].status == DeliveryStatus::Read)
            .unwrap_or(false)
    })
    .await;
}
