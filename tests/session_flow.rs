use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};

use chat_transport::errors::ChatError;
use chat_transport::transport::{ClientFrame, MemoryPeer};
use chat_transport::violations::MAX_BAN_SECONDS;
use chat_transport::{
    ChatEvent, ChatSession, ClientConfig, CloseOutcome, ConnectionState, ConversationStore, MemoryConnector,
    MemoryConversationStore, MessageRole, Notification, NotificationSink, ReconnectPolicy, ViolationLevel,
};

const WAIT: Duration = Duration::from_secs(3600);

#[derive(Default)]
struct RecordingSink {
    shown: Mutex<Vec<Notification>>,
    dismissed: Mutex<Vec<String>>,
}

impl NotificationSink for RecordingSink {
    fn notify(&self, notification: &Notification) {
        self.shown.lock().unwrap().push(notification.clone());
    }

    fn dismiss(&self, id: &str) {
        self.dismissed.lock().unwrap().push(id.to_string());
    }
}

struct Harness {
    session: ChatSession,
    connector: MemoryConnector,
    peers: mpsc::UnboundedReceiver<MemoryPeer>,
    store: Arc<MemoryConversationStore>,
    sink: Arc<RecordingSink>,
    events: broadcast::Receiver<ChatEvent>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    fn with_config(config: ClientConfig) -> Self {
        let (connector, peers) = MemoryConnector::new();
        let store = Arc::new(MemoryConversationStore::new());
        let sink = Arc::new(RecordingSink::default());
        let (session, _task) =
            ChatSession::spawn(config, Arc::new(connector.clone()), store.clone(), sink.clone());
        let events = session.subscribe();
        Self { session, connector, peers, store, sink, events }
    }

    /// Opens `conversation_id` and waits until the socket is up.
    async fn open(&mut self, conversation_id: &str) -> MemoryPeer {
        self.session.open(conversation_id, "secret-token").await.unwrap();
        let peer = self.next_peer().await;
        self.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Open)).await;
        peer
    }

    async fn next_peer(&mut self) -> MemoryPeer {
        timeout(WAIT, self.peers.recv()).await.expect("no connection attempt").expect("connector gone")
    }

    async fn wait_for(&mut self, matches: impl Fn(&ChatEvent) -> bool) -> ChatEvent {
        loop {
            let event = timeout(WAIT, self.events.recv()).await.expect("timed out").expect("events closed");
            if matches(&event) {
                return event;
            }
        }
    }

    /// Sends a title update through `peer` and returns every event emitted
    /// before it arrived.
    async fn sync(&mut self, peer: &MemoryPeer) -> Vec<ChatEvent> {
        peer.send_json(json!({"event": "TITLE_UPDATED", "title": "sync"}));
        let mut seen = Vec::new();
        loop {
            let event = timeout(WAIT, self.events.recv()).await.expect("timed out").expect("events closed");
            if matches!(&event, ChatEvent::TitleUpdated { title, .. } if title == "sync") {
                return seen;
            }
            seen.push(event);
        }
    }
}

fn sent_json(frame: Option<ClientFrame>) -> Value {
    match frame {
        Some(ClientFrame::Text(text)) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

fn is_message(event: &ChatEvent, role: MessageRole) -> bool {
    matches!(event, ChatEvent::Message(m) if m.role == role)
}

#[tokio::test(start_paused = true)]
async fn connects_with_token_in_query() {
    let mut h = Harness::new();
    let peer = h.open("conv-1").await;

    assert_eq!(peer.conversation_id().as_deref(), Some("conv-1"));
    assert_eq!(peer.token().as_deref(), Some("secret-token"));
    assert!(h.session.is_open());
    assert_eq!(h.session.snapshot().conversation_id.as_deref(), Some("conv-1"));
}

#[tokio::test(start_paused = true)]
async fn streamed_reply_is_finalized_on_done() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({"role": "assistant", "content": "Xin "}));
    peer.send_json(json!({"payload": {"role": "assistant", "content": "chào "}}));
    h.wait_for(|e| *e == ChatEvent::Partial("Xin chào ".into())).await;
    assert_eq!(h.session.snapshot().partial, "Xin chào ");

    peer.send_json(json!({"event": "DONE"}));
    let event = h.wait_for(|e| is_message(e, MessageRole::Assistant)).await;
    match event {
        ChatEvent::Message(message) => assert_eq!(message.content, "Xin chào"),
        other => panic!("unexpected {other:?}"),
    }
    h.wait_for(|e| *e == ChatEvent::Partial(String::new())).await;

    let history = h.store.list_messages("c1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "Xin chào");
    assert!(h.session.snapshot().partial.is_empty());
}

#[tokio::test(start_paused = true)]
async fn stream_flushes_after_idle_window() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    let started = Instant::now();
    peer.send_json(json!({"role": "assistant", "content": "partial answer"}));
    h.wait_for(|e| is_message(e, MessageRole::Assistant)).await;

    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert_eq!(h.store.list_messages("c1").await.unwrap()[0].content, "partial answer");
}

#[tokio::test(start_paused = true)]
async fn each_fragment_pushes_the_flush_deadline() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    let started = Instant::now();
    peer.send_json(json!({"role": "assistant", "content": "a"}));
    h.wait_for(|e| matches!(e, ChatEvent::Partial(_))).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    peer.send_json(json!({"role": "assistant", "content": "b"}));
    h.wait_for(|e| is_message(e, MessageRole::Assistant)).await;

    assert!(started.elapsed() >= Duration::from_millis(3500));
    assert_eq!(h.store.list_messages("c1").await.unwrap()[0].content, "ab");
}

#[tokio::test(start_paused = true)]
async fn local_echo_absorbs_server_echo() {
    let mut h = Harness::new();
    let mut peer = h.open("c1").await;

    assert!(h.session.send_message("hello").await);
    let sent = sent_json(peer.recv().await);
    assert_eq!(sent, json!({"action": "sendMessage", "content": "hello"}));

    peer.send_json(json!({"role": "user", "content": "hello"}));
    let seen = h.sync(&peer).await;
    assert_eq!(seen.iter().filter(|e| is_message(e, MessageRole::User)).count(), 1);

    let history = h.store.list_messages("c1").await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].role, MessageRole::User);
}

#[tokio::test(start_paused = true)]
async fn server_echo_after_window_is_kept() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    assert!(h.session.send_message("hello").await);
    tokio::time::advance(Duration::from_secs(11)).await;
    peer.send_json(json!({"role": "user", "content": "hello"}));
    h.wait_for(|e| is_message(e, MessageRole::User)).await;
    h.sync(&peer).await;

    assert_eq!(h.store.list_messages("c1").await.unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn typing_pings_are_rate_limited() {
    let mut h = Harness::new();
    let mut peer = h.open("c1").await;

    h.session.send_typing().await;
    h.session.send_typing().await;
    assert_eq!(sent_json(peer.try_recv()), json!({"action": "typing"}));
    assert_eq!(peer.try_recv(), None);

    tokio::time::advance(Duration::from_millis(1000)).await;
    h.session.send_typing().await;
    assert_eq!(peer.try_recv(), None);

    tokio::time::advance(Duration::from_millis(1)).await;
    h.session.send_typing().await;
    assert_eq!(sent_json(peer.try_recv()), json!({"action": "typing"}));
}

#[tokio::test(start_paused = true)]
async fn file_upload_is_forwarded() {
    let mut h = Harness::new();
    let mut peer = h.open("c1").await;

    let info = json!({"name": "notes.pdf", "url": "https://files.test/notes.pdf"});
    assert!(h.session.send_file_upload(info.clone()).await);
    assert_eq!(sent_json(peer.try_recv()), json!({"action": "file_upload", "file_info": info}));
}

#[tokio::test(start_paused = true)]
async fn nothing_is_sent_while_disconnected() {
    let h = Harness::new();
    assert!(!h.session.send_message("hello").await);
    assert!(!h.session.send_file_upload(json!({})).await);
    h.session.send_typing().await;
    assert_eq!(h.store.list_messages("c1").await.unwrap().len(), 0);
}

#[tokio::test(start_paused = true)]
async fn blank_message_is_sent_as_is() {
    let mut h = Harness::new();
    let mut peer = h.open("c1").await;
    assert!(h.session.send_message("   ").await);
    assert_eq!(sent_json(peer.try_recv()), json!({"action": "sendMessage", "content": "   "}));
}

#[tokio::test(start_paused = true)]
async fn remote_typing_clears_after_ttl() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({"event": "TYPING"}));
    h.wait_for(|e| *e == ChatEvent::Typing(true)).await;
    let started = Instant::now();
    h.wait_for(|e| *e == ChatEvent::Typing(false)).await;

    assert!(started.elapsed() >= Duration::from_millis(2000));
    assert!(!h.session.snapshot().remote_typing);
}

#[tokio::test(start_paused = true)]
async fn title_update_reaches_store() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({"event": "TITLE_UPDATED", "title": "Kế hoạch du lịch"}));
    let event = h.wait_for(|e| matches!(e, ChatEvent::TitleUpdated { .. })).await;
    assert_eq!(
        event,
        ChatEvent::TitleUpdated { conversation_id: "c1".into(), title: "Kế hoạch du lịch".into() }
    );
    let conversation = h.store.find_conversation("c1").await.unwrap().unwrap();
    assert_eq!(conversation.title, "Kế hoạch du lịch");
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_reconnects_after_delay() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.close(1011, "server restart");
    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Reconnecting))).await;
    assert_eq!(h.session.snapshot().retry_count, 1);

    let started = Instant::now();
    let again = h.next_peer().await;
    assert!(started.elapsed() >= Duration::from_millis(3000));
    assert_eq!(again.conversation_id().as_deref(), Some("c1"));

    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Open)).await;
    assert_eq!(h.session.snapshot().retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn dropped_socket_counts_as_abnormal_close() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;
    drop(peer);
    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Reconnecting))).await;
    h.next_peer().await;
}

#[tokio::test(start_paused = true)]
async fn policy_close_does_not_reconnect() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.close(1008, "invalid token");
    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Rejected))).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.peers.try_recv().is_err());
    assert!(!h.session.is_open());
}

#[tokio::test(start_paused = true)]
async fn forbidden_handshake_is_a_rejection() {
    let mut h = Harness::new();
    h.connector.refuse_next(ChatError::HandshakeRejected { status: 403 }).await;

    h.session.open("c1", "expired").await.unwrap();
    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Rejected))).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.peers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn attempt_cap_stops_reconnecting() {
    let policy = ReconnectPolicy { max_attempts: Some(2), ..ReconnectPolicy::default() };
    let mut h = Harness::with_config(ClientConfig { reconnect: policy, ..ClientConfig::default() });
    for _ in 0..3 {
        h.connector
            .refuse_next(ChatError::ConnectFailed { url: "ws://test".into(), message: "refused".into() })
            .await;
    }

    h.session.open("c1", "tok").await.unwrap();
    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Exhausted))).await;

    assert_eq!(h.session.snapshot().retry_count, 3);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.peers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn missing_target_stays_disconnected() {
    let mut h = Harness::new();

    h.session.open("c1", "").await.unwrap();
    h.session.open("", "tok").await.unwrap();

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert_eq!(snapshot.conversation_id, None);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(h.peers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn close_sends_normal_closure() {
    let mut h = Harness::new();
    let mut peer = h.open("c1").await;

    h.session.close().await.unwrap();
    assert_eq!(
        peer.recv().await,
        Some(ClientFrame::Close { code: 1000, reason: "chat changed or session closed".into() })
    );
    assert_eq!(h.session.snapshot().connection, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn close_cancels_pending_reconnect() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.close(1006, "");
    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Closed(CloseOutcome::Reconnecting))).await;
    h.session.close().await.unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.peers.try_recv().is_err());
    assert_eq!(h.session.snapshot().connection, ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn switching_conversation_discards_old_state() {
    let mut h = Harness::new();
    let mut first = h.open("c1").await;

    first.send_json(json!({"role": "assistant", "content": "half an ans"}));
    first.send_json(json!({"event": "TYPING"}));
    h.wait_for(|e| *e == ChatEvent::Typing(true)).await;

    let second = h.open("c2").await;
    assert_eq!(second.conversation_id().as_deref(), Some("c2"));
    assert!(matches!(first.recv().await, Some(ClientFrame::Close { code: 1000, .. })));
    assert!(!first.send_json(json!({"role": "assistant", "content": "late"})));

    let snapshot = h.session.snapshot();
    assert!(snapshot.partial.is_empty());
    assert!(!snapshot.remote_typing);

    // The old flush deadline must not fire into either conversation.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(h.store.list_messages("c1").await.unwrap().is_empty());
    assert!(h.store.list_messages("c2").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn violation_locks_sending_until_ban_lapses() {
    let mut h = Harness::new();
    let mut peer = h.open("c1").await;

    peer.send_json(json!({
        "type": "violation",
        "message": "Bạn bị cấm chat 5 phút (vi phạm lần 2).",
        "level": 2,
        "ban_time": 300
    }));
    let event = h.wait_for(|e| matches!(e, ChatEvent::Violation(_))).await;
    match event {
        ChatEvent::Violation(record) => {
            assert_eq!(record.level, ViolationLevel::FiveMinutes);
            assert_eq!(record.ban_seconds, 300);
        }
        other => panic!("unexpected {other:?}"),
    }
    h.wait_for(|e| matches!(e, ChatEvent::Ban(ban) if ban.is_banned)).await;
    let started = Instant::now();

    assert!(h.session.snapshot().ban.banned_until.is_some());
    assert_eq!(h.sink.shown.lock().unwrap().len(), 1);
    assert!(!h.session.send_message("let me talk").await);
    assert_eq!(peer.try_recv(), None);

    h.wait_for(|e| matches!(e, ChatEvent::Ban(ban) if !ban.is_banned)).await;
    assert!(started.elapsed() >= Duration::from_secs(300));

    let shown_id = h.sink.shown.lock().unwrap()[0].id.clone();
    assert_eq!(*h.sink.dismissed.lock().unwrap(), vec![shown_id]);

    assert!(h.session.send_message("back again").await);
}

#[tokio::test(start_paused = true)]
async fn duplicate_violation_is_recorded_once() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    let frame = json!({"type": "violation", "id": "v-1", "message": "Cảnh báo: ngôn từ không phù hợp", "level": 1});
    peer.send_json(frame.clone());
    peer.send_json(frame);
    let seen = h.sync(&peer).await;

    assert_eq!(seen.iter().filter(|e| matches!(e, ChatEvent::Violation(_))).count(), 1);
    assert_eq!(h.sink.shown.lock().unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn plain_text_warning_does_not_lock_sending() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_text("Cảnh báo: vui lòng giữ lịch sự.");
    let event = h.wait_for(|e| matches!(e, ChatEvent::Violation(_))).await;
    match event {
        ChatEvent::Violation(record) => {
            assert_eq!(record.level, ViolationLevel::Warning);
            assert_eq!(record.ban_seconds, 0);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(!h.session.snapshot().ban.is_banned);
    assert!(h.session.send_message("sorry").await);
}

#[tokio::test(start_paused = true)]
async fn oversized_ban_time_keeps_session_alive() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({
        "type": "violation",
        "message": "Tài khoản của bạn đã bị khóa.",
        "level": 4,
        "ban_time": 10_000_000_000_000u64
    }));
    h.wait_for(|e| matches!(e, ChatEvent::Ban(ban) if ban.is_banned)).await;
    peer.send_json(json!({"type": "violation", "id": "max", "message": "x", "ban_time": u64::MAX}));
    let event = h.wait_for(|e| matches!(e, ChatEvent::Violation(_))).await;
    match event {
        ChatEvent::Violation(record) => assert_eq!(record.ban_seconds, MAX_BAN_SECONDS),
        other => panic!("unexpected {other:?}"),
    }

    assert!(h.session.is_open());
    assert!(h.session.snapshot().ban.is_banned);
    assert!(!h.session.send_message("still here?").await);

    h.open("c2").await;
    assert!(!h.session.snapshot().ban.is_banned);
}

#[tokio::test(start_paused = true)]
async fn notification_expires_while_long_ban_holds() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({
        "type": "violation",
        "message": "Bạn bị cấm chat 1 ngày (vi phạm lần 4).",
        "level": 4,
        "ban_time": 86_400
    }));
    h.wait_for(|e| matches!(e, ChatEvent::Ban(ban) if ban.is_banned)).await;

    tokio::time::sleep(Duration::from_millis(4999)).await;
    assert!(h.sink.dismissed.lock().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    let shown_id = h.sink.shown.lock().unwrap()[0].id.clone();
    assert_eq!(*h.sink.dismissed.lock().unwrap(), vec![shown_id]);
    assert!(h.session.snapshot().ban.is_banned);
    assert!(!h.session.send_message("hello?").await);
}

#[tokio::test(start_paused = true)]
async fn system_moderation_reply_does_not_lock_sending() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({"role": "system", "content": "Bạn đang bị cấm chat 1 giờ."}));
    let event = h.wait_for(|e| matches!(e, ChatEvent::Violation(_))).await;
    match event {
        ChatEvent::Violation(record) => assert_eq!(record.ban_seconds, 0),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!h.session.snapshot().ban.is_banned);
    assert!(h.session.send_message("ok").await);
}

#[tokio::test(start_paused = true)]
async fn due_flush_runs_before_queued_fragment() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({"role": "assistant", "content": "a"}));
    h.wait_for(|e| matches!(e, ChatEvent::Partial(_))).await;
    tokio::time::sleep(Duration::from_millis(2000)).await;
    peer.send_json(json!({"role": "assistant", "content": "b"}));

    let event = h.wait_for(|e| is_message(e, MessageRole::Assistant)).await;
    match event {
        ChatEvent::Message(message) => assert_eq!(message.content, "a"),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_clears_ban() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_json(json!({"type": "violation", "message": "Bạn bị cấm chat 1 giờ.", "level": 3, "ban_time": 3600}));
    h.wait_for(|e| matches!(e, ChatEvent::Ban(ban) if ban.is_banned)).await;

    peer.close(1011, "restart");
    h.next_peer().await;
    h.wait_for(|e| *e == ChatEvent::Connection(ConnectionState::Open)).await;

    assert!(!h.session.snapshot().ban.is_banned);
    assert!(h.session.send_message("hello").await);
}

#[tokio::test(start_paused = true)]
async fn garbage_frames_are_ignored() {
    let mut h = Harness::new();
    let peer = h.open("c1").await;

    peer.send_text("not json at all");
    peer.send_text("[1, 2, 3]");
    peer.send_json(json!({"role": "robot", "content": "?"}));
    let seen = h.sync(&peer).await;

    assert!(seen.is_empty());
    assert!(h.session.is_open());
}

#[tokio::test(start_paused = true)]
async fn shutdown_closes_the_handle() {
    let mut h = Harness::new();
    let mut peer = h.open("c1").await;

    h.session.shutdown().await.unwrap();
    assert!(matches!(peer.recv().await, Some(ClientFrame::Close { code: 1000, .. })));
    assert!(matches!(h.session.open("c1", "tok").await, Err(ChatError::SessionClosed)));
}
