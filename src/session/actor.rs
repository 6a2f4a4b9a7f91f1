use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::bridge::ConversationBridge;
use crate::config::ClientConfig;
use crate::errors::ChatError;
use crate::models::MessageRole;
use crate::protocol::{decode, InboundFrame, OutboundCommand, TypingLimiter, ViolationNotice};
use crate::session::connection::{CloseOutcome, Connection, ConnectionState};
use crate::session::timers::{TimerKind, TimerSet};
use crate::session::{ChatEvent, Command, SessionSnapshot};
use crate::store::ConversationStore;
use crate::stream::StreamAssembler;
use crate::transport::{redacted, session_url, Connector, Transport, TransportEvent, NORMAL_CLOSURE};
use crate::violations::{NotificationSink, ViolationTracker};

const CLOSE_GRACE: Duration = Duration::from_secs(2);

type PendingConnect = BoxFuture<'static, Result<Box<dyn Transport>, ChatError>>;

struct Target {
    conversation_id: String,
    credential: String,
}

pub(crate) struct SessionActor {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    notifications: Arc<dyn NotificationSink>,
    commands: mpsc::Receiver<Command>,
    state_tx: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<ChatEvent>,

    target: Option<Target>,
    connection: Connection,
    transport: Option<Box<dyn Transport>>,
    pending_connect: Option<PendingConnect>,
    timers: TimerSet,
    assembler: StreamAssembler,
    stream_timestamp: Option<DateTime<Utc>>,
    bridge: ConversationBridge,
    tracker: ViolationTracker,
    typing: TypingLimiter,
    remote_typing: bool,
}

impl SessionActor {
    pub(crate) fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ConversationStore>,
        notifications: Arc<dyn NotificationSink>,
        commands: mpsc::Receiver<Command>,
        state_tx: watch::Sender<SessionSnapshot>,
        events: broadcast::Sender<ChatEvent>,
    ) -> Self {
        Self {
            connection: Connection::new(config.reconnect.clone(), config.policy_close_code),
            assembler: StreamAssembler::new(config.stream_idle_flush),
            bridge: ConversationBridge::new(store, config.echo_window),
            tracker: ViolationTracker::new(config.notification_ttl),
            typing: TypingLimiter::new(config.typing_interval),
            config,
            connector,
            notifications,
            commands,
            state_tx,
            events,
            target: None,
            transport: None,
            pending_connect: None,
            timers: TimerSet::new(),
            stream_timestamp: None,
            remote_typing: false,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.timers.next_deadline();
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { done }) => {
                        self.teardown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.teardown().await;
                        break;
                    }
                },
                result = poll_connect(&mut self.pending_connect) => {
                    self.on_connect_result(result)
                }
                // Ahead of the socket so a busy stream cannot starve deadlines.
                _ = sleep_until_deadline(deadline) => self.on_timers_due().await,
                event = next_event(&mut self.transport) => self.on_transport_event(event).await,
            }
        }
        info!("Chat session stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Open { conversation_id, credential, done } => {
                self.open(conversation_id, credential).await;
                let _ = done.send(());
            }
            Command::Close { done } => {
                self.teardown().await;
                let _ = done.send(());
            }
            Command::SendMessage { text, reply } => {
                let sent = self.send_message(text).await;
                let _ = reply.send(sent);
            }
            Command::SendTyping { done } => {
                self.send_typing().await;
                let _ = done.send(());
            }
            Command::SendFileUpload { file_info, reply } => {
                let sent = self.send_file_upload(file_info).await;
                let _ = reply.send(sent);
            }
            // Handled by the loop itself.
            Command::Shutdown { done } => {
                let _ = done.send(());
            }
        }
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    async fn open(&mut self, conversation_id: String, credential: String) {
        self.teardown().await;

        if conversation_id.trim().is_empty() || credential.trim().is_empty() {
            warn!("Not connecting: conversation id or credential missing");
            self.publish();
            return;
        }

        self.target = Some(Target { conversation_id, credential });
        self.start_connect();
    }

    fn start_connect(&mut self) {
        let Some(target) = &self.target else {
            return;
        };
        let url = match session_url(&self.config.ws_base_url, &target.conversation_id, &target.credential) {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot connect: {e}");
                self.connection.reset();
                self.publish();
                return;
            }
        };
        if !self.connection.begin_connect() {
            return;
        }

        info!("Connecting to {}", redacted(&url));
        let connector = Arc::clone(&self.connector);
        self.pending_connect = Some(Box::pin(async move { connector.connect(&url).await }));
        self.publish();
    }

    fn on_connect_result(&mut self, result: Result<Box<dyn Transport>, ChatError>) {
        self.pending_connect = None;
        match result {
            Ok(transport) => {
                self.transport = Some(transport);
                self.connection.on_open();
                self.tracker.clear_ban();
                self.timers.cancel(&TimerKind::BanLapse);
                if let Some(target) = &self.target {
                    info!("Connected to conversation {}", target.conversation_id);
                }
            }
            Err(e) => {
                warn!("Connection attempt failed: {e}");
                let delay = self.connection.on_connect_failed(&e);
                self.schedule_reconnect(delay);
            }
        }
        self.publish();
    }

    async fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Text(raw) => match decode(&raw) {
                Some(frame) => self.on_frame(frame).await,
                None => debug!("Ignoring undecodable frame"),
            },
            TransportEvent::Closed { code, reason } => {
                info!("Socket closed by server (code {code}): {reason}");
                self.transport = None;
                self.remote_typing = false;
                self.timers.cancel(&TimerKind::RemoteTyping);
                let delay = self.connection.on_closed(code);
                self.schedule_reconnect(delay);
                self.publish();
            }
        }
    }

    fn schedule_reconnect(&mut self, delay: Option<Duration>) {
        if let Some(delay) = delay {
            self.timers.schedule(TimerKind::Reconnect, Instant::now() + delay);
        }
    }

    /// Returns the session to its idle state. Safe to call repeatedly;
    /// nothing scheduled before the call survives it.
    async fn teardown(&mut self) {
        self.timers.clear();
        self.pending_connect = None;

        if let Some(mut transport) = self.transport.take() {
            self.connection.begin_close();
            self.publish();
            if timeout(CLOSE_GRACE, transport.close(NORMAL_CLOSURE, "chat changed or session closed"))
                .await
                .is_err()
            {
                debug!("Socket close timed out");
            }
        }

        self.assembler.reset();
        self.stream_timestamp = None;
        self.typing.reset();
        self.remote_typing = false;
        self.bridge.reset();
        for id in self.tracker.reset() {
            self.notifications.dismiss(&id);
        }
        if let Some(target) = self.target.take() {
            debug!("Released conversation {}", target.conversation_id);
        }
        self.connection.reset();
        self.publish();
    }

    // ── Inbound ───────────────────────────────────────────────────────────────

    async fn on_frame(&mut self, frame: InboundFrame) {
        let Some(conversation_id) = self.target.as_ref().map(|t| t.conversation_id.clone()) else {
            return;
        };
        let now = Instant::now();

        match frame {
            InboundFrame::Chat(chat) if chat.role == MessageRole::Assistant => {
                if chat.timestamp.is_some() {
                    self.stream_timestamp = chat.timestamp;
                }
                let partial = self.assembler.on_fragment(&chat.content).to_string();
                self.timers.schedule(TimerKind::StreamFlush, now + self.assembler.idle_window());
                self.emit(ChatEvent::Partial(partial));
                self.publish();
            }
            InboundFrame::Chat(chat) => match self.bridge.apply_chat(&conversation_id, chat, now).await {
                Ok(Some(message)) => self.emit(ChatEvent::Message(message)),
                Ok(None) => {}
                Err(e) => error!("Failed to store message for {conversation_id}: {e}"),
            },
            InboundFrame::Typing => {
                self.remote_typing = true;
                self.timers.schedule(TimerKind::RemoteTyping, now + self.config.remote_typing_ttl);
                self.publish();
            }
            InboundFrame::TitleUpdated { title } => match self.bridge.apply_title(&conversation_id, &title).await {
                Ok(()) => {
                    info!("Conversation {conversation_id} renamed to '{title}'");
                    self.emit(ChatEvent::TitleUpdated { conversation_id, title });
                }
                Err(e) => error!("Failed to update title for {conversation_id}: {e}"),
            },
            InboundFrame::Violation(notice) => self.on_violation(notice, now),
            InboundFrame::StreamDone => {
                self.timers.cancel(&TimerKind::StreamFlush);
                self.flush_stream(&conversation_id).await;
                self.remote_typing = false;
                self.timers.cancel(&TimerKind::RemoteTyping);
                self.publish();
            }
            InboundFrame::FileUploaded => debug!("Ignoring FILE_UPLOADED event"),
        }
    }

    async fn flush_stream(&mut self, conversation_id: &str) {
        let had_partial = !self.assembler.is_empty();
        let timestamp = self.stream_timestamp.take();
        if let Some(text) = self.assembler.flush() {
            match self.bridge.finalize_assistant(conversation_id, text, timestamp).await {
                Ok(Some(message)) => self.emit(ChatEvent::Message(message)),
                Ok(None) => {}
                Err(e) => error!("Failed to store assistant reply for {conversation_id}: {e}"),
            }
        }
        if had_partial {
            self.emit(ChatEvent::Partial(String::new()));
        }
    }

    fn on_violation(&mut self, notice: ViolationNotice, now: Instant) {
        self.remote_typing = false;
        self.timers.cancel(&TimerKind::RemoteTyping);

        let Some(accepted) = self.tracker.record(&notice, now, Utc::now()) else {
            self.publish();
            return;
        };
        self.notifications.notify(&accepted.notification);
        self.timers.schedule(
            TimerKind::NotificationExpiry(accepted.notification.id.clone()),
            accepted.expires_at,
        );
        if let Some(until) = self.tracker.ban_deadline() {
            self.timers.schedule(TimerKind::BanLapse, until);
        }
        self.emit(ChatEvent::Violation(accepted.record));
        self.publish();
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    async fn on_timers_due(&mut self) {
        let now = Instant::now();
        for kind in self.timers.take_expired(now) {
            self.on_timer(kind, now).await;
        }
        self.publish();
    }

    async fn on_timer(&mut self, kind: TimerKind, now: Instant) {
        match kind {
            TimerKind::Reconnect => {
                if self.connection.state() == ConnectionState::Closed(CloseOutcome::Reconnecting) {
                    self.start_connect();
                }
            }
            TimerKind::StreamFlush => {
                if let Some(conversation_id) = self.target.as_ref().map(|t| t.conversation_id.clone()) {
                    self.flush_stream(&conversation_id).await;
                }
            }
            TimerKind::RemoteTyping => self.remote_typing = false,
            TimerKind::BanLapse => {
                // Re-evaluating drops the lapsed ban.
                self.tracker.is_banned(now);
            }
            TimerKind::NotificationExpiry(id) => {
                if self.tracker.expire(&id) {
                    self.notifications.dismiss(&id);
                }
            }
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    async fn send_message(&mut self, text: String) -> bool {
        let now = Instant::now();
        if !self.connection.is_open() {
            debug!("Refusing to send: not connected");
            return false;
        }
        if self.tracker.is_banned(now) {
            info!("Refusing to send: sending is locked out");
            return false;
        }
        let Some(conversation_id) = self.target.as_ref().map(|t| t.conversation_id.clone()) else {
            return false;
        };

        if !self.transmit(&OutboundCommand::SendMessage { content: text.clone() }).await {
            return false;
        }

        match self.bridge.record_local_echo(&conversation_id, &text, now).await {
            Ok(message) => self.emit(ChatEvent::Message(message)),
            Err(e) => error!("Failed to record local echo for {conversation_id}: {e}"),
        }
        true
    }

    async fn send_typing(&mut self) {
        if !self.connection.is_open() || !self.typing.try_acquire(Instant::now()) {
            return;
        }
        self.transmit(&OutboundCommand::Typing).await;
    }

    async fn send_file_upload(&mut self, file_info: Value) -> bool {
        if !self.connection.is_open() {
            return false;
        }
        self.transmit(&OutboundCommand::FileUpload { file_info }).await
    }

    async fn transmit(&mut self, command: &OutboundCommand) -> bool {
        let frame = match command.encode() {
            Ok(frame) => frame,
            Err(e) => {
                error!("{e}");
                return false;
            }
        };
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        match transport.send_text(frame).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send frame: {e}");
                false
            }
        }
    }

    // ── Publishing ────────────────────────────────────────────────────────────

    fn emit(&self, event: ChatEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.target.as_ref().map(|t| t.conversation_id.clone()),
            connection: self.connection.state(),
            connected: self.connection.is_open(),
            remote_typing: self.remote_typing,
            ban: self.tracker.ban_state(),
            partial: self.assembler.partial().to_string(),
            retry_count: self.connection.retry_count(),
        }
    }

    /// Pushes the current snapshot and emits events for the fields that
    /// changed since the last one.
    fn publish(&self) {
        let next = self.snapshot();
        if *self.state_tx.borrow() == next {
            return;
        }
        let previous = self.state_tx.send_replace(next.clone());
        if previous.connection != next.connection {
            self.emit(ChatEvent::Connection(next.connection));
        }
        if previous.remote_typing != next.remote_typing {
            self.emit(ChatEvent::Typing(next.remote_typing));
        }
        if previous.ban != next.ban {
            self.emit(ChatEvent::Ban(next.ban));
        }
    }
}

async fn poll_connect(pending: &mut Option<PendingConnect>) -> Result<Box<dyn Transport>, ChatError> {
    match pending.as_mut() {
        Some(connect) => connect.await,
        None => std::future::pending().await,
    }
}

async fn next_event(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport.as_mut() {
        Some(transport) => transport.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
