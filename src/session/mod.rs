//! The chat session: one long-lived task that owns the socket for the
//! active conversation and every piece of state derived from it.
//!
//! [`ChatSession`] is a cheap, cloneable handle. Commands go to the task
//! over a channel; state comes back as a [`SessionSnapshot`] on a `watch`
//! channel and as discrete [`ChatEvent`]s on a `broadcast` channel.

mod actor;
pub mod connection;
pub mod timers;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::auth::CredentialSource;
use crate::config::ClientConfig;
use crate::errors::ChatError;
use crate::models::{BanState, Message, ViolationRecord};
use crate::store::ConversationStore;
use crate::transport::Connector;
use crate::violations::NotificationSink;

use actor::SessionActor;
pub use connection::{CloseOutcome, Connection, ConnectionState};
pub use timers::{TimerKind, TimerSet};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub conversation_id: Option<String>,
    pub connection: ConnectionState,
    pub connected: bool,
    /// The assistant is composing (server typing indicator).
    pub remote_typing: bool,
    pub ban: BanState,
    /// Streamed assistant text not yet finalized.
    pub partial: String,
    pub retry_count: u32,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            conversation_id: None,
            connection: ConnectionState::Disconnected,
            connected: false,
            remote_typing: false,
            ban: BanState::default(),
            partial: String::new(),
            retry_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Connection(ConnectionState),
    Typing(bool),
    /// Full in-flight assistant text; empty once it has been finalized.
    Partial(String),
    /// A message was appended to the conversation store.
    Message(Message),
    TitleUpdated { conversation_id: String, title: String },
    Violation(ViolationRecord),
    Ban(BanState),
}

pub(crate) enum Command {
    Open { conversation_id: String, credential: String, done: oneshot::Sender<()> },
    Close { done: oneshot::Sender<()> },
    SendMessage { text: String, reply: oneshot::Sender<bool> },
    SendTyping { done: oneshot::Sender<()> },
    SendFileUpload { file_info: Value, reply: oneshot::Sender<bool> },
    Shutdown { done: oneshot::Sender<()> },
}

#[derive(Clone)]
pub struct ChatSession {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<ChatEvent>,
}

impl ChatSession {
    /// Starts the session task. It idles in `Disconnected` until
    /// [`ChatSession::open`] is called.
    pub fn spawn(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn ConversationStore>,
        notifications: Arc<dyn NotificationSink>,
    ) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (state_tx, state) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(config.event_buffer.max(1));

        let actor = SessionActor::new(
            config,
            connector,
            store,
            notifications,
            command_rx,
            state_tx,
            events.clone(),
        );
        let task = tokio::spawn(actor.run());

        (Self { commands, state, events }, task)
    }

    /// Binds the session to a conversation, tearing down any previous
    /// binding first. With an empty id or credential the session stays
    /// disconnected.
    pub async fn open(
        &self,
        conversation_id: impl Into<String>,
        credential: impl Into<String>,
    ) -> Result<(), ChatError> {
        let conversation_id = conversation_id.into();
        let credential = credential.into();
        self.request(|done| Command::Open { conversation_id, credential, done }).await
    }

    /// Like [`ChatSession::open`], taking the credential from `source`.
    pub async fn open_with(
        &self,
        conversation_id: impl Into<String>,
        source: &dyn CredentialSource,
    ) -> Result<(), ChatError> {
        let credential = source.credential().await.unwrap_or_default();
        self.open(conversation_id, credential).await
    }

    pub async fn close(&self) -> Result<(), ChatError> {
        self.request(|done| Command::Close { done }).await
    }

    /// Returns false, without sending anything, while disconnected or banned.
    pub async fn send_message(&self, text: impl Into<String>) -> bool {
        let text = text.into();
        self.request(|reply| Command::SendMessage { text, reply }).await.unwrap_or(false)
    }

    /// Rate-limited; pings inside the window are dropped silently.
    pub async fn send_typing(&self) {
        let _ = self.request(|done| Command::SendTyping { done }).await;
    }

    pub async fn send_file_upload(&self, file_info: Value) -> bool {
        self.request(|reply| Command::SendFileUpload { file_info, reply }).await.unwrap_or(false)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn is_open(&self) -> bool {
        self.state.borrow().connected
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Tears down and stops the session task. Later calls on any clone of
    /// this handle fail with [`ChatError::SessionClosed`].
    pub async fn shutdown(&self) -> Result<(), ChatError> {
        self.request(|done| Command::Shutdown { done }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| ChatError::SessionClosed)?;
        rx.await.map_err(|_| ChatError::SessionClosed)
    }
}
