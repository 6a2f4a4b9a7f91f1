use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::debug;

use crate::errors::ChatError;
use crate::models::{Message, MessageRole};
use crate::protocol::ChatFrame;
use crate::store::ConversationStore;

/// Writes socket-delivered events into the conversation store.
///
/// Sending a message appends it locally right away (optimistic echo) and the
/// server then echoes it back. Each local echo is remembered for
/// `echo_window` and absorbs the first server echo with the same text.
pub struct ConversationBridge {
    store: Arc<dyn ConversationStore>,
    echo_window: Duration,
    pending_echoes: HashMap<String, VecDeque<Instant>>,
}

impl ConversationBridge {
    pub fn new(store: Arc<dyn ConversationStore>, echo_window: Duration) -> Self {
        Self { store, echo_window, pending_echoes: HashMap::new() }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Appends the user's own message before the server confirms it.
    pub async fn record_local_echo(
        &mut self,
        conversation_id: &str,
        text: &str,
        now: Instant,
    ) -> Result<Message, ChatError> {
        let message = Message::new(conversation_id.to_string(), MessageRole::User, text.to_string());
        self.store.append_message(conversation_id, message.clone()).await?;
        self.sweep_echoes(now);
        self.pending_echoes.entry(text.to_string()).or_default().push_back(now);
        Ok(message)
    }

    /// Applies a finalized user or system message. Returns the appended
    /// message, or `None` when it was absorbed as a duplicate.
    pub async fn apply_chat(
        &mut self,
        conversation_id: &str,
        frame: ChatFrame,
        now: Instant,
    ) -> Result<Option<Message>, ChatError> {
        if frame.role == MessageRole::User && self.take_pending_echo(&frame.content, now) {
            debug!("Server echo absorbed by local echo in {conversation_id}");
            return Ok(None);
        }
        let message = Message::new(conversation_id.to_string(), frame.role, frame.content)
            .with_id(frame.id)
            .at(frame.timestamp);
        self.append(conversation_id, message).await
    }

    /// Appends the text produced by the stream assembler.
    pub async fn finalize_assistant(
        &mut self,
        conversation_id: &str,
        text: String,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<Option<Message>, ChatError> {
        let message = Message::new(conversation_id.to_string(), MessageRole::Assistant, text).at(timestamp);
        self.append(conversation_id, message).await
    }

    pub async fn apply_title(&self, conversation_id: &str, title: &str) -> Result<(), ChatError> {
        self.store.set_title(conversation_id, title).await
    }

    pub fn reset(&mut self) {
        self.pending_echoes.clear();
    }

    async fn append(&self, conversation_id: &str, message: Message) -> Result<Option<Message>, ChatError> {
        if self.store.append_message(conversation_id, message.clone()).await? {
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }

    /// Drops echoes the server never confirmed within the window.
    fn sweep_echoes(&mut self, now: Instant) {
        let window = self.echo_window;
        self.pending_echoes.retain(|_, sent| {
            sent.retain(|at| now.saturating_duration_since(*at) <= window);
            !sent.is_empty()
        });
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending_echoes.values().map(VecDeque::len).sum()
    }

    fn take_pending_echo(&mut self, text: &str, now: Instant) -> bool {
        let window = self.echo_window;
        let Some(sent) = self.pending_echoes.get_mut(text) else {
            return false;
        };
        sent.retain(|at| now.saturating_duration_since(*at) <= window);
        let hit = sent.pop_front().is_some();
        if sent.is_empty() {
            self.pending_echoes.remove(text);
        }
        hit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConversationStore;

    fn user_frame(text: &str) -> ChatFrame {
        ChatFrame { role: MessageRole::User, content: text.into(), timestamp: None, id: None }
    }

    fn bridge(store: &MemoryConversationStore) -> ConversationBridge {
        ConversationBridge::new(Arc::new(store.clone()), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn local_echo_absorbs_server_echo() {
        let store = MemoryConversationStore::new();
        let mut bridge = bridge(&store);
        let now = Instant::now();

        bridge.record_local_echo("c1", "hello", now).await.unwrap();
        let applied = bridge.apply_chat("c1", user_frame("hello"), now).await.unwrap();
        assert!(applied.is_none());

        let messages = store.list_messages("c1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn each_local_echo_absorbs_one_server_echo() {
        let store = MemoryConversationStore::new();
        let mut bridge = bridge(&store);
        let now = Instant::now();

        bridge.record_local_echo("c1", "ok", now).await.unwrap();
        assert!(bridge.apply_chat("c1", user_frame("ok"), now).await.unwrap().is_none());
        // Second arrival of the same text is another user's message.
        assert!(bridge.apply_chat("c1", user_frame("ok"), now).await.unwrap().is_some());
        assert_eq!(store.list_messages("c1").await.unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_echo_does_not_absorb() {
        let store = MemoryConversationStore::new();
        let mut bridge = bridge(&store);
        let now = Instant::now();

        bridge.record_local_echo("c1", "late", now).await.unwrap();
        let later = now + Duration::from_secs(11);
        assert!(bridge.apply_chat("c1", user_frame("late"), later).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn origin_ids_dedup_and_order_is_kept() {
        let store = MemoryConversationStore::new();
        let mut bridge = bridge(&store);
        let now = Instant::now();

        let system = ChatFrame {
            role: MessageRole::System,
            content: "An error occurred. Please try again.".into(),
            timestamp: None,
            id: Some("srv-1".into()),
        };
        assert!(bridge.apply_chat("c1", system.clone(), now).await.unwrap().is_some());
        assert!(bridge.apply_chat("c1", system, now).await.unwrap().is_none());
        bridge.finalize_assistant("c1", "Xin chào".into(), None).await.unwrap();

        let roles: Vec<MessageRole> = store.list_messages("c1").await.unwrap().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![MessageRole::System, MessageRole::Assistant]);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forgets_pending_echoes() {
        let store = MemoryConversationStore::new();
        let mut bridge = bridge(&store);
        let now = Instant::now();
        bridge.record_local_echo("c1", "hi", now).await.unwrap();
        bridge.reset();
        assert!(bridge.apply_chat("c1", user_frame("hi"), now).await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unconfirmed_echoes_are_swept() {
        let store = MemoryConversationStore::new();
        let mut bridge = bridge(&store);
        let now = Instant::now();

        for i in 0..5 {
            bridge.record_local_echo("c1", &format!("blocked {i}"), now).await.unwrap();
        }
        assert_eq!(bridge.pending_len(), 5);

        let later = now + Duration::from_secs(11);
        bridge.record_local_echo("c1", "fresh", later).await.unwrap();
        assert_eq!(bridge.pending_len(), 1);
        assert!(bridge.apply_chat("c1", user_frame("fresh"), later).await.unwrap().is_none());
    }
}
