use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::ChatError;
use crate::models::{Conversation, Message};
use crate::store::ConversationStore;

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Default)]
struct Entry {
    conversation: Option<Conversation>,
    messages: Vec<Message>,
}

/// In-process store shared between the socket pipeline and the UI layer.
/// Cloning shares the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryConversationStore {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a conversation and its history (e.g. loaded over REST).
    pub async fn save(&self, conversation: Conversation, history: Vec<Message>) -> Conversation {
        let mut guard = self.inner.write().await;
        let entry = guard.entry(conversation.id.clone()).or_default();
        entry.conversation = Some(conversation.clone());
        entry.messages = history;
        conversation
    }

    pub async fn find_all(&self) -> Vec<Conversation> {
        let guard = self.inner.read().await;
        let mut all: Vec<Conversation> =
            guard.values().filter_map(|e| e.conversation.clone()).collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all
    }
}

fn entry_for<'a>(map: &'a mut HashMap<String, Entry>, conversation_id: &str) -> &'a mut Entry {
    let entry = map.entry(conversation_id.to_string()).or_default();
    if entry.conversation.is_none() {
        entry.conversation = Some(Conversation::new(conversation_id.to_string(), DEFAULT_TITLE.to_string()));
    }
    entry
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append_message(&self, conversation_id: &str, message: Message) -> Result<bool, ChatError> {
        if conversation_id.is_empty() {
            return Err(ChatError::empty_field("conversation_id"));
        }
        let mut guard = self.inner.write().await;
        let entry = entry_for(&mut guard, conversation_id);
        if entry.messages.iter().any(|m| m.id == message.id) {
            debug!("Message {} already in conversation {conversation_id}", message.id);
            return Ok(false);
        }
        if let Some(conversation) = entry.conversation.as_mut() {
            conversation.updated_at = Utc::now();
        }
        entry.messages.push(message);
        Ok(true)
    }

    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), ChatError> {
        if title.trim().is_empty() {
            return Err(ChatError::empty_field("title"));
        }
        let mut guard = self.inner.write().await;
        let entry = entry_for(&mut guard, conversation_id);
        if let Some(conversation) = entry.conversation.as_mut() {
            conversation.title = title.to_string();
            conversation.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError> {
        let guard = self.inner.read().await;
        Ok(guard.get(conversation_id).map(|e| e.messages.clone()).unwrap_or_default())
    }

    async fn find_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, ChatError> {
        let guard = self.inner.read().await;
        Ok(guard.get(conversation_id).and_then(|e| e.conversation.clone()))
    }
}
