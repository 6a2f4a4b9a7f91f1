pub mod memory;

use async_trait::async_trait;

use crate::errors::ChatError;
use crate::models::{Conversation, Message};

pub use memory::MemoryConversationStore;

/// Shared conversation state the socket pipeline writes into. Lives longer
/// than any single connection.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Appends in call order. Returns `Ok(false)` without touching the list
    /// when a message with the same id is already present.
    async fn append_message(&self, conversation_id: &str, message: Message) -> Result<bool, ChatError>;

    /// Sets the title and bumps `updated_at`.
    async fn set_title(&self, conversation_id: &str, title: &str) -> Result<(), ChatError>;

    async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>, ChatError>;

    async fn find_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>, ChatError>;
}
