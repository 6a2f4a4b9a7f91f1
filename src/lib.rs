//! Real-time chat transport: one persistent WebSocket per conversation,
//! streamed assistant replies, typing indicators, title updates and
//! moderation lockouts, reconciled into a shared conversation store.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod errors;
pub mod models;
pub mod protocol;
pub mod session;
pub mod store;
pub mod stream;
pub mod transport;
pub mod violations;

pub use auth::{CredentialSource, EnvCredentialSource, RefreshCoordinator, StaticCredential};
pub use config::{ClientConfig, ReconnectPolicy};
pub use errors::ChatError;
pub use models::{BanState, Conversation, Message, MessageRole, Notification, ViolationLevel, ViolationRecord};
pub use session::{ChatEvent, ChatSession, CloseOutcome, ConnectionState, SessionSnapshot};
pub use store::{ConversationStore, MemoryConversationStore};
pub use transport::{Connector, MemoryConnector, WsConnector};
pub use violations::{LogNotificationSink, NotificationSink};
