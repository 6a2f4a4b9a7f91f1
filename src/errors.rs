use thiserror::Error;

/// Top-level client error. All variants carry a human-readable message for
/// display/logging.
#[derive(Debug, Error)]
pub enum ChatError {
    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    // ── Transport errors ─────────────────────────────────────────────────────
    #[error("Invalid socket URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Connection to {url} failed: {message}")]
    ConnectFailed { url: String, message: String },

    #[error("Handshake rejected by server with HTTP status {status}")]
    HandshakeRejected { status: u16 },

    #[error("Transport error: {0}")]
    Transport(String),

    // ── Protocol errors ──────────────────────────────────────────────────────
    #[error("Failed to encode outbound frame: {0}")]
    Encode(#[source] serde_json::Error),

    // ── Collaborator errors ──────────────────────────────────────────────────
    #[error("Credential unavailable: {0}")]
    Credential(String),

    #[error("Conversation '{id}' not found")]
    ConversationNotFound { id: String },

    #[error("Configuration error: {0}")]
    Config(String),

    // ── System errors ────────────────────────────────────────────────────────
    #[error("Chat session has shut down")]
    SessionClosed,
}

impl ChatError {
    pub fn empty_field(field_name: impl Into<String>) -> Self {
        ChatError::EmptyField { field_name: field_name.into() }
    }

    /// The server refused the session itself (bad or expired credential).
    /// Retrying with the same credential cannot succeed.
    pub fn is_policy_rejection(&self) -> bool {
        matches!(self, ChatError::HandshakeRejected { status: 401 | 403 })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::EmptyField { .. } | ChatError::InvalidUrl { .. })
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ChatError::ConnectFailed { .. } | ChatError::HandshakeRejected { .. } | ChatError::Transport(_)
        )
    }
}
