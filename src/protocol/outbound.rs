use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;

use crate::errors::ChatError;

/// Frames the client sends. Internally tagged on `action`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action")]
pub enum OutboundCommand {
    #[serde(rename = "sendMessage")]
    SendMessage { content: String },
    #[serde(rename = "typing")]
    Typing,
    #[serde(rename = "file_upload")]
    FileUpload { file_info: Value },
}

impl OutboundCommand {
    pub fn encode(&self) -> Result<String, ChatError> {
        serde_json::to_string(self).map_err(ChatError::Encode)
    }
}

/// Lets at most one typing ping through per window. Drops are silent.
#[derive(Debug)]
pub struct TypingLimiter {
    window: Duration,
    last_sent: Option<Instant>,
}

impl TypingLimiter {
    pub fn new(window: Duration) -> Self {
        Self { window, last_sent: None }
    }

    /// Returns true and starts a new window when a ping may be sent at `now`.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let open = match self.last_sent {
            Some(last) => now.saturating_duration_since(last) > self.window,
            None => true,
        };
        if open {
            self.last_sent = Some(now);
        }
        open
    }

    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}
