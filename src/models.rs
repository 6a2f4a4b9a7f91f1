use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(id: String, title: String) -> Self {
        let now = Utc::now();
        Self { id, title, created_at: now, updated_at: now }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for MessageRole {
    type Error = String;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// A finalized chat entry. Never mutated after it has been appended to a
/// conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(conversation_id: String, role: MessageRole, content: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id,
            role,
            content,
            created_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: Option<String>) -> Self {
        if let Some(id) = id {
            self.id = id;
        }
        self
    }

    pub fn at(mut self, created_at: Option<DateTime<Utc>>) -> Self {
        if let Some(ts) = created_at {
            self.created_at = ts;
        }
        self
    }
}

/// Moderation severity. The numeric value is the `level` field on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ViolationLevel {
    Warning = 1,
    FiveMinutes = 2,
    OneHour = 3,
    OneDay = 4,
}

impl ViolationLevel {
    /// Unknown levels collapse to a warning; anything above 4 is the longest ban.
    pub fn from_level(level: u64) -> Self {
        match level {
            0 | 1 => ViolationLevel::Warning,
            2 => ViolationLevel::FiveMinutes,
            3 => ViolationLevel::OneHour,
            _ => ViolationLevel::OneDay,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn lockout_seconds(self) -> u64 {
        match self {
            ViolationLevel::Warning => 0,
            ViolationLevel::FiveMinutes => 300,
            ViolationLevel::OneHour => 3600,
            ViolationLevel::OneDay => 86_400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub message: String,
    pub level: ViolationLevel,
    pub ban_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BanState {
    pub is_banned: bool,
    pub banned_until: Option<DateTime<Utc>>,
}

/// Transient alert shown for a violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub id: String,
    pub message: String,
    pub severity: ViolationLevel,
}
