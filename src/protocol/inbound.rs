//! Inbound frame classification.
//!
//! The chat service multiplexes several payload shapes over one socket and
//! does not tag them consistently: moderation replies carry `type`, control
//! events carry `event`, chat messages carry neither and may be nested under
//! `payload`, and older servers send moderation replies as bare text.
//! [`decode`] resolves them in a fixed order:
//!
//! 1. JSON parse; on failure, the legacy plain-text moderation heuristic.
//! 2. `type` tag (`violation`, `typing`).
//! 3. `event` tag (`TYPING`, `TITLE_UPDATED`, `DONE`, `FILE_UPLOADED`).
//! 4. Structural `{role, content, timestamp}`, top level or under `payload`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::debug;

use crate::models::{MessageRole, ViolationLevel};
use crate::violations::{has_moderation_marker, level_from_text};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatFrame {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ViolationNotice {
    pub message: String,
    pub level: ViolationLevel,
    pub ban_seconds: u64,
    pub id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ViolationNotice {
    /// Builds a notice from message text alone, reading severity from its
    /// duration phrase.
    pub fn from_text(message: impl Into<String>, timestamp: Option<DateTime<Utc>>) -> Self {
        let message = message.into();
        let level = level_from_text(&message);
        Self { ban_seconds: level.lockout_seconds(), level, message, id: None, timestamp }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Chat(ChatFrame),
    Typing,
    TitleUpdated { title: String },
    Violation(ViolationNotice),
    StreamDone,
    /// File analysis was removed server-side; kept so the event decodes
    /// without being reported as malformed.
    FileUploaded,
}

/// Loose view over every known inbound shape. Unknown fields are ignored and
/// a field of the wrong type reads as absent instead of failing the frame.
#[derive(Debug, Default, Deserialize)]
struct RawFrame {
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    event: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    title: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    message: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    level: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    ban_time: Option<u64>,
    #[serde(default, deserialize_with = "lenient_string")]
    role: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    content: Option<String>,
    timestamp: Option<Value>,
    id: Option<Value>,
    #[serde(default, deserialize_with = "lenient_payload")]
    payload: Option<RawPayload>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPayload {
    #[serde(default, deserialize_with = "lenient_string")]
    role: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    content: Option<String>,
    timestamp: Option<Value>,
    id: Option<Value>,
}

/// Strings as-is; numbers and booleans in their JSON spelling.
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Some(v.to_string()),
        _ => None,
    })
}

/// Non-negative integers, also when sent as floats or numeric strings.
fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().or_else(|| {
            n.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64)
        }),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_payload<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<RawPayload>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(value @ Value::Object(_)) => serde_json::from_value(value).ok(),
        _ => None,
    })
}

/// Classifies one raw text payload. Returns `None` for anything that is not
/// a recognisable frame; never panics on garbage.
pub fn decode(raw: &str) -> Option<InboundFrame> {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return decode_legacy(raw),
    };

    let object = match value {
        Value::Object(_) => value,
        Value::String(text) => return decode_legacy(&text),
        other => {
            debug!("Dropping non-object frame: {other}");
            return None;
        }
    };

    let frame: RawFrame = match serde_json::from_value(object) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Dropping malformed frame: {e}");
            return None;
        }
    };

    decode_structured(frame)
}

fn decode_legacy(text: &str) -> Option<InboundFrame> {
    if has_moderation_marker(text) {
        Some(InboundFrame::Violation(ViolationNotice::from_text(text.trim(), None)))
    } else {
        debug!("Dropping undecodable frame ({} bytes)", text.len());
        None
    }
}

fn decode_structured(frame: RawFrame) -> Option<InboundFrame> {
    if frame.kind.as_deref() == Some("violation") {
        return Some(InboundFrame::Violation(violation_from(frame)));
    }
    if frame.kind.as_deref() == Some("typing") {
        return Some(InboundFrame::Typing);
    }

    match frame.event.as_deref() {
        Some("TYPING") => return Some(InboundFrame::Typing),
        Some("TITLE_UPDATED") => {
            return match frame.title {
                Some(title) if !title.trim().is_empty() => {
                    Some(InboundFrame::TitleUpdated { title: title.trim().to_string() })
                }
                _ => {
                    debug!("TITLE_UPDATED without a title");
                    None
                }
            };
        }
        Some("DONE") => return Some(InboundFrame::StreamDone),
        Some("FILE_UPLOADED") => return Some(InboundFrame::FileUploaded),
        Some(other) => {
            debug!("Unknown event '{other}', trying message shape");
        }
        None => {}
    }

    let payload = frame.payload.unwrap_or_default();
    let role = frame.role.or(payload.role)?;
    let role = match MessageRole::try_from(role.as_str()) {
        Ok(role) => role,
        Err(e) => {
            debug!("Dropping frame: {e}");
            return None;
        }
    };
    let content = frame.content.filter(|c| !c.is_empty()).or(payload.content).unwrap_or_default();
    let timestamp = frame.timestamp.or(payload.timestamp).as_ref().and_then(parse_timestamp);
    let id = frame.id.or(payload.id).as_ref().and_then(id_string);

    // Informational only: the lockout itself arrives as a `violation` frame.
    if role == MessageRole::System && is_moderation_reply(&content) {
        return Some(InboundFrame::Violation(ViolationNotice {
            message: content,
            level: ViolationLevel::Warning,
            ban_seconds: 0,
            id,
            timestamp,
        }));
    }

    Some(InboundFrame::Chat(ChatFrame { role, content, timestamp, id }))
}

/// System messages the server sends to an already-banned or warned user.
fn is_moderation_reply(content: &str) -> bool {
    content.contains("Cảnh báo") || content.contains("bị cấm chat")
}

fn violation_from(frame: RawFrame) -> ViolationNotice {
    let message = frame.message.or(frame.content).unwrap_or_default();
    let level = match frame.level {
        Some(level) => ViolationLevel::from_level(level),
        None => level_from_text(&message),
    };
    ViolationNotice {
        ban_seconds: frame.ban_time.unwrap_or_else(|| level.lockout_seconds()),
        level,
        message,
        id: frame.id.as_ref().and_then(id_string),
        timestamp: frame.timestamp.as_ref().and_then(parse_timestamp),
    }
}

fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Accepts RFC 3339, naive ISO-8601 (read as UTC) and epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.with_timezone(&Utc));
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f") {
                return Some(naive.and_utc());
            }
            s.parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        }
        _ => None,
    }
}
