use std::str::FromStr;
use std::time::Duration;

use crate::errors::ChatError;

/// Close code the chat service uses to reject a session (bad/expired token,
/// conversation not owned by the caller).
pub const POLICY_VIOLATION_CLOSE_CODE: u16 = 1008;

/// How the client retries after an abnormal closure.
///
/// The defaults reproduce the behaviour the chat front-end shipped with: a
/// fixed 3 s delay, no growth, no attempt cap.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(3000),
            multiplier: 1.0,
            max_delay: Duration::from_secs(60),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (1-based), or `None`
    /// once the cap is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt > max {
                return None;
            }
        }
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64().max(self.base_delay.as_secs_f64()));
        Some(Duration::from_secs_f64(capped))
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Socket endpoint prefix; the conversation id is appended as a path segment.
    pub ws_base_url: String,
    pub reconnect: ReconnectPolicy,
    pub policy_close_code: u16,
    pub stream_idle_flush: Duration,
    pub typing_interval: Duration,
    pub remote_typing_ttl: Duration,
    pub notification_ttl: Duration,
    /// How long a local optimistic echo waits to absorb the server echo.
    pub echo_window: Duration,
    pub command_buffer: usize,
    pub event_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:9003/api/chatbot_service/ws".to_string(),
            reconnect: ReconnectPolicy::default(),
            policy_close_code: POLICY_VIOLATION_CLOSE_CODE,
            stream_idle_flush: Duration::from_millis(2000),
            typing_interval: Duration::from_millis(1000),
            remote_typing_ttl: Duration::from_millis(2000),
            notification_ttl: Duration::from_millis(5000),
            echo_window: Duration::from_secs(10),
            command_buffer: 64,
            event_buffer: 256,
        }
    }
}

impl ClientConfig {
    /// Reads overrides from the process environment. Call
    /// `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ChatError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ChatError> {
        let mut config = Self::default();

        if let Some(url) = lookup("CHAT_WS_BASE_URL") {
            config.ws_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHAT_RECONNECT_DELAY_MS")? {
            config.reconnect.base_delay = Duration::from_millis(ms);
        }
        if let Some(factor) = parse_var::<f64>(&lookup, "CHAT_RECONNECT_BACKOFF")? {
            if !factor.is_finite() || factor < 1.0 {
                return Err(ChatError::Config(format!(
                    "CHAT_RECONNECT_BACKOFF must be >= 1.0 (got {factor})"
                )));
            }
            config.reconnect.multiplier = factor;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "CHAT_RECONNECT_MAX_DELAY_MS")? {
            config.reconnect.max_delay = Duration::from_millis(ms);
        }
        if let Some(max) = parse_var::<u32>(&lookup, "CHAT_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = Some(max);
        }
        if let Some(code) = parse_var::<u16>(&lookup, "CHAT_POLICY_CLOSE_CODE")? {
            config.policy_close_code = code;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ChatError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ChatError::Config(format!("{key} has an invalid value '{raw}'"))),
    }
}
