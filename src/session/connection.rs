use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::ReconnectPolicy;
use crate::errors::ChatError;
use crate::transport::ABNORMAL_CLOSURE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseOutcome {
    /// A reconnect is scheduled.
    Reconnecting,
    /// The server refused the session; the caller must re-authenticate.
    Rejected,
    /// The reconnect attempt cap was reached.
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
    Closed(CloseOutcome),
}

/// Lifecycle of the transport bound to the current conversation.
///
/// ```text
/// Disconnected ─open─▶ Connecting ─handshake─▶ Open ─close─▶ Closing ─▶ Disconnected
///                          │                    │
///                          └──── failure ───────┴──▶ Closed(Reconnecting) ─timer─▶ Connecting
///                                                    Closed(Rejected | Exhausted)
/// ```
#[derive(Debug)]
pub struct Connection {
    state: ConnectionState,
    retry_count: u32,
    policy: ReconnectPolicy,
    policy_close_code: u16,
}

impl Connection {
    pub fn new(policy: ReconnectPolicy, policy_close_code: u16) -> Self {
        Self { state: ConnectionState::Disconnected, retry_count: 0, policy, policy_close_code }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Returns false if a connection attempt is not allowed from the
    /// current state.
    pub fn begin_connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Closed(CloseOutcome::Reconnecting) => {
                self.state = ConnectionState::Connecting;
                true
            }
            other => {
                warn!("Ignoring connect request while {other:?}");
                false
            }
        }
    }

    pub fn on_open(&mut self) {
        if self.retry_count > 0 {
            info!("Reconnected after {} attempt(s)", self.retry_count);
        }
        self.state = ConnectionState::Open;
        self.retry_count = 0;
    }

    /// Records a closure not initiated by this client. Returns the delay
    /// before the next attempt, or `None` when no reconnect should happen.
    pub fn on_closed(&mut self, code: u16) -> Option<Duration> {
        if code == self.policy_close_code {
            warn!("Session rejected by server (close code {code}); not reconnecting");
            self.state = ConnectionState::Closed(CloseOutcome::Rejected);
            return None;
        }

        self.retry_count += 1;
        match self.policy.delay_for(self.retry_count) {
            Some(delay) => {
                info!(
                    "Connection closed (code {code}); reconnecting in {}ms (attempt {})",
                    delay.as_millis(),
                    self.retry_count
                );
                self.state = ConnectionState::Closed(CloseOutcome::Reconnecting);
                Some(delay)
            }
            None => {
                warn!("Giving up after {} reconnect attempt(s)", self.retry_count - 1);
                self.state = ConnectionState::Closed(CloseOutcome::Exhausted);
                None
            }
        }
    }

    /// A handshake failure counts as a closure; HTTP 401/403 counts as a
    /// policy rejection.
    pub fn on_connect_failed(&mut self, error: &ChatError) -> Option<Duration> {
        if error.is_policy_rejection() {
            self.on_closed(self.policy_close_code)
        } else {
            self.on_closed(ABNORMAL_CLOSURE)
        }
    }

    pub fn begin_close(&mut self) {
        self.state = ConnectionState::Closing;
    }

    pub fn reset(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.retry_count = 0;
    }
}
