pub mod memory;
pub mod ws;

use async_trait::async_trait;
use url::Url;

use crate::errors::ChatError;

pub use memory::{ClientFrame, MemoryConnector, MemoryPeer};
pub use ws::WsConnector;

pub const NORMAL_CLOSURE: u16 = 1000;
pub const NO_STATUS_RECEIVED: u16 = 1005;
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Text(String),
    /// Terminal: nothing else is delivered after this.
    Closed { code: u16, reason: String },
}

/// One open, message-oriented, full-duplex connection.
#[async_trait]
pub trait Transport: Send {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError>;

    async fn recv(&mut self) -> TransportEvent;

    /// Client-initiated close. Best effort; errors are swallowed.
    async fn close(&mut self, code: u16, reason: &str);
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ChatError>;
}

/// `{base}/{conversation_id}?token={credential}`.
pub fn session_url(base: &str, conversation_id: &str, credential: &str) -> Result<Url, ChatError> {
    let invalid = |message: String| ChatError::InvalidUrl { url: base.to_string(), message };

    let mut url = Url::parse(base).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    url.path_segments_mut()
        .map_err(|_| invalid("URL cannot carry a path".to_string()))?
        .pop_if_empty()
        .push(conversation_id);
    url.query_pairs_mut().clear().append_pair("token", credential);
    Ok(url)
}

/// The URL without its query string, safe to log.
pub fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    shown.set_query(None);
    shown.to_string()
}
