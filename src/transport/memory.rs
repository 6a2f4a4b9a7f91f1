//! In-process transport. Each `connect` hands the server side of the pipe
//! to whoever holds the peer receiver, which lets tests (and embedders
//! without a network) script the chat service.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use url::Url;

use crate::errors::ChatError;
use crate::transport::{Connector, Transport, TransportEvent, ABNORMAL_CLOSURE};

/// What the client wrote, as seen by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    Text(String),
    Close { code: u16, reason: String },
}

#[derive(Clone)]
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<MemoryPeer>,
    refusals: Arc<Mutex<VecDeque<ChatError>>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (accepted, peers) = mpsc::unbounded_channel();
        (Self { accepted, refusals: Arc::new(Mutex::new(VecDeque::new())) }, peers)
    }

    /// Makes the next connect attempt fail with `error`.
    pub async fn refuse_next(&self, error: ChatError) {
        self.refusals.lock().await.push_back(error);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ChatError> {
        if let Some(error) = self.refusals.lock().await.pop_front() {
            return Err(error);
        }

        let (to_client, from_peer) = mpsc::unbounded_channel();
        let (to_peer, from_client) = mpsc::unbounded_channel();
        let peer = MemoryPeer { url: url.clone(), to_client, from_client };
        self.accepted
            .send(peer)
            .map_err(|_| ChatError::ConnectFailed { url: url.to_string(), message: "no listener".into() })?;

        Ok(Box::new(MemoryTransport { to_peer, from_peer }))
    }
}

struct MemoryTransport {
    to_peer: mpsc::UnboundedSender<ClientFrame>,
    from_peer: mpsc::UnboundedReceiver<TransportEvent>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        self.to_peer
            .send(ClientFrame::Text(text))
            .map_err(|_| ChatError::Transport("peer went away".into()))
    }

    async fn recv(&mut self) -> TransportEvent {
        self.from_peer.recv().await.unwrap_or(TransportEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: "peer dropped".into(),
        })
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let _ = self.to_peer.send(ClientFrame::Close { code, reason: reason.to_string() });
    }
}

/// Server side of one in-memory connection.
pub struct MemoryPeer {
    pub url: Url,
    to_client: mpsc::UnboundedSender<TransportEvent>,
    from_client: mpsc::UnboundedReceiver<ClientFrame>,
}

impl MemoryPeer {
    /// The `token` query parameter the client connected with.
    pub fn token(&self) -> Option<String> {
        self.url.query_pairs().find(|(k, _)| k == "token").map(|(_, v)| v.into_owned())
    }

    /// Last path segment, i.e. the conversation id.
    pub fn conversation_id(&self) -> Option<String> {
        self.url.path_segments().and_then(|mut s| s.next_back()).map(str::to_string)
    }

    /// Returns false once the client side is gone.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(TransportEvent::Text(text.into())).is_ok()
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.to_client
            .send(TransportEvent::Closed { code, reason: reason.to_string() })
            .is_ok()
    }

    pub async fn recv(&mut self) -> Option<ClientFrame> {
        self.from_client.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        self.from_client.try_recv().ok()
    }
}
