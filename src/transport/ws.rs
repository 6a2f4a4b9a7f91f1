use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::errors::ChatError;
use crate::transport::{redacted, Connector, Transport, TransportEvent, ABNORMAL_CLOSURE, NO_STATUS_RECEIVED};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects over tokio-tungstenite (plain `ws://` or rustls `wss://`).
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn Transport>, ChatError> {
        let shown = redacted(url);
        match connect_async(url.as_str()).await {
            Ok((stream, response)) => {
                info!("Socket connected to {shown} (HTTP {})", response.status());
                Ok(Box::new(WsTransport { stream }))
            }
            Err(tungstenite::Error::Http(response)) => {
                let status = response.status().as_u16();
                warn!("Socket handshake to {shown} refused with HTTP {status}");
                Err(ChatError::HandshakeRejected { status })
            }
            Err(e) => Err(ChatError::ConnectFailed { url: shown, message: e.to_string() }),
        }
    }
}

struct WsTransport {
    stream: WsStream,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        self.stream
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| ChatError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> TransportEvent {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    warn!("Socket receive error: {e}");
                    return TransportEvent::Closed { code: ABNORMAL_CLOSURE, reason: e.to_string() };
                }
                None => {
                    return TransportEvent::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended without close frame".into(),
                    };
                }
            };

            match msg {
                WsMessage::Text(text) => return TransportEvent::Text(text.to_string()),
                WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return TransportEvent::Text(text),
                    Err(_) => debug!("Ignoring non-UTF-8 binary frame ({} bytes)", bytes.len()),
                },
                WsMessage::Close(frame) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    return TransportEvent::Closed { code, reason };
                }
                // Ping/pong are answered by tungstenite itself.
                _ => continue,
            }
        }
    }

    async fn close(&mut self, code: u16, reason: &str) {
        let frame = CloseFrame { code: CloseCode::from(code), reason: reason.to_string().into() };
        if let Err(e) = self.stream.close(Some(frame)).await {
            debug!("Socket close: {e}");
        }
    }
}
