//! Raw byte transport underneath the [`super::DuplexChannel`] protocol
//! layer. `WebSocketTransport` is the real implementation; `LoopbackTransport`
//! is an in-process stand-in used by tests (the "thin wire client" itself
//! is out of scope per spec §1 — only the reconnect/heartbeat/batching
//! logic built on top of it is).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::error::{Result, StoreError};

/// A bare duplex byte stream. The [`super::DuplexChannel`] frames
/// [`super::protocol::WireMessage`]s as JSON over this.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, data: Vec<u8>) -> Result<()>;
    /// Returns `Ok(None)` when the peer closed the connection normally.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;
    async fn close(&self) -> Result<()>;
}

/// A real WebSocket client connection, used when `StoreConfig::ws_endpoint`
/// points at a live server.
pub struct WebSocketTransport {
    inner: Mutex<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>,
}

impl WebSocketTransport {
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let url = url::Url::parse(endpoint).map_err(|e| StoreError::TransportError(format!("invalid ws endpoint: {e}")))?;
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(StoreError::TransportError(format!("unsupported ws scheme: {}", url.scheme())));
        }
        let (stream, _response) = connect_async(url)
            .await
            .map_err(|e| StoreError::TransportError(e.to_string()))?;
        Ok(Self {
            inner: Mutex::new(stream),
        })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        let text = String::from_utf8(data).map_err(|e| StoreError::TransportError(e.to_string()))?;
        self.inner
            .lock()
            .await
            .send(TungsteniteMessage::Text(text.into()))
            .await
            .map_err(|e| StoreError::TransportError(e.to_string()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut guard = self.inner.lock().await;
        loop {
            match guard.next().await {
                Some(Ok(TungsteniteMessage::Text(text))) => return Ok(Some(text.as_bytes().to_vec())),
                Some(Ok(TungsteniteMessage::Binary(bytes))) => return Ok(Some(bytes.to_vec())),
                Some(Ok(TungsteniteMessage::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/frame control handled by tungstenite itself
                Some(Err(e)) => return Err(StoreError::TransportError(e.to_string())),
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .lock()
            .await
            .close(None)
            .await
            .map_err(|e| StoreError::TransportError(e.to_string()))
    }
}

/// An in-process transport backed by a pair of channels, for tests that
/// exercise reconnect/heartbeat/batching logic without a live socket.
pub struct LoopbackTransport {
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    inbox: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

impl LoopbackTransport {
    /// Returns a connected pair: `(client, peer_outbox, peer_inbox)` where
    /// the test drives `peer_outbox`/`peer_inbox` to play the role of the
    /// remote server.
    pub fn pair() -> (Self, mpsc::UnboundedSender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbox: to_peer_tx,
                inbox: Mutex::new(to_client_rx),
            },
            to_client_tx,
            to_peer_rx,
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send(&self, data: Vec<u8>) -> Result<()> {
        self.outbox
            .send(data)
            .map_err(|_| StoreError::TransportError("loopback peer dropped".into()))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.inbox.lock().await.recv().await)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_rejects_malformed_endpoint() {
        let err = WebSocketTransport::connect("not a url").await.unwrap_err();
        assert!(matches!(err, StoreError::TransportError(_)));
    }

    #[tokio::test]
    async fn connect_rejects_non_ws_scheme() {
        let err = WebSocketTransport::connect("https://example.com").await.unwrap_err();
        assert!(matches!(err, StoreError::TransportError(_)));
    }
}
