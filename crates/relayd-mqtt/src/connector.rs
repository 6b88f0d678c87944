//! Byte-level links to the broker.
//!
//! A [`Connector`] opens one physical connection per call and hands back a
//! [`Link`] that moves opaque binary chunks. MQTT framing happens above this
//! layer, so chunks need not align with packet boundaries.
//!
//! ```text
//! Session / one-shot client      Connector              Broker
//! ┌──────────────────┐   bytes   ┌─────────────┐  WS    ┌────────┐
//! │  MQTT framing    │──────────▶│ WsConnector │───────▶│        │
//! │  (codec.rs)      │◀──────────│ MemoryLink  │◀───────│        │
//! └──────────────────┘           └─────────────┘        └────────┘
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::error::{MqttError, Result};

/// Opens physical connections to the broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Human-readable endpoint, used in logs.
    fn endpoint(&self) -> &str;

    async fn open(&self) -> Result<Box<dyn Link>>;
}

/// One open, bidirectional binary channel.
#[async_trait]
pub trait Link: Send {
    async fn send(&mut self, chunk: Bytes) -> Result<()>;

    /// Next inbound chunk, or `None` once the peer closed. Cancel safe.
    async fn recv(&mut self) -> Option<Result<Bytes>>;

    async fn close(&mut self);
}

/// MQTT over WebSocket (`ws://` or `wss://`), subprotocol `mqtt`.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn open(&self) -> Result<Box<dyn Link>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| MqttError::Transport(format!("invalid broker url {}: {}", self.url, e)))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| MqttError::Transport(format!("WebSocket connect failed: {}", e)))?;
        debug!(url = %self.url, status = %response.status(), "WebSocket opened");

        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Link for WsLink {
    async fn send(&mut self, chunk: Bytes) -> Result<()> {
        self.stream
            .send(Message::Binary(chunk.to_vec()))
            .await
            .map_err(|e| MqttError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Bytes>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Binary(data)) => return Some(Ok(Bytes::from(data))),
                // Some brokers send text frames; the bytes are the same.
                Ok(Message::Text(text)) => return Some(Ok(Bytes::from(text.into_bytes()))),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(MqttError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!(error = %e, "WebSocket close failed");
        }
    }
}

/// In-process links backed by channels.
///
/// The broker side of every opened link is delivered through
/// [`MemoryBroker::accept`], which lets tests play the broker.
pub mod memory {
    use super::*;
    use tokio::sync::mpsc;

    /// Broker end of one in-memory connection.
    pub struct MemoryPeer {
        /// Chunks written by the client
        pub inbound: mpsc::UnboundedReceiver<Bytes>,
        /// Chunks delivered to the client; dropping it closes the link
        pub outbound: mpsc::UnboundedSender<Bytes>,
    }

    pub struct MemoryConnector {
        accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    }

    pub struct MemoryBroker {
        accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    }

    impl MemoryBroker {
        /// Wait for the client to open the next connection.
        pub async fn accept(&mut self) -> Option<MemoryPeer> {
            self.accept_rx.recv().await
        }
    }

    /// Create a connector together with the broker side that accepts it.
    pub fn pair() -> (MemoryConnector, MemoryBroker) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (MemoryConnector { accept_tx }, MemoryBroker { accept_rx })
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        fn endpoint(&self) -> &str {
            "memory://broker"
        }

        async fn open(&self) -> Result<Box<dyn Link>> {
            let (to_broker, inbound) = mpsc::unbounded_channel();
            let (outbound, from_broker) = mpsc::unbounded_channel();
            self.accept_tx
                .send(MemoryPeer { inbound, outbound })
                .map_err(|_| MqttError::Transport("memory broker is gone".into()))?;
            Ok(Box::new(MemoryLink {
                tx: Some(to_broker),
                rx: from_broker,
            }))
        }
    }

    struct MemoryLink {
        tx: Option<mpsc::UnboundedSender<Bytes>>,
        rx: mpsc::UnboundedReceiver<Bytes>,
    }

    #[async_trait]
    impl Link for MemoryLink {
        async fn send(&mut self, chunk: Bytes) -> Result<()> {
            let tx = self.tx.as_ref().ok_or(MqttError::ConnectionClosed)?;
            tx.send(chunk)
                .map_err(|_| MqttError::Transport("memory peer closed".into()))
        }

        async fn recv(&mut self) -> Option<Result<Bytes>> {
            self.rx.recv().await.map(Ok)
        }

        async fn close(&mut self) {
            self.tx = None;
            self.rx.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory;
    use super::*;

    #[tokio::test]
    async fn test_memory_link_moves_chunks_both_ways() {
        let (connector, mut broker) = memory::pair();
        let mut link = connector.open().await.unwrap();
        let mut peer = broker.accept().await.unwrap();

        link.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(peer.inbound.recv().await.unwrap().as_ref(), b"ping");

        peer.outbound.send(Bytes::from_static(b"pong")).unwrap();
        assert_eq!(link.recv().await.unwrap().unwrap().as_ref(), b"pong");

        drop(peer);
        assert!(link.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_memory_open_fails_without_broker() {
        let (connector, broker) = memory::pair();
        drop(broker);
        assert!(matches!(
            connector.open().await,
            Err(MqttError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_ws_connector_rejects_bad_url() {
        let connector = WsConnector::new("not a url");
        assert!(matches!(
            connector.open().await,
            Err(MqttError::Transport(_))
        ));
    }
}
