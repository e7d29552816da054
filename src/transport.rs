//! Transport seam between the session and the network
//!
//! The session only needs to push and pull text; `WsConnector` does that over
//! a WebSocket and `memory` does it over in-process channels.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::client::{RelayError, RelayResult};
use crate::types::Endpoint;

/// An open, bidirectional text pipe
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, text: String) -> RelayResult<()>;

    /// Next inbound text message; `None` once the peer has closed.
    /// Must be cancel-safe, the session polls it inside `select!`.
    async fn recv(&mut self) -> Option<RelayResult<String>>;

    async fn close(&mut self);
}

/// Opens transports to an endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn Transport>>;
}

/// Default connector: plain or TLS WebSocket via tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn Transport>> {
        let (ws, response) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| RelayError::Connection(format!("WebSocket connect: {e}")))?;

        tracing::debug!(
            endpoint = %endpoint,
            status = %response.status(),
            "WebSocket handshake complete"
        );

        Ok(Box::new(WsTransport { ws }))
    }
}

struct WsTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, text: String) -> RelayResult<()> {
        self.ws
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<RelayResult<String>> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!("Dropping non-UTF-8 binary message");
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!("WebSocket closed by peer: {:?}", frame);
                    return None;
                }
                // Pings are answered by tungstenite on the next read/write
                Ok(_) => {}
                Err(e) => return Some(Err(RelayError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            tracing::debug!("WebSocket close: {}", e);
        }
    }
}

/// In-process transport pair, for tests and for embedding a client next to
/// a broker living in the same process.
pub mod memory {
    use super::*;
    use crate::protocol::{decode, Command, Frame};
    use tokio::sync::mpsc;

    /// Create a connector and the listener that receives its sessions
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (
            MemoryConnector {
                accept_tx,
                refusal: None,
            },
            MemoryListener { accept_rx },
        )
    }

    #[derive(Debug, Clone)]
    pub struct MemoryConnector {
        accept_tx: mpsc::UnboundedSender<MemoryPeer>,
        refusal: Option<String>,
    }

    impl MemoryConnector {
        /// A connector whose every `open` fails with `reason`
        pub fn refusing(reason: impl Into<String>) -> Self {
            let (accept_tx, _) = mpsc::unbounded_channel();
            Self {
                accept_tx,
                refusal: Some(reason.into()),
            }
        }
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        async fn open(&self, endpoint: &Endpoint) -> RelayResult<Box<dyn Transport>> {
            if let Some(reason) = &self.refusal {
                return Err(RelayError::Connection(reason.clone()));
            }

            let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
            let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();

            let peer = MemoryPeer {
                endpoint: endpoint.clone(),
                outgoing: Some(to_client_tx),
                incoming: to_peer_rx,
            };
            self.accept_tx
                .send(peer)
                .map_err(|_| RelayError::Connection("connection refused".to_string()))?;

            Ok(Box::new(MemoryTransport {
                incoming: to_client_rx,
                outgoing: Some(to_peer_tx),
            }))
        }
    }

    #[derive(Debug)]
    pub struct MemoryListener {
        accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
    }

    impl MemoryListener {
        pub async fn accept(&mut self) -> Option<MemoryPeer> {
            self.accept_rx.recv().await
        }

        pub fn try_accept(&mut self) -> Option<MemoryPeer> {
            self.accept_rx.try_recv().ok()
        }
    }

    /// The server side of one in-memory session
    #[derive(Debug)]
    pub struct MemoryPeer {
        endpoint: Endpoint,
        outgoing: Option<mpsc::UnboundedSender<RelayResult<String>>>,
        incoming: mpsc::UnboundedReceiver<String>,
    }

    impl MemoryPeer {
        pub fn endpoint(&self) -> &Endpoint {
            &self.endpoint
        }

        pub fn send_text(&self, text: impl Into<String>) -> bool {
            match &self.outgoing {
                Some(tx) => tx.send(Ok(text.into())).is_ok(),
                None => false,
            }
        }

        pub fn send_frame(&self, frame: &Frame) -> bool {
            self.send_text(frame.encode())
        }

        /// Deliver a transport-level error to the client
        pub fn fail(&self, reason: impl Into<String>) -> bool {
            match &self.outgoing {
                Some(tx) => tx.send(Err(RelayError::Transport(reason.into()))).is_ok(),
                None => false,
            }
        }

        /// Close the server side; the client sees end of stream
        pub fn close(&mut self) {
            self.outgoing = None;
        }

        /// Next raw text from the client; `None` once it has closed
        pub async fn recv_text(&mut self) -> Option<String> {
            self.incoming.recv().await
        }

        /// Next frame from the client, skipping heart-beats
        pub async fn recv_frame(&mut self) -> Option<Frame> {
            loop {
                let text = self.recv_text().await?;
                match decode(&text) {
                    Ok(mut frames) if !frames.is_empty() => return Some(frames.remove(0)),
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!("Peer received undecodable text: {}", e);
                        return None;
                    }
                }
            }
        }

        /// Read CONNECT and answer with a STOMP 1.2 CONNECTED, heart-beats off
        pub async fn accept_stomp(&mut self) -> Option<Frame> {
            let reply = Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", "0,0");
            self.accept_stomp_with(reply).await
        }

        /// Read CONNECT and answer with `reply`
        pub async fn accept_stomp_with(&mut self, reply: Frame) -> Option<Frame> {
            let connect = self.recv_frame().await?;
            if connect.command != Command::Connect {
                return None;
            }
            self.send_frame(&reply);
            Some(connect)
        }
    }

    struct MemoryTransport {
        incoming: mpsc::UnboundedReceiver<RelayResult<String>>,
        outgoing: Option<mpsc::UnboundedSender<String>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&mut self, text: String) -> RelayResult<()> {
            let tx = self
                .outgoing
                .as_ref()
                .ok_or_else(|| RelayError::Transport("transport closed".to_string()))?;
            tx.send(text)
                .map_err(|_| RelayError::Transport("peer closed".to_string()))
        }

        async fn recv(&mut self) -> Option<RelayResult<String>> {
            self.incoming.recv().await
        }

        async fn close(&mut self) {
            self.outgoing = None;
        }
    }
}
