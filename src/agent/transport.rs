use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::fmt;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};

/// Transport-level failures, reduced to what the agent cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Connect(String),
    Io(String),
    Closed,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Connect(e) => write!(f, "connect failed: {}", e),
            TransportError::Io(e) => write!(f, "transport error: {}", e),
            TransportError::Closed => write!(f, "transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A duplex text-frame channel to the broker. The agent never touches the
/// socket type directly, so the whole connection state machine runs
/// unchanged against an in-memory fake in tests.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;
    /// Next inbound text frame; `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
    async fn close(&mut self);
}

/// Opens transports. One connector is reused across reconnect attempts.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError>;
}

/// Production connector over tokio-tungstenite.
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>, TransportError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsTransport { inner: stream }))
    }
}

struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

#[async_trait]
impl Transport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        self.inner
            .send(Message::Text(frame))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => continue,
                },
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.inner.send(Message::Pong(payload)).await {
                        return Some(Err(TransportError::Io(e.to_string())));
                    }
                }
                Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => return Some(Err(TransportError::Io(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// In-memory transport half handed to the agent.
    pub struct FakeTransport {
        to_peer: mpsc::UnboundedSender<String>,
        from_peer: mpsc::UnboundedReceiver<String>,
    }

    /// The test's half: inject frames with `send`, observe the agent's
    /// frames with `recv`/`try_recv`. Dropping the peer simulates an
    /// unclean close.
    pub struct FakePeer {
        pub to_agent: mpsc::UnboundedSender<String>,
        pub from_agent: mpsc::UnboundedReceiver<String>,
    }

    impl FakePeer {
        pub fn send(&self, frame: impl Into<String>) {
            let _ = self.to_agent.send(frame.into());
        }

        pub async fn recv(&mut self) -> Option<String> {
            self.from_agent.recv().await
        }

        pub fn try_recv(&mut self) -> Option<String> {
            self.from_agent.try_recv().ok()
        }
    }

    pub fn pair() -> (FakeTransport, FakePeer) {
        let (agent_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, agent_rx) = mpsc::unbounded_channel();
        (
            FakeTransport {
                to_peer: agent_tx,
                from_peer: agent_rx,
            },
            FakePeer {
                to_agent: peer_tx,
                from_agent: peer_rx,
            },
        )
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send(&mut self, frame: String) -> Result<(), TransportError> {
            self.to_peer.send(frame).map_err(|_| TransportError::Closed)
        }

        async fn recv(&mut self) -> Option<Result<String, TransportError>> {
            self.from_peer.recv().await.map(Ok)
        }

        async fn close(&mut self) {}
    }

    /// Connector with a scripted sequence of attempt outcomes. Successful
    /// attempts surface their peer half on `peers`.
    pub struct ScriptedConnector {
        outcomes: Mutex<VecDeque<bool>>,
        peers: mpsc::UnboundedSender<FakePeer>,
        pub attempts: std::sync::atomic::AtomicU32,
    }

    impl ScriptedConnector {
        pub fn new(outcomes: Vec<bool>) -> (Self, mpsc::UnboundedReceiver<FakePeer>) {
            let (peers_tx, peers_rx) = mpsc::unbounded_channel();
            (
                Self {
                    outcomes: Mutex::new(outcomes.into()),
                    peers: peers_tx,
                    attempts: std::sync::atomic::AtomicU32::new(0),
                },
                peers_rx,
            )
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, TransportError> {
            self.attempts
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let succeed = self.outcomes.lock().unwrap().pop_front().unwrap_or(false);
            if !succeed {
                return Err(TransportError::Connect("connection refused".to_string()));
            }
            let (transport, peer) = pair();
            let _ = self.peers.send(peer);
            Ok(Box::new(transport))
        }
    }
}
