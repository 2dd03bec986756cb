//! Links between the gateway client and a server session.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

use super::{
    events::{ClientEvent, ServerEvent},
    session::Session,
};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("connection closed")]
    Closed,

    #[error("malformed frame: {0}")]
    Protocol(String),
}

/// Opens links to the server. Each call is one connection attempt.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn TransportLink>, TransportError>;
}

/// An open connection. `recv` returns `None` once the peer has closed and
/// must be safe to cancel.
#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Option<Result<ServerEvent, TransportError>>;

    async fn close(&mut self);
}

/// JSON frames over a WebSocket.
pub struct WebSocketTransport {
    url: String,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!("WebSocket connected to {}", self.url);
        Ok(Box::new(WebSocketLink { ws }))
    }
}

struct WebSocketLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportLink for WebSocketLink {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
        let json =
            serde_json::to_string(event).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<ServerEvent, TransportError>> {
        loop {
            let frame = match self.ws.next().await? {
                Ok(Message::Text(text)) => serde_json::from_str(&text),
                Ok(Message::Binary(data)) => serde_json::from_slice(&data),
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return Some(Err(TransportError::Closed)),
            };
            return Some(frame.map_err(|e| TransportError::Protocol(e.to_string())));
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// In-process link that runs a server [`Session`] on the other end of a
/// pair of channels.
#[derive(Clone)]
pub struct LocalTransport {
    session: Session,
}

impl LocalTransport {
    pub fn new(session: Session) -> Self {
        Self { session }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn open(&self) -> Result<Box<dyn TransportLink>, TransportError> {
        let (client_tx, server_rx) = mpsc::unbounded_channel();
        let (server_tx, client_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.session.clone().run(server_rx, server_tx));

        Ok(Box::new(LocalLink {
            tx: Some(client_tx),
            rx: client_rx,
        }))
    }
}

struct LocalLink {
    tx: Option<mpsc::UnboundedSender<ClientEvent>>,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

#[async_trait]
impl TransportLink for LocalLink {
    async fn send(&mut self, event: &ClientEvent) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(event.clone()).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<ServerEvent, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.tx = None;
        self.rx.close();
    }
}
