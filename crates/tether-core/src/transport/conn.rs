//! Connection abstraction over the relay link
//!
//! The session loop drives a [`Conn`], never a websocket directly. Production
//! uses [`WsConnector`]; tests use [`ChannelConnector`] to script the relay
//! side without a network.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::wire::{ClientFrame, ServerFrame};

/// One live duplex connection to the relay
#[async_trait]
pub trait Conn: Send {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError>;

    /// Next inbound frame; `None` when the connection is gone
    async fn recv(&mut self) -> Option<Result<ServerFrame, TransportError>>;

    async fn close(&mut self);
}

/// Dials new connections; injected so tests never open sockets
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Conn>, TransportError>;
}

/// Websocket connector used in production
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Conn>, TransportError> {
        debug!(url, "dialing relay");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(Box::new(WsConn { ws }))
    }
}

struct WsConn {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Conn for WsConn {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        let text = frame.encode()?;
        self.ws.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<ServerFrame, TransportError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => match ServerFrame::decode(&text) {
                    Ok(frame) => return Some(Ok(frame)),
                    Err(e) => {
                        // A malformed frame is the relay's bug, not a reason
                        // to drop a healthy connection.
                        warn!(error = %e, "skipping malformed frame");
                        continue;
                    }
                },
                Ok(Message::Close(_)) => return Some(Err(TransportError::Closed)),
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(other) => {
                    warn!(kind = ?other, "ignoring unexpected websocket message");
                    continue;
                }
                Err(e) => return Some(Err(TransportError::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// In-process connection pair for tests
///
/// [`channel_conn`] builds the client half together with a [`RelayEnd`]
/// handle a test task drives as the scripted relay.
pub struct ChannelConn {
    tx: mpsc::UnboundedSender<ClientFrame>,
    rx: mpsc::UnboundedReceiver<ServerFrame>,
}

/// The relay side of a [`ChannelConn`]
pub struct RelayEnd {
    pub from_client: mpsc::UnboundedReceiver<ClientFrame>,
    pub to_client: mpsc::UnboundedSender<ServerFrame>,
}

/// Build a connected (client, relay) pair
pub fn channel_conn() -> (ChannelConn, RelayEnd) {
    let (client_tx, relay_rx) = mpsc::unbounded_channel();
    let (relay_tx, client_rx) = mpsc::unbounded_channel();
    (
        ChannelConn {
            tx: client_tx,
            rx: client_rx,
        },
        RelayEnd {
            from_client: relay_rx,
            to_client: relay_tx,
        },
    )
}

#[async_trait]
impl Conn for ChannelConn {
    async fn send(&mut self, frame: ClientFrame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<ServerFrame, TransportError>> {
        self.rx.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Connector that hands out pre-built [`ChannelConn`]s in order
///
/// Each reconnect consumes the next queued connection; when the queue is
/// empty, connects fail, which is how tests exercise the backoff path.
#[derive(Default)]
pub struct ChannelConnector {
    conns: Mutex<VecDeque<ChannelConn>>,
}

impl ChannelConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, conn: ChannelConn) {
        self.conns.lock().unwrap().push_back(conn);
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Conn>, TransportError> {
        match self.conns.lock().unwrap().pop_front() {
            Some(conn) => Ok(Box::new(conn)),
            None => Err(TransportError::Connect("no connection available".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_conn_roundtrip() {
        let (mut conn, mut relay) = channel_conn();

        conn.send(ClientFrame::TypingStart {
            room_id: "room-1".to_string(),
            user_id: "alice".to_string(),
        })
        .await
        .unwrap();
        assert!(matches!(
            relay.from_client.recv().await.unwrap(),
            ClientFrame::TypingStart { .. }
        ));

        relay
            .to_client
            .send(ServerFrame::AuthChallenge {
                nonce: "n1".to_string(),
            })
            .unwrap();
        assert!(matches!(
            conn.recv().await.unwrap().unwrap(),
            ServerFrame::AuthChallenge { .. }
        ));
    }

    #[tokio::test]
    async fn test_channel_conn_recv_none_when_relay_gone() {
        let (mut conn, relay) = channel_conn();
        drop(relay);
        assert!(conn.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connector_hands_out_conns_in_order() {
        let connector = ChannelConnector::new();
        let (conn, mut relay) = channel_conn();
        connector.push(conn);

        let mut first = connector.connect("test://relay").await.unwrap();
        first
            .send(ClientFrame::TypingStop {
                room_id: "r".to_string(),
                user_id: "alice".to_string(),
            })
            .await
            .unwrap();
        assert!(relay.from_client.recv().await.is_some());

        // Queue exhausted.
        assert!(matches!(
            connector.connect("test://relay").await,
            Err(TransportError::Connect(_))
        ));
    }
}
