//! WebSocket client for the routing server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - The server-assigned peer id, captured from the first announcement
//! - Typed requests for every operation the server dispatches
//! - An event channel translating outbound frames into [`ClientEvent`]s
//!
//! The connection is split into a writer task fed by an outgoing channel
//! and a reader task that parses frames and forwards events, so callers
//! never touch the socket directly.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    construct_operation, parse_server_frame, MessageType, Operation, PeerId, ServerFrame,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// The server announced this connection's id
    AssignedId(PeerId),
    /// A vpeer created on this connection's behalf was announced
    VPeerCreated(PeerId),
    /// A direct send arrived
    Message { from: PeerId, payload: String },
    /// A vpeer this peer subscribes to changed state
    StateUpdate { vpeer: PeerId, payload: String },
    /// An operation was acknowledged; payload is the affected peer id
    OperationOk { payload: String },
    /// An operation failed; the server's error string
    OperationError { message: String },
    /// A liveness probe arrived
    Ping { from: PeerId, payload: String },
    /// A liveness answer arrived
    Pong { from: PeerId, payload: String },
}

/// Client-side failures.
#[derive(Debug, Error)]
pub enum ClientError {
    /// No live connection
    #[error("not connected")]
    NotConnected,
    /// Websocket transport error
    #[error(transparent)]
    Websocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// The connection task went away mid-request
    #[error("connection task is gone")]
    ChannelClosed,
}

/// A routing-server client.
pub struct Client {
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    peer_id: Arc<RwLock<Option<PeerId>>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl Client {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            peer_id: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// The server-assigned id, once the announcement arrived.
    pub async fn peer_id(&self) -> Option<PeerId> {
        self.peer_id.read().await.clone()
    }

    /// Connect and spawn the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url).await?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);

        // writer: forward the outgoing channel onto the socket
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        // reader: parse outbound frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let peer_id = self.peer_id.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let text: &str = text.as_ref();
                        match parse_server_frame(text) {
                            Ok(frame) => {
                                if let Some(event) = translate_frame(frame, &peer_id).await {
                                    if event_tx.send(event).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(err) => {
                                log::warn!("unparseable frame from server: {err}");
                            }
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        Ok(())
    }

    /// Drop the outgoing channel; the writer task closes the socket.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
    }

    async fn request(&self, op: Operation, target: &str, payload: &str) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(construct_operation(op, target, payload))
            .await
            .map_err(|_| ClientError::ChannelClosed)
    }

    /// Forward a payload to another peer.
    pub async fn send_to(&self, target: &str, payload: &str) -> Result<(), ClientError> {
        self.request(Operation::SendDirect, target, payload).await
    }

    /// Create a vpeer; the fresh id arrives as [`ClientEvent::VPeerCreated`].
    pub async fn create_vpeer(&self) -> Result<(), ClientError> {
        let own_id = self.peer_id().await.ok_or(ClientError::NotConnected)?;
        self.request(Operation::CreateVPeer, &own_id, "").await
    }

    pub async fn delete_vpeer(&self, vpeer: &str) -> Result<(), ClientError> {
        self.request(Operation::DeleteVPeer, vpeer, "").await
    }

    /// Subscribe to a vpeer; the payload is echoed back as the initial
    /// state update.
    pub async fn connect_vpeer(&self, vpeer: &str, payload: &str) -> Result<(), ClientError> {
        self.request(Operation::ConnectVPeer, vpeer, payload).await
    }

    pub async fn disconnect_vpeer(&self, vpeer: &str) -> Result<(), ClientError> {
        self.request(Operation::DisconnectVPeer, vpeer, "").await
    }

    /// Replace a vpeer's shared state.
    pub async fn put_state(&self, vpeer: &str, state: &str) -> Result<(), ClientError> {
        self.request(Operation::PutState, vpeer, state).await
    }

    /// Deep-merge into a vpeer's shared state.
    pub async fn patch_state(&self, vpeer: &str, patch: &str) -> Result<(), ClientError> {
        self.request(Operation::PatchState, vpeer, patch).await
    }

    pub async fn ping(&self, target: &str, payload: &str) -> Result<(), ClientError> {
        self.request(Operation::Ping, target, payload).await
    }

    pub async fn pong(&self, target: &str, payload: &str) -> Result<(), ClientError> {
        self.request(Operation::Pong, target, payload).await
    }
}

async fn translate_frame(
    frame: ServerFrame,
    peer_id: &Arc<RwLock<Option<PeerId>>>,
) -> Option<ClientEvent> {
    let Some(msg_type) = MessageType::from_code(&frame.msg_type) else {
        log::warn!("unknown message type from server: {}", frame.msg_type);
        return None;
    };

    match msg_type {
        MessageType::PeerId => {
            // the first announcement names this connection; later ones name
            // vpeers created on its behalf
            let mut own = peer_id.write().await;
            if own.is_none() {
                *own = Some(frame.payload.clone());
                Some(ClientEvent::AssignedId(frame.payload))
            } else {
                Some(ClientEvent::VPeerCreated(frame.payload))
            }
        }
        MessageType::Send => Some(ClientEvent::Message {
            from: frame.sender,
            payload: frame.payload,
        }),
        MessageType::StateUpdate => Some(ClientEvent::StateUpdate {
            vpeer: frame.sender,
            payload: frame.payload,
        }),
        MessageType::Success => Some(ClientEvent::OperationOk {
            payload: frame.payload,
        }),
        MessageType::Error => Some(ClientEvent::OperationError {
            message: frame.payload,
        }),
        MessageType::Ping => Some(ClientEvent::Ping {
            from: frame.sender,
            payload: frame.payload,
        }),
        MessageType::Pong => Some(ClientEvent::Pong {
            from: frame.sender,
            payload: frame.payload,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::construct_message;

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = Client::new("ws://127.0.0.1:1");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert!(client.peer_id().await.is_none());
    }

    #[test]
    fn test_take_event_rx_once() {
        let mut client = Client::new("ws://127.0.0.1:1");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_request_before_connect() {
        let client = Client::new("ws://127.0.0.1:1");
        assert!(matches!(
            client.send_to("whoever", "x").await,
            Err(ClientError::NotConnected)
        ));
        assert!(matches!(
            client.create_vpeer().await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_first_peer_id_frame_is_assignment() {
        let peer_id = Arc::new(RwLock::new(None));
        let raw = construct_message(MessageType::PeerId, "QUxJQ0VBTElDRUFM@_dev_", "QUxJQ0VBTElDRUFM@_dev_");
        let frame = parse_server_frame(&raw).unwrap();

        let event = translate_frame(frame, &peer_id).await;
        assert_eq!(
            event,
            Some(ClientEvent::AssignedId("QUxJQ0VBTElDRUFM@_dev_".to_string()))
        );
        assert_eq!(peer_id.read().await.as_deref(), Some("QUxJQ0VBTElDRUFM@_dev_"));
    }

    #[tokio::test]
    async fn test_second_peer_id_frame_is_vpeer() {
        let peer_id = Arc::new(RwLock::new(Some("QUxJQ0VBTElDRUFM@_dev_".to_string())));
        let raw = construct_message(MessageType::PeerId, "VlBFRVJWUEVFUlZQ@_dev_", "VlBFRVJWUEVFUlZQ@_dev_");
        let frame = parse_server_frame(&raw).unwrap();

        let event = translate_frame(frame, &peer_id).await;
        assert_eq!(
            event,
            Some(ClientEvent::VPeerCreated("VlBFRVJWUEVFUlZQ@_dev_".to_string()))
        );
    }

    #[tokio::test]
    async fn test_error_frame_translates() {
        let peer_id = Arc::new(RwLock::new(None));
        let raw = construct_message(
            MessageType::Error,
            "QUxJQ0VBTElDRUFM@_dev_",
            "error: target could not be located",
        );
        let frame = parse_server_frame(&raw).unwrap();

        let event = translate_frame(frame, &peer_id).await;
        assert_eq!(
            event,
            Some(ClientEvent::OperationError {
                message: "error: target could not be located".to_string()
            })
        );
    }
}
