//! WebSocket accept and connection loops.
//!
//! Architecture:
//! ```text
//! TcpListener ── accept ──► connection task (one per socket)
//!                               │
//!                  ┌────────────┴────────────┐
//!                  │ select!                 │
//!                  │  inbound text ──► router│──► registry mutations
//!                  │  sink rx ──► socket send│◄── frames from any task
//!                  └─────────────────────────┘
//! ```
//!
//! The connection task is the only writer on its socket; everything
//! addressed to the peer funnels through the unbounded sink channel, so
//! writes are serialized without a per-socket lock. Only read errors
//! terminate a connection — failed writes are logged and the loop keeps
//! going.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::peer::{generate_id, Peer};
use crate::protocol::MessageType;
use crate::registry::PeerRegistry;
use crate::router;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: &str = "8192";

/// Server configuration. The core treats host and port as opaque strings.
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT.to_string(),
        }
    }
}

impl ServerConfig {
    /// Read `XPEER_HOST` / `XPEER_PORT` from the environment, falling back
    /// to the defaults.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("XPEER_HOST").unwrap_or_else(|_| DEFAULT_HOST.to_string()),
            port: std::env::var("XPEER_PORT").unwrap_or_else(|_| DEFAULT_PORT.to_string()),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Server counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStats {
    /// Connections accepted over the server's lifetime
    pub total_connections: u64,
    /// Currently registered real peers
    pub active_connections: u64,
    /// Inbound text frames handed to the dispatcher
    pub frames_received: u64,
}

/// The routing server: registry plus accept loop.
pub struct Server {
    config: ServerConfig,
    registry: Arc<PeerRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(PeerRegistry::new()),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// The shared peer registry.
    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> String {
        self.config.bind_addr()
    }

    /// Accept connections until the listener fails. Call from an async
    /// runtime; each accepted socket gets its own task.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        log::info!("listening on {}", self.config.bind_addr());

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new tcp connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, addr, registry, stats).await {
                    log::error!("connection error from {addr}: {err}");
                }
            });
        }
    }

    /// Drop every registered peer. Closing the sinks unblocks each
    /// connection task, which then closes its socket.
    pub async fn shutdown(&self) {
        for id in self.registry.snapshot_ids().await {
            if let Some(peer) = self.registry.remove(&id).await {
                self.registry.on_peer_removed(&peer).await;
            }
        }
        log::info!("shutdown: all peers dropped");
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<PeerRegistry>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (sink_tx, mut sink_rx) = mpsc::unbounded_channel::<String>();
    let peer_id = generate_id();
    registry.insert(Peer::real(peer_id.clone(), sink_tx)).await?;

    // tell the client who it is
    registry
        .send_frame(MessageType::PeerId, &peer_id, &peer_id, &peer_id)
        .await?;

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    log::info!("connected {peer_id} ({addr})");

    loop {
        tokio::select! {
            inbound = ws_receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    stats.write().await.frames_received += 1;
                    let text: &str = text.as_ref();
                    router::handle_message(&registry, text, &peer_id).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    log::warn!("{peer_id}: binary frame rejected");
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(err) = ws_sender.send(Message::Pong(data)).await {
                        log::error!("{peer_id}: pong failed: {err}");
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    log::error!("{peer_id}: {err}");
                    break;
                }
            },
            outbound = sink_rx.recv() => match outbound {
                Some(frame) => {
                    // a failed write never kills the connection; only read
                    // errors do
                    if let Err(err) = ws_sender.send(Message::Text(frame.into())).await {
                        log::error!("{peer_id}: write failed: {err}");
                    }
                }
                // sink dropped server-side (shutdown)
                None => break,
            },
        }
    }

    if let Some(peer) = registry.remove(&peer_id).await {
        registry.on_peer_removed(&peer).await;
    }
    stats.write().await.active_connections -= 1;
    log::info!("disconnected {peer_id}");

    let _ = ws_sender.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, "8192");
        assert_eq!(config.bind_addr(), "0.0.0.0:8192");
    }

    #[test]
    fn test_config_from_env_falls_back() {
        // the variables are unset in the test environment
        std::env::remove_var("XPEER_HOST");
        std::env::remove_var("XPEER_PORT");
        let config = ServerConfig::from_env();
        assert_eq!(config.bind_addr(), ServerConfig::default().bind_addr());
    }

    #[tokio::test]
    async fn test_server_initial_stats() {
        let server = Server::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.frames_received, 0);
    }

    #[tokio::test]
    async fn test_server_registry_starts_empty() {
        let server = Server::with_defaults();
        assert!(server.registry().snapshot_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let server = Server::with_defaults();
        let registry = server.registry();
        registry
            .insert(crate::peer::Peer::vpeer(generate_id()))
            .await
            .unwrap();

        server.shutdown().await;
        assert!(registry.snapshot_ids().await.is_empty());
    }
}
