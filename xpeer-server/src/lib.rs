//! # xpeer-server — WebSocket peer routing with virtual peers
//!
//! Brokers communication among connected websocket clients ("peers") and
//! hosts server-side logical endpoints ("virtual peers") that act as named
//! broadcast channels carrying a shared JSON state.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐    WebSocket     ┌──────────────────────────────┐
//! │ Client A │ ◄──────────────► │            Server            │
//! └──────────┘   Text Frames    │                              │
//! ┌──────────┐                  │  protocol ─► router          │
//! │ Client B │ ◄──────────────► │                │             │
//! └──────────┘                  │                ▼             │
//!                               │          PeerRegistry        │
//!                               │   peers ── vpeers ── state   │
//!                               └──────────────────────────────┘
//! ```
//!
//! Each connected client is assigned a unique id and may then send text
//! payloads directly to other peers, create and join virtual peers, and
//! overwrite or patch a vpeer's shared state — every mutation is fanned
//! out to the vpeer's subscribers.
//!
//! ## Modules
//!
//! - [`protocol`] — fixed-offset text wire format, operation codes, errors
//! - [`peer`] — peer records and identity allocation
//! - [`registry`] — peer registry, subscription graph, frame routing
//! - [`state`] — recursive deep-merge of vpeer JSON state
//! - [`router`] — operation dispatch and error replies
//! - [`server`] — websocket accept/connection loops
//! - [`client`] — websocket client with typed requests and an event stream

pub mod client;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod state;

// Re-exports for convenience
pub use client::{Client, ClientError, ClientEvent, ConnectionState};
pub use peer::{generate_id, FrameSink, Peer, PeerKind};
pub use protocol::{
    construct_message, construct_operation, parse_message, parse_server_frame, MessageType,
    Operation, PeerId, ProtocolError, ServerFrame, WireMessage, ID_WIDTH, OP_WIDTH,
};
pub use registry::{PeerRegistry, RegistryError};
pub use server::{Server, ServerConfig, ServerStats};
pub use state::{deep_merge, merge_documents};
