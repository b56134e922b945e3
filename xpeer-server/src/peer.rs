//! Peer records and identity allocation.
//!
//! A peer is either *real* (backed by a live websocket connection) or
//! *virtual* (a server-hosted broadcast channel carrying shared JSON state).
//! Both kinds live in the same registry and are addressed by the same kind
//! of id, so a frame can target either without caring which it got.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, RngCore};
use tokio::sync::{mpsc, Mutex};

use crate::protocol::{PeerId, CORE_ID_WIDTH, ID_DIVIDER, SERVER_SUFFIX};

/// Outbound frame sink of a real peer. The connection task owns the
/// receiving end and is the only writer on the underlying socket.
pub type FrameSink = mpsc::UnboundedSender<String>;

/// Whether a peer is a live connection or a server-hosted channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerKind {
    /// Bound to a websocket connection
    Real,
    /// Server-hosted broadcast channel with shared state
    Virtual,
}

/// A registered peer.
///
/// The subscription graph is stored as id-lists on both endpoints rather
/// than as references, so removing either side is a plain walk over the
/// other and no ownership cycle can form.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Server-assigned unique id
    pub id: PeerId,
    pub kind: PeerKind,
    /// Outbound sink; real peers only
    pub sink: Option<FrameSink>,
    /// Real peers that receive this peer's broadcasts; virtual peers only
    pub subscribers: Vec<PeerId>,
    /// Virtual peers this peer listens to; real peers only
    pub subscriptions: Vec<PeerId>,
    /// Shared JSON state; virtual peers only, guarded by its own mutex so
    /// mutations on one vpeer never block another
    pub state: Option<Arc<Mutex<String>>>,
}

impl Peer {
    /// A real peer bound to a connection's outbound sink.
    pub fn real(id: PeerId, sink: FrameSink) -> Self {
        Self {
            id,
            kind: PeerKind::Real,
            sink: Some(sink),
            subscribers: Vec::new(),
            subscriptions: Vec::new(),
            state: None,
        }
    }

    /// A virtual peer with empty subscriber list and empty-object state.
    pub fn vpeer(id: PeerId) -> Self {
        Self {
            id,
            kind: PeerKind::Virtual,
            sink: None,
            subscribers: Vec::new(),
            subscriptions: Vec::new(),
            state: Some(Arc::new(Mutex::new(String::from("{}")))),
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.kind == PeerKind::Virtual
    }
}

/// Random bytes per id; 12 bytes encode to exactly [`CORE_ID_WIDTH`] chars.
const RAW_ID_BYTES: usize = 12;

/// Placeholder core returned when the system random source fails. Fixed
/// width, so downstream slicing still works; the connection carrying it is
/// expected to be rejected by the registry if it ever collides.
const FALLBACK_CORE: &str = "__id_gen_error__";

/// Allocate a fresh peer id: `base64url(12 random bytes)` + `@` + suffix.
///
/// Randomness comes from the OS entropy source; 96 random bits make
/// collisions negligible, but the registry still refuses duplicates.
pub fn generate_id() -> PeerId {
    let mut bytes = [0u8; RAW_ID_BYTES];
    if let Err(err) = OsRng.try_fill_bytes(&mut bytes) {
        log::error!("id generation failed: {err}");
        return format!("{FALLBACK_CORE}{ID_DIVIDER}{SERVER_SUFFIX}");
    }
    format!(
        "{}{ID_DIVIDER}{SERVER_SUFFIX}",
        URL_SAFE_NO_PAD.encode(bytes)
    )
}
