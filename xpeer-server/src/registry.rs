//! Peer registry, subscription graph, and frame routing.
//!
//! Architecture:
//! ```text
//! connection task ──► PeerRegistry ──► target sink (real peer)
//!                        │   │
//!                        │   └──────► subscriber sinks (virtual peer fan-out)
//!                        │
//!                        └── RwLock<HashMap<PeerId, Peer>>
//! ```
//!
//! The registry is the single owner of all peer records. Connection tasks
//! share it behind an `Arc`; mutations are short write-lock sections and
//! routing takes a read lock. Frames leave through each real peer's
//! unbounded sink, so no socket is ever awaited while the lock is held.
//!
//! The subscription graph is kept symmetric at all times: for every real
//! peer `r` and virtual peer `v`, `r ∈ v.subscribers ⇔ v ∈ r.subscriptions`.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::peer::{Peer, PeerKind};
use crate::protocol::{construct_message, MessageType, PeerId, ProtocolError};

/// Registry-level failures (distinct from wire-level [`ProtocolError`]s).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// An id collision on insert; the existing record is left untouched.
    #[error("peer id {0} is already registered")]
    DuplicateId(PeerId),
}

/// The authoritative mapping of peer id to peer record.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer. Refuses to overwrite an existing id.
    pub async fn insert(&self, peer: Peer) -> Result<(), RegistryError> {
        let mut peers = self.peers.write().await;
        if peers.contains_key(&peer.id) {
            return Err(RegistryError::DuplicateId(peer.id.clone()));
        }
        peers.insert(peer.id.clone(), peer);
        Ok(())
    }

    /// Remove a peer, returning its record for graph cleanup.
    pub async fn remove(&self, id: &str) -> Option<Peer> {
        self.peers.write().await.remove(id)
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.peers.read().await.contains_key(id)
    }

    /// The kind of a registered peer, if any.
    pub async fn kind_of(&self, id: &str) -> Option<PeerKind> {
        self.peers.read().await.get(id).map(|p| p.kind)
    }

    /// All registered ids; diagnostics and shutdown iteration.
    pub async fn snapshot_ids(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }

    /// All registered ids with their kinds.
    pub async fn snapshot(&self) -> Vec<(PeerId, PeerKind)> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| (p.id.clone(), p.kind))
            .collect()
    }

    /// The vpeers a real peer currently listens to.
    pub async fn subscriptions_of(&self, id: &str) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .get(id)
            .map(|p| p.subscriptions.clone())
            .unwrap_or_default()
    }

    /// The subscribers of a virtual peer.
    pub async fn subscribers_of(&self, id: &str) -> Vec<PeerId> {
        self.peers
            .read()
            .await
            .get(id)
            .map(|p| p.subscribers.clone())
            .unwrap_or_default()
    }

    // ── subscription graph ─────────────────────────────────────────────

    /// Add the edge real ↔ virtual, in both directions under one lock.
    ///
    /// Edges have set semantics: connecting twice leaves a single edge, so
    /// a repeated connect can never inflate a broadcast.
    pub async fn subscribe(&self, real_id: &str, vpeer_id: &str) -> Result<(), ProtocolError> {
        let mut peers = self.peers.write().await;

        match peers.get(vpeer_id) {
            None => return Err(ProtocolError::TargetNotFound),
            Some(p) if p.kind != PeerKind::Virtual => return Err(ProtocolError::PeerNotVirtual),
            Some(_) => {}
        }
        if !peers.contains_key(real_id) {
            return Err(ProtocolError::TargetNotFound);
        }

        if let Some(vpeer) = peers.get_mut(vpeer_id) {
            if !vpeer.subscribers.iter().any(|s| s == real_id) {
                vpeer.subscribers.push(real_id.to_string());
            }
        }
        if let Some(real) = peers.get_mut(real_id) {
            if !real.subscriptions.iter().any(|v| v == vpeer_id) {
                real.subscriptions.push(vpeer_id.to_string());
            }
        }
        Ok(())
    }

    /// Remove the edge real ↔ virtual, in both directions under one lock.
    pub async fn unsubscribe(&self, real_id: &str, vpeer_id: &str) -> Result<(), ProtocolError> {
        let mut peers = self.peers.write().await;

        match peers.get(vpeer_id) {
            None => return Err(ProtocolError::TargetNotFound),
            Some(p) if p.kind != PeerKind::Virtual => return Err(ProtocolError::PeerNotVirtual),
            Some(_) => {}
        }

        if let Some(vpeer) = peers.get_mut(vpeer_id) {
            vpeer.subscribers.retain(|s| s != real_id);
        }
        if let Some(real) = peers.get_mut(real_id) {
            real.subscriptions.retain(|v| v != vpeer_id);
        }
        Ok(())
    }

    /// Drop every edge that referenced a peer that just left the registry.
    ///
    /// Walks both id-lists of the removed record: the vpeers it listened to
    /// forget it as a subscriber, and (if it was virtual) its subscribers
    /// forget it as a subscription.
    pub async fn on_peer_removed(&self, removed: &Peer) {
        let mut peers = self.peers.write().await;

        for vpeer_id in &removed.subscriptions {
            if let Some(vpeer) = peers.get_mut(vpeer_id) {
                vpeer.subscribers.retain(|s| s != &removed.id);
            }
        }
        for sub_id in &removed.subscribers {
            if let Some(sub) = peers.get_mut(sub_id) {
                sub.subscriptions.retain(|v| v != &removed.id);
            }
        }
    }

    // ── state access ───────────────────────────────────────────────────

    /// The state cell of a virtual peer.
    pub(crate) async fn state_handle(
        &self,
        vpeer_id: &str,
    ) -> Result<Arc<Mutex<String>>, ProtocolError> {
        let peers = self.peers.read().await;
        let peer = peers.get(vpeer_id).ok_or(ProtocolError::TargetNotFound)?;
        match (peer.kind, &peer.state) {
            (PeerKind::Virtual, Some(state)) => Ok(state.clone()),
            _ => Err(ProtocolError::PeerNotVirtual),
        }
    }

    // ── routing ────────────────────────────────────────────────────────

    /// Route one outbound frame.
    ///
    /// A real target gets `<type>::<sender>::<payload>` on its sink. A
    /// virtual target fans the frame out to every subscriber, with the
    /// vpeer's id stamped as the sender — subscribers learn which channel
    /// spoke, not which peer fed it. The original sender is a subscriber
    /// like any other and hears its own broadcast.
    ///
    /// A dead subscriber sink is logged and skipped; it never aborts the
    /// rest of the fan-out.
    pub async fn send_frame(
        &self,
        msg_type: MessageType,
        sender: &str,
        target: &str,
        payload: &str,
    ) -> Result<(), ProtocolError> {
        let peers = self.peers.read().await;
        let target_peer = peers.get(target).ok_or(ProtocolError::TargetNotFound)?;

        match target_peer.kind {
            PeerKind::Real => {
                log::debug!("{sender}: send {} to {target}", msg_type.code());
                let frame = construct_message(msg_type, sender, payload);
                if let Some(sink) = &target_peer.sink {
                    if sink.send(frame).is_err() {
                        log::error!("{target}: sink closed, frame dropped");
                    }
                }
                Ok(())
            }
            PeerKind::Virtual => {
                log::debug!(
                    "{sender}: broadcast {} from {target} to {} subscribers",
                    msg_type.code(),
                    target_peer.subscribers.len()
                );
                let frame = construct_message(msg_type, target, payload);
                for sub_id in &target_peer.subscribers {
                    let Some(sub) = peers.get(sub_id) else {
                        continue;
                    };
                    if let Some(sink) = &sub.sink {
                        if sink.send(frame.clone()).is_err() {
                            log::error!("{sub_id}: sink closed, broadcast frame dropped");
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
