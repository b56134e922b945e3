//! Operation dispatch.
//!
//! One inbound frame in, zero or more outbound frames out. Parse and
//! dispatch failures are answered with an `errorMsg` frame to the sender
//! and never terminate the connection; registry and graph invariants hold
//! on every error path because handlers validate before they mutate.

use crate::peer::{generate_id, Peer, PeerKind};
use crate::protocol::{
    parse_message, MessageType, Operation, PeerId, ProtocolError, WireMessage,
};
use crate::registry::PeerRegistry;

/// Entry point for every inbound text frame.
pub async fn handle_message(registry: &PeerRegistry, raw: &str, sender: &PeerId) {
    let msg = match parse_message(raw, sender) {
        Ok(msg) => msg,
        Err(err) => {
            log::warn!("{sender}: erroneous message {err}");
            ErrorReply::to(sender).send(registry, err).await;
            return;
        }
    };
    log::debug!(
        "{sender}: receive {}::{}::{{{}}}",
        msg.operation,
        msg.target,
        msg.payload.len()
    );

    let Some(op) = Operation::from_code(&msg.operation) else {
        log::warn!("{sender}: erroneous message {}", ProtocolError::UnknownOperation);
        ErrorReply::to(sender)
            .send(registry, ProtocolError::UnknownOperation)
            .await;
        return;
    };

    match op {
        Operation::SendDirect => handle_send_direct(registry, msg).await,
        Operation::CreateVPeer => handle_create_vpeer(registry, msg).await,
        Operation::DeleteVPeer => handle_delete_vpeer(registry, msg).await,
        Operation::ConnectVPeer => handle_connect_vpeer(registry, msg).await,
        Operation::DisconnectVPeer => handle_disconnect_vpeer(registry, msg).await,
        Operation::PutState => handle_put_state(registry, msg).await,
        Operation::PatchState => handle_patch_state(registry, msg).await,
        Operation::Ping => handle_ping(registry, msg).await,
        Operation::Pong => handle_pong(registry, msg).await,
    }
}

/// Builder for `errorMsg` replies.
///
/// The sender stamped on an error frame defaults to the recipient itself;
/// state handlers override it with the vpeer id so the client can tell
/// which target the failure belongs to.
pub struct ErrorReply<'a> {
    to: &'a str,
    sender: Option<&'a str>,
}

impl<'a> ErrorReply<'a> {
    pub fn to(peer: &'a str) -> Self {
        Self { to: peer, sender: None }
    }

    pub fn with_sender(mut self, sender: &'a str) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Deliver the error. Returns false when the recipient itself is gone,
    /// in which case the event is logged and dropped.
    pub async fn send(self, registry: &PeerRegistry, error: ProtocolError) -> bool {
        let sender = self.sender.unwrap_or(self.to);
        log::warn!("{}: sending error {error}", self.to);
        match registry
            .send_frame(MessageType::Error, sender, self.to, &error.to_string())
            .await
        {
            Ok(()) => true,
            Err(_) => {
                log::error!("initial sender not available: {}", self.to);
                false
            }
        }
    }
}

/// Acknowledge an operation with an `oprResOk` frame carrying the affected
/// peer id as its payload.
async fn send_success(registry: &PeerRegistry, peer: &str, payload: &str) -> bool {
    match registry
        .send_frame(MessageType::Success, peer, peer, payload)
        .await
    {
        Ok(()) => true,
        Err(_) => {
            log::warn!("initial sender not available: {peer}");
            false
        }
    }
}

async fn handle_send_direct(registry: &PeerRegistry, msg: WireMessage) {
    match registry
        .send_frame(MessageType::Send, &msg.sender, &msg.target, &msg.payload)
        .await
    {
        // the success payload is the target id: a delivery receipt
        Ok(()) => {
            send_success(registry, &msg.sender, &msg.target).await;
        }
        Err(err) => {
            if !ErrorReply::to(&msg.sender).send(registry, err).await {
                log::error!(
                    "{}: neither target ({}) nor sender are available",
                    msg.sender,
                    msg.target
                );
            }
        }
    }
}

async fn handle_create_vpeer(registry: &PeerRegistry, msg: WireMessage) {
    let vpeer = Peer::vpeer(generate_id());
    let vpeer_id = vpeer.id.clone();

    if let Err(err) = registry.insert(vpeer).await {
        log::error!("{}: create vpeer failed: {err}", msg.sender);
        return;
    }
    log::info!("{}: create vpeer {vpeer_id}", msg.sender);

    // announce the fresh id to the peer named as notification target
    if let Err(err) = registry
        .send_frame(MessageType::PeerId, &vpeer_id, &msg.target, &vpeer_id)
        .await
    {
        ErrorReply::to(&msg.sender).send(registry, err).await;
    }
}

async fn handle_delete_vpeer(registry: &PeerRegistry, msg: WireMessage) {
    // deletion is silent; a missing or non-virtual target is a no-op
    if registry.kind_of(&msg.target).await != Some(PeerKind::Virtual) {
        return;
    }
    if let Some(removed) = registry.remove(&msg.target).await {
        registry.on_peer_removed(&removed).await;
        log::info!("{}: delete vpeer {}", msg.sender, removed.id);
    }
}

async fn handle_connect_vpeer(registry: &PeerRegistry, msg: WireMessage) {
    match registry.subscribe(&msg.sender, &msg.target).await {
        Ok(()) => {
            log::info!("{}: connect to vpeer {}", msg.sender, msg.target);
            send_success(registry, &msg.sender, &msg.target).await;
            // initial state update for the connecting peer, carrying the
            // payload of the connect frame; queued after the ack on the
            // same sink so the pair arrives in order
            let _ = registry
                .send_frame(MessageType::StateUpdate, &msg.target, &msg.sender, &msg.payload)
                .await;
        }
        Err(err) => {
            ErrorReply::to(&msg.sender).send(registry, err).await;
        }
    }
}

async fn handle_disconnect_vpeer(registry: &PeerRegistry, msg: WireMessage) {
    // the real peer is the sender; the frame's target names the vpeer
    match registry.unsubscribe(&msg.sender, &msg.target).await {
        Ok(()) => {
            log::info!("{}: disconnect from vpeer {}", msg.sender, msg.target);
            send_success(registry, &msg.sender, &msg.target).await;
        }
        Err(err) => {
            ErrorReply::to(&msg.sender).send(registry, err).await;
        }
    }
}

async fn handle_put_state(registry: &PeerRegistry, msg: WireMessage) {
    match registry.put_state(&msg.target, &msg.payload).await {
        Ok(()) => {
            log::info!("{}: put state of {}", msg.sender, msg.target);
            send_success(registry, &msg.sender, &msg.target).await;
            let _ = registry
                .send_frame(MessageType::StateUpdate, &msg.sender, &msg.target, &msg.payload)
                .await;
        }
        Err(err) => {
            send_state_error(registry, &msg, err).await;
        }
    }
}

async fn handle_patch_state(registry: &PeerRegistry, msg: WireMessage) {
    match registry.patch_state(&msg.target, &msg.payload).await {
        Ok(()) => {
            log::info!("{}: patch state of {}", msg.sender, msg.target);
            send_success(registry, &msg.sender, &msg.target).await;
            // subscribers receive the patch itself and merge locally
            let _ = registry
                .send_frame(MessageType::StateUpdate, &msg.sender, &msg.target, &msg.payload)
                .await;
        }
        Err(err) => {
            send_state_error(registry, &msg, err).await;
        }
    }
}

async fn send_state_error(registry: &PeerRegistry, msg: &WireMessage, err: ProtocolError) {
    // a state failure concerns the target, so stamp the target as sender
    // when the target is at least known
    let reply = match err {
        ProtocolError::TargetNotFound => ErrorReply::to(&msg.sender),
        _ => ErrorReply::to(&msg.sender).with_sender(&msg.target),
    };
    reply.send(registry, err).await;
}

async fn handle_ping(registry: &PeerRegistry, msg: WireMessage) {
    match registry.kind_of(&msg.target).await {
        None => {
            ErrorReply::to(&msg.sender)
                .send(registry, ProtocolError::TargetNotFound)
                .await;
        }
        // a vpeer has no socket to relay to; answer on its behalf
        Some(PeerKind::Virtual) => {
            let _ = registry
                .send_frame(MessageType::Pong, &msg.target, &msg.sender, "virtual")
                .await;
        }
        Some(PeerKind::Real) => {
            if let Err(err) = registry
                .send_frame(MessageType::Ping, &msg.sender, &msg.target, &msg.payload)
                .await
            {
                ErrorReply::to(&msg.sender).send(registry, err).await;
            }
        }
    }
}

async fn handle_pong(registry: &PeerRegistry, msg: WireMessage) {
    // the ping target does not need to know whether its answer arrived
    let _ = registry
        .send_frame(MessageType::Pong, &msg.sender, &msg.target, &msg.payload)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::generate_id;
    use crate::protocol::{construct_operation, parse_server_frame, Operation};
    use tokio::sync::mpsc;

    struct TestPeer {
        id: PeerId,
        rx: mpsc::UnboundedReceiver<String>,
    }

    impl TestPeer {
        async fn join(registry: &PeerRegistry) -> Self {
            let id = generate_id();
            let (tx, rx) = mpsc::unbounded_channel();
            registry.insert(Peer::real(id.clone(), tx)).await.unwrap();
            Self { id, rx }
        }

        fn next_frame(&mut self) -> crate::protocol::ServerFrame {
            let raw = self.rx.try_recv().expect("expected a frame");
            parse_server_frame(&raw).unwrap()
        }

        fn assert_no_frame(&mut self) {
            assert!(self.rx.try_recv().is_err());
        }
    }

    async fn create_vpeer(registry: &PeerRegistry, creator: &mut TestPeer) -> PeerId {
        let raw = construct_operation(Operation::CreateVPeer, &creator.id, "");
        handle_message(registry, &raw, &creator.id).await;
        let frame = creator.next_frame();
        assert_eq!(frame.msg_type, MessageType::PeerId.code());
        frame.payload
    }

    #[tokio::test]
    async fn test_send_direct_delivers_and_acks() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let mut bob = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::SendDirect, &bob.id, "hello");
        handle_message(&registry, &raw, &alice.id).await;

        let delivered = bob.next_frame();
        assert_eq!(delivered.msg_type, MessageType::Send.code());
        assert_eq!(delivered.sender, alice.id);
        assert_eq!(delivered.payload, "hello");

        let ack = alice.next_frame();
        assert_eq!(ack.msg_type, MessageType::Success.code());
        assert_eq!(ack.payload, bob.id);
    }

    #[tokio::test]
    async fn test_send_direct_missing_target() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::SendDirect, &generate_id(), "x");
        handle_message(&registry, &raw, &alice.id).await;

        let err = alice.next_frame();
        assert_eq!(err.msg_type, MessageType::Error.code());
        assert_eq!(err.payload, "error: target could not be located");
    }

    #[tokio::test]
    async fn test_unknown_operation() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;

        let raw = format!("xxxxxxxx::{}::", alice.id);
        handle_message(&registry, &raw, &alice.id).await;

        let err = alice.next_frame();
        assert_eq!(err.payload, "error: message operation is unknown");
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;

        handle_message(&registry, "tiny", &alice.id).await;

        let err = alice.next_frame();
        assert_eq!(err.payload, "error: message too short");
    }

    #[tokio::test]
    async fn test_create_vpeer_announces_id() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::CreateVPeer, &alice.id, "");
        handle_message(&registry, &raw, &alice.id).await;

        let frame = alice.next_frame();
        assert_eq!(frame.msg_type, MessageType::PeerId.code());
        // sender and payload both carry the fresh vpeer id
        assert_eq!(frame.sender, frame.payload);
        assert_eq!(registry.kind_of(&frame.payload).await, Some(PeerKind::Virtual));
        assert_eq!(registry.state_of(&frame.payload).await.unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_connect_vpeer_acks_then_updates() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let mut bob = TestPeer::join(&registry).await;
        let vpeer_id = create_vpeer(&registry, &mut alice).await;

        let raw = construct_operation(Operation::ConnectVPeer, &vpeer_id, r#"{"seen":true}"#);
        handle_message(&registry, &raw, &bob.id).await;

        let ack = bob.next_frame();
        assert_eq!(ack.msg_type, MessageType::Success.code());
        assert_eq!(ack.payload, vpeer_id);

        let update = bob.next_frame();
        assert_eq!(update.msg_type, MessageType::StateUpdate.code());
        assert_eq!(update.sender, vpeer_id);
        assert_eq!(update.payload, r#"{"seen":true}"#);

        assert_eq!(registry.subscribers_of(&vpeer_id).await, vec![bob.id.clone()]);
    }

    #[tokio::test]
    async fn test_connect_vpeer_to_real_peer() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let bob = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::ConnectVPeer, &bob.id, "");
        handle_message(&registry, &raw, &alice.id).await;

        let err = alice.next_frame();
        assert_eq!(err.payload, "error: that target peer is not virtual");
    }

    #[tokio::test]
    async fn test_disconnect_vpeer_uses_sender_id() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let mut bob = TestPeer::join(&registry).await;
        let vpeer_id = create_vpeer(&registry, &mut alice).await;

        for peer in [&alice.id, &bob.id] {
            let raw = construct_operation(Operation::ConnectVPeer, &vpeer_id, "");
            handle_message(&registry, &raw, peer).await;
        }
        alice.next_frame(); // ack
        alice.next_frame(); // initial update
        bob.next_frame();
        bob.next_frame();

        let raw = construct_operation(Operation::DisconnectVPeer, &vpeer_id, "");
        handle_message(&registry, &raw, &bob.id).await;

        let ack = bob.next_frame();
        assert_eq!(ack.msg_type, MessageType::Success.code());
        assert_eq!(ack.payload, vpeer_id);

        // only bob's edge disappeared
        assert_eq!(registry.subscribers_of(&vpeer_id).await, vec![alice.id.clone()]);
        assert!(registry.subscriptions_of(&bob.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_vpeer_is_silent_and_cleans_edges() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let vpeer_id = create_vpeer(&registry, &mut alice).await;

        let raw = construct_operation(Operation::ConnectVPeer, &vpeer_id, "");
        handle_message(&registry, &raw, &alice.id).await;
        alice.next_frame();
        alice.next_frame();

        let raw = construct_operation(Operation::DeleteVPeer, &vpeer_id, "");
        handle_message(&registry, &raw, &alice.id).await;

        alice.assert_no_frame();
        assert!(!registry.contains(&vpeer_id).await);
        assert!(registry.subscriptions_of(&alice.id).await.is_empty());
    }

    #[tokio::test]
    async fn test_delete_real_peer_ignored() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let bob = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::DeleteVPeer, &bob.id, "");
        handle_message(&registry, &raw, &alice.id).await;

        alice.assert_no_frame();
        assert!(registry.contains(&bob.id).await);
    }

    #[tokio::test]
    async fn test_put_state_acks_and_broadcasts() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let mut bob = TestPeer::join(&registry).await;
        let vpeer_id = create_vpeer(&registry, &mut alice).await;

        let raw = construct_operation(Operation::ConnectVPeer, &vpeer_id, "");
        handle_message(&registry, &raw, &bob.id).await;
        bob.next_frame();
        bob.next_frame();

        let raw = construct_operation(Operation::PutState, &vpeer_id, r#"{"n":1}"#);
        handle_message(&registry, &raw, &alice.id).await;

        let ack = alice.next_frame();
        assert_eq!(ack.msg_type, MessageType::Success.code());
        assert_eq!(ack.payload, vpeer_id);

        let update = bob.next_frame();
        assert_eq!(update.msg_type, MessageType::StateUpdate.code());
        assert_eq!(update.sender, vpeer_id);
        assert_eq!(update.payload, r#"{"n":1}"#);

        assert_eq!(registry.state_of(&vpeer_id).await.unwrap(), r#"{"n":1}"#);
    }

    #[tokio::test]
    async fn test_put_state_on_real_peer_stamps_target() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let bob = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::PutState, &bob.id, "{}");
        handle_message(&registry, &raw, &alice.id).await;

        let err = alice.next_frame();
        assert_eq!(err.msg_type, MessageType::Error.code());
        assert_eq!(err.sender, bob.id);
        assert_eq!(err.payload, "error: that target peer is not virtual");
    }

    #[tokio::test]
    async fn test_patch_state_broadcasts_patch_payload() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let vpeer_id = create_vpeer(&registry, &mut alice).await;

        let raw = construct_operation(Operation::ConnectVPeer, &vpeer_id, "");
        handle_message(&registry, &raw, &alice.id).await;
        alice.next_frame();
        alice.next_frame();

        let raw = construct_operation(Operation::PutState, &vpeer_id, r#"{"a":{"x":1},"b":2}"#);
        handle_message(&registry, &raw, &alice.id).await;
        alice.next_frame(); // ack
        alice.next_frame(); // state update

        let raw = construct_operation(Operation::PatchState, &vpeer_id, r#"{"a":{"y":3},"b":4}"#);
        handle_message(&registry, &raw, &alice.id).await;

        let ack = alice.next_frame();
        assert_eq!(ack.msg_type, MessageType::Success.code());

        // the broadcast carries the patch, not the merged document
        let update = alice.next_frame();
        assert_eq!(update.payload, r#"{"a":{"y":3},"b":4}"#);

        let state: serde_json::Value =
            serde_json::from_str(&registry.state_of(&vpeer_id).await.unwrap()).unwrap();
        assert_eq!(state, serde_json::json!({"a": {"x": 1, "y": 3}, "b": 4}));
    }

    #[tokio::test]
    async fn test_ping_relayed_to_real_target() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let mut bob = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::Ping, &bob.id, "probe");
        handle_message(&registry, &raw, &alice.id).await;

        let ping = bob.next_frame();
        assert_eq!(ping.msg_type, MessageType::Ping.code());
        assert_eq!(ping.sender, alice.id);
        assert_eq!(ping.payload, "probe");

        // no positive ack for pings
        alice.assert_no_frame();
    }

    #[tokio::test]
    async fn test_ping_to_vpeer_answered_by_server() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let vpeer_id = create_vpeer(&registry, &mut alice).await;

        let raw = construct_operation(Operation::Ping, &vpeer_id, "");
        handle_message(&registry, &raw, &alice.id).await;

        let pong = alice.next_frame();
        assert_eq!(pong.msg_type, MessageType::Pong.code());
        assert_eq!(pong.sender, vpeer_id);
        assert_eq!(pong.payload, "virtual");
    }

    #[tokio::test]
    async fn test_ping_missing_target() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::Ping, &generate_id(), "");
        handle_message(&registry, &raw, &alice.id).await;

        let err = alice.next_frame();
        assert_eq!(err.payload, "error: target could not be located");
    }

    #[tokio::test]
    async fn test_pong_relayed_without_ack() {
        let registry = PeerRegistry::new();
        let mut alice = TestPeer::join(&registry).await;
        let mut bob = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::Pong, &alice.id, "alive");
        handle_message(&registry, &raw, &bob.id).await;

        let pong = alice.next_frame();
        assert_eq!(pong.msg_type, MessageType::Pong.code());
        assert_eq!(pong.payload, "alive");
        bob.assert_no_frame();
    }

    #[tokio::test]
    async fn test_pong_to_missing_target_is_silent() {
        let registry = PeerRegistry::new();
        let mut bob = TestPeer::join(&registry).await;

        let raw = construct_operation(Operation::Pong, &generate_id(), "alive");
        handle_message(&registry, &raw, &bob.id).await;

        bob.assert_no_frame();
    }
}
