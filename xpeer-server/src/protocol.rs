//! Text wire protocol for peer routing.
//!
//! Wire format (UTF-8 text frames, fixed-offset fields):
//! ```text
//! inbound   ┌───────────┬────┬─────────────┬────┬──────────┐
//!           │ operation │ :: │ target id   │ :: │ payload  │
//!           │ 8 bytes   │    │ 22 bytes    │    │ variable │
//!           └───────────┴────┴─────────────┴────┴──────────┘
//! outbound  ┌───────────┬────┬─────────────┬────┬──────────┐
//!           │ msg type  │ :: │ sender id   │ :: │ payload  │
//!           └───────────┴────┴─────────────┴────┴──────────┘
//! ```
//!
//! Fields live at fixed byte offsets so frames are sliced, never scanned.
//! Parsing only checks the frame shape — unknown operation codes and unknown
//! target ids are the dispatcher's problem, not the codec's.
//!
//! Everything in this module is pure; no locks, no I/O.

use thiserror::Error;

/// A peer identifier: 16 base64url chars, `@`, 5-char server suffix.
pub type PeerId = String;

/// Width of an operation code / outbound message type, in bytes.
pub const OP_WIDTH: usize = 8;
/// Width of the random core of a peer id (base64url of 12 bytes).
pub const CORE_ID_WIDTH: usize = 16;
/// Divider between the random core and the server suffix.
pub const ID_DIVIDER: &str = "@";
/// Suffix identifying the allocating server.
pub const SERVER_SUFFIX: &str = "_dev_";
/// Full width of a peer id in bytes.
pub const ID_WIDTH: usize = CORE_ID_WIDTH + ID_DIVIDER.len() + SERVER_SUFFIX.len();

/// Field divider between the fixed regions of a frame.
pub const DIVIDER: &str = "::";
const DIVIDER_WIDTH: usize = DIVIDER.len();

const OP_START: usize = 0;
const OP_END: usize = OP_START + OP_WIDTH;
const TARGET_START: usize = OP_END + DIVIDER_WIDTH;
const TARGET_END: usize = TARGET_START + ID_WIDTH;
/// Offset of the payload, equivalently the minimum valid frame length.
pub const PAYLOAD_START: usize = TARGET_END + DIVIDER_WIDTH;

/// Operations a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Forward a payload to another peer
    SendDirect,
    /// Create a new virtual peer
    CreateVPeer,
    /// Delete a virtual peer
    DeleteVPeer,
    /// Subscribe the sender to a virtual peer
    ConnectVPeer,
    /// Unsubscribe the sender from a virtual peer
    DisconnectVPeer,
    /// Replace a virtual peer's shared state
    PutState,
    /// Deep-merge into a virtual peer's shared state
    PatchState,
    /// Liveness probe
    Ping,
    /// Liveness probe answer
    Pong,
}

impl Operation {
    /// The 8-byte wire code for this operation.
    pub const fn code(self) -> &'static str {
        match self {
            Self::SendDirect => "sendPeer",
            Self::CreateVPeer => "crtVPeer",
            Self::DeleteVPeer => "delVPeer",
            Self::ConnectVPeer => "conVPeer",
            Self::DisconnectVPeer => "disVPeer",
            Self::PutState => "putState",
            Self::PatchState => "patState",
            Self::Ping => "sendPing",
            Self::Pong => "sendPong",
        }
    }

    /// Resolve a wire code. `None` means the dispatcher answers
    /// [`ProtocolError::UnknownOperation`].
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "sendPeer" => Some(Self::SendDirect),
            "crtVPeer" => Some(Self::CreateVPeer),
            "delVPeer" => Some(Self::DeleteVPeer),
            "conVPeer" => Some(Self::ConnectVPeer),
            "disVPeer" => Some(Self::DisconnectVPeer),
            "putState" => Some(Self::PutState),
            "patState" => Some(Self::PatchState),
            "sendPing" => Some(Self::Ping),
            "sendPong" => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Types of server-built outbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Direct send delivered to its target
    Send,
    /// Ping relayed to its target
    Ping,
    /// Pong relayed to its target
    Pong,
    /// Peer-id announcement (connection accept, vpeer creation)
    PeerId,
    /// Operation failure, payload is the error string
    Error,
    /// Virtual peer state changed
    StateUpdate,
    /// Operation success, payload is the affected peer id
    Success,
}

impl MessageType {
    /// The 8-byte wire code for this message type.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Send => "recvPeer",
            Self::Ping => "sendPing",
            Self::Pong => "sendPong",
            Self::PeerId => "gPeerCId",
            Self::Error => "errorMsg",
            Self::StateUpdate => "stateMut",
            Self::Success => "oprResOk",
        }
    }

    /// Resolve a wire code from an outbound frame.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "recvPeer" => Some(Self::Send),
            "sendPing" => Some(Self::Ping),
            "sendPong" => Some(Self::Pong),
            "gPeerCId" => Some(Self::PeerId),
            "errorMsg" => Some(Self::Error),
            "stateMut" => Some(Self::StateUpdate),
            "oprResOk" => Some(Self::Success),
            _ => None,
        }
    }
}

/// Protocol-level failures, reported back to the sender as the payload of an
/// [`MessageType::Error`] frame. `Display` renders the exact wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame shorter than the fixed header
    #[error("error: message too short")]
    MessageTooShort,
    /// A divider is missing from its expected offset
    #[error("error: invalid message format")]
    InvalidMessageFormat,
    /// Operation code has no handler
    #[error("error: message operation is unknown")]
    UnknownOperation,
    /// Target id is not registered
    #[error("error: target could not be located")]
    TargetNotFound,
    /// Operation requires a virtual target
    #[error("error: that target peer is not virtual")]
    PeerNotVirtual,
    /// Merged state could not be re-serialized
    #[error("error: the state string is formatted invalidly")]
    InvalidStateFormat,
}

/// A parsed inbound frame, tagged with the connection it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    /// Raw operation code (8 bytes, not yet validated)
    pub operation: String,
    /// The peer the frame arrived from (connection-assigned, not on the wire)
    pub sender: PeerId,
    /// The peer the operation addresses
    pub target: PeerId,
    /// Remainder of the frame
    pub payload: String,
}

/// A parsed outbound frame, as seen by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFrame {
    /// Raw message-type code (8 bytes)
    pub msg_type: String,
    /// The effective sender the server stamped on the frame
    pub sender: PeerId,
    /// Remainder of the frame
    pub payload: String,
}

/// Parse an inbound frame. The sender is supplied by the connection that
/// read the frame; it never appears on the wire.
pub fn parse_message(raw: &str, sender: &str) -> Result<WireMessage, ProtocolError> {
    let (operation, target, payload) = split_frame(raw)?;
    Ok(WireMessage {
        operation: operation.to_string(),
        sender: sender.to_string(),
        target: target.to_string(),
        payload: payload.to_string(),
    })
}

/// Parse an outbound frame (same layout, the middle field is the sender).
pub fn parse_server_frame(raw: &str) -> Result<ServerFrame, ProtocolError> {
    let (msg_type, sender, payload) = split_frame(raw)?;
    Ok(ServerFrame {
        msg_type: msg_type.to_string(),
        sender: sender.to_string(),
        payload: payload.to_string(),
    })
}

fn split_frame(raw: &str) -> Result<(&str, &str, &str), ProtocolError> {
    if raw.len() < PAYLOAD_START {
        return Err(ProtocolError::MessageTooShort);
    }

    let bytes = raw.as_bytes();
    if &bytes[OP_END..TARGET_START] != DIVIDER.as_bytes()
        || &bytes[TARGET_END..PAYLOAD_START] != DIVIDER.as_bytes()
    {
        return Err(ProtocolError::InvalidMessageFormat);
    }

    // The offsets are byte positions; a multi-byte char straddling a field
    // boundary makes the slice fail, which is a malformed frame.
    let operation = raw
        .get(OP_START..OP_END)
        .ok_or(ProtocolError::InvalidMessageFormat)?;
    let target = raw
        .get(TARGET_START..TARGET_END)
        .ok_or(ProtocolError::InvalidMessageFormat)?;
    let payload = raw
        .get(PAYLOAD_START..)
        .ok_or(ProtocolError::InvalidMessageFormat)?;

    Ok((operation, target, payload))
}

/// Build an outbound frame: `<type>::<sender>::<payload>`.
pub fn construct_message(msg_type: MessageType, sender: &str, payload: &str) -> String {
    format!("{}{DIVIDER}{sender}{DIVIDER}{payload}", msg_type.code())
}

/// Build an inbound operation frame: `<op>::<target>::<payload>`.
///
/// This is the client-side counterpart of [`parse_message`].
pub fn construct_operation(op: Operation, target: &str, payload: &str) -> String {
    format!("{}{DIVIDER}{target}{DIVIDER}{payload}", op.code())
}
