use thiserror::Error;

use crate::mesh::{ChannelId, CodecError, NodeId};

/// Failures surfaced to the client that made a request. Link and frame faults never
/// show up here; they are recovered inside the supervisor.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The outbound frame could not be built; the message is marked failed.
    #[error("encode error: {0}")]
    Encode(#[from] CodecError),

    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("invalid message body: {0}")]
    InvalidBody(String),

    #[error("invalid display name: {0}")]
    InvalidName(String),

    /// The outbound queue is at capacity. Already queued messages are unaffected.
    #[error("outbound queue full ({0} messages waiting)")]
    QueueFull(usize),

    /// Every packet id the frame layout allows is already taken by this node.
    #[error("no free packet id ({0} in use)")]
    PacketIdsExhausted(usize),

    #[error("not found: {0}")]
    NotFound(String),

    /// The gateway core has shut down.
    #[error("gateway closed")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("node !{0:08x} not found")]
    NodeNotFound(NodeId),
}

impl From<RegistryError> for GatewayError {
    fn from(e: RegistryError) -> Self {
        GatewayError::NotFound(e.to_string())
    }
}
