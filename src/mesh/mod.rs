//! # Mesh Radio Link Module
//!
//! This module owns everything between the radio device and the gateway core:
//! the byte-level transport, the binary frame codec, the typed payloads carried
//! inside frames, and the supervisor that keeps the link alive.
//!
//! ## Features
//!
//! - **Transport Adapters**: USB/UART serial devices and TCP-attached radios, plus an
//!   in-memory loopback used for testing and offline runs
//! - **Frame Codec**: Length-prefixed, checksummed frames with a configuration-driven
//!   field layout so the gateway can follow firmware protocol revisions
//! - **Resynchronization**: Corrupt frames are discarded and the stream realigns on the
//!   next frame marker
//! - **Reconnection**: Exponential backoff with jitter, liveness detection, and ordered
//!   retransmission of queued messages once the link returns
//!
//! ## Data Flow
//!
//! ```text
//! radio ──bytes──▶ LinkReader ──▶ FrameReader ──Packet──▶ gateway core
//! radio ◀──bytes── LinkWriter ◀── OutboundFrame ◀──────── gateway core
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [transport]
//! kind = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [codec]
//! magic = "94c3"
//! node_id_width = 4
//! checksum = "crc16-ccitt"
//! ```

pub mod errors;
pub mod framer;
pub mod payload;
pub mod supervisor;
pub mod transport;

use serde::{Deserialize, Serialize};

pub use errors::{CodecError, CorruptFrame, CorruptReason, PayloadError, TransportError};
pub use framer::{ChecksumKind, Decoded, FrameCodec, FrameLayout, FrameReader};
pub use payload::Payload;

/// Mesh-assigned node number. Wide enough for every supported id width.
pub type NodeId = u64;
/// Channel index as announced by the radio.
pub type ChannelId = u16;
/// Protocol-assigned packet identifier used for deduplication and ack correlation.
pub type PacketId = u32;

/// Packet addressing: everyone on the channel, or a single node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    Broadcast,
    Node(NodeId),
}

/// Packet classification carried in the frame header.
///
/// Codes the gateway does not understand are preserved as `Unknown` so newer
/// firmware traffic can be logged and skipped instead of treated as corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacketKind {
    NodeInfo,
    Position,
    Telemetry,
    Text,
    Ack,
    Unknown(u8),
}

impl PacketKind {
    pub fn code(self) -> u8 {
        match self {
            PacketKind::NodeInfo => 1,
            PacketKind::Position => 2,
            PacketKind::Telemetry => 3,
            PacketKind::Text => 4,
            PacketKind::Ack => 5,
            PacketKind::Unknown(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => PacketKind::NodeInfo,
            2 => PacketKind::Position,
            3 => PacketKind::Telemetry,
            4 => PacketKind::Text,
            5 => PacketKind::Ack,
            other => PacketKind::Unknown(other),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PacketKind::NodeInfo => "nodeinfo",
            PacketKind::Position => "position",
            PacketKind::Telemetry => "telemetry",
            PacketKind::Text => "text",
            PacketKind::Ack => "ack",
            PacketKind::Unknown(_) => "unknown",
        }
    }
}

/// Receive-side signal metrics reported by the radio for the last hop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalQuality {
    /// dBm
    pub rssi: i16,
    /// dB, quarter-dB resolution on the wire
    pub snr: f32,
}

/// One decoded frame. Transient: the dispatcher consumes it and never stores it as-is.
///
/// A packet survives an encode/decode round trip unchanged when its ids fit the layout,
/// `kind` is not `Unknown` with a known code, and `signal` is either `None` or has a
/// non-zero rssi and an snr on the quarter-dB grid within -32..=31.75. Layouts without
/// signal fields always decode `signal` as `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub source: NodeId,
    pub destination: Destination,
    pub channel: ChannelId,
    pub id: PacketId,
    pub hop_count: u8,
    pub signal: Option<SignalQuality>,
    pub payload: Vec<u8>,
}

/// Meshtastic-style node label (`!1a2b3c4d`) used in logs and as a display fallback.
pub fn format_node_id(id: NodeId) -> String {
    if id <= u32::MAX as u64 {
        format!("!{:08x}", id)
    } else {
        format!("!{:016x}", id)
    }
}
