use thiserror::Error;

/// Errors raised while turning a packet into frame bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The encoded frame would exceed the configured maximum frame size.
    #[error("payload too large: frame would be {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A header value does not fit the field width configured for this layout.
    #[error("{field} value {value} does not fit in {width} bytes")]
    FieldOverflow {
        field: &'static str,
        value: u64,
        width: usize,
    },

    /// `PacketKind::Unknown` carrying a code that belongs to a known kind.
    #[error("kind code {0} is reserved for a known packet kind")]
    ReservedKind(u8),

    /// The typed payload could not be encoded or decoded.
    #[error("payload error: {0}")]
    Payload(#[from] PayloadError),
}

/// Errors raised by the per-kind payload codecs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("payload truncated: needed {needed} more bytes")]
    Truncated { needed: usize },

    #[error("payload contains invalid utf-8")]
    InvalidUtf8,

    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    #[error("string field longer than 255 bytes ({0})")]
    StringTooLong(usize),

    #[error("too many channels in announcement ({0})")]
    TooManyChannels(usize),
}

/// Why a frame was rejected by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorruptReason {
    /// Buffer does not start with the frame marker.
    BadMarker,
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Declared length exceeds the configured maximum frame size.
    Oversize { declared: usize },
    /// Declared length is too short to hold the fixed header.
    BadLength { declared: usize },
}

/// A discarded frame. Not fatal: the stream resynchronizes after `skipped` bytes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("corrupt frame ({reason:?}), skipped {skipped} bytes")]
pub struct CorruptFrame {
    pub reason: CorruptReason,
    pub skipped: usize,
}

/// Link-level failures. These drive the reconnection supervisor and are never fatal.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open {target}: {reason}")]
    Open { target: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("link closed by peer")]
    Closed,

    #[error("no traffic for {0:?}, link considered down")]
    LivenessTimeout(std::time::Duration),
}
