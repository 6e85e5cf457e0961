//! Length-prefixed, checksummed frame codec for the radio serial/TCP link.
//!
//! A frame on the wire is:
//!
//!   `<magic><length><kind><source><dest><channel><packet id><hops>[<rssi><snr>]<payload><checksum>`
//!
//! Every field width is taken from a [`FrameLayout`] instead of being hard-coded, because the
//! layout belongs to the radio firmware and changes between protocol revisions. `length`
//! counts the bytes from `kind` through the end of the payload; the checksum covers the same
//! span.
//!
//! [`FrameReader`] is the incremental side: feed it arbitrary chunks and it yields whole
//! packets. On a corrupt frame it drops one byte and realigns on the next magic marker.
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_ARC, CRC_16_IBM_3740, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

use super::errors::{CodecError, CorruptFrame, CorruptReason};
use super::{Destination, Packet, PacketKind, SignalQuality};

const CRC16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const CRC16_ARC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Frame trailer checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumKind {
    #[serde(rename = "crc16-ccitt")]
    Crc16Ccitt,
    #[serde(rename = "crc16-arc")]
    Crc16Arc,
    #[serde(rename = "crc32")]
    Crc32,
}

impl ChecksumKind {
    pub fn width(self) -> usize {
        match self {
            ChecksumKind::Crc16Ccitt | ChecksumKind::Crc16Arc => 2,
            ChecksumKind::Crc32 => 4,
        }
    }

    pub fn compute(self, data: &[u8]) -> u32 {
        match self {
            ChecksumKind::Crc16Ccitt => CRC16_CCITT.checksum(data) as u32,
            ChecksumKind::Crc16Arc => CRC16_ARC.checksum(data) as u32,
            ChecksumKind::Crc32 => CRC32.checksum(data),
        }
    }
}

/// Field widths and limits of one firmware protocol revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameLayout {
    pub version: u8,
    /// Start-of-frame marker. May be empty, in which case resync is byte-by-byte.
    pub magic: Vec<u8>,
    pub length_width: usize,
    pub node_id_width: usize,
    pub channel_width: usize,
    pub packet_id_width: usize,
    /// Whether the header carries rssi (i16) and snr (i8, quarter dB).
    pub signal_fields: bool,
    pub checksum: ChecksumKind,
    /// Upper bound for a whole frame including marker, length and checksum.
    pub max_frame_size: usize,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self::v1()
    }
}

impl FrameLayout {
    /// Standard layout: 32-bit node and packet ids, one-byte channel index.
    pub fn v1() -> Self {
        Self {
            version: 1,
            magic: vec![0x94, 0xC3],
            length_width: 2,
            node_id_width: 4,
            channel_width: 1,
            packet_id_width: 4,
            signal_fields: true,
            checksum: ChecksumKind::Crc16Ccitt,
            max_frame_size: 256,
        }
    }

    /// Bytes from `kind` through the hop count (and signal fields when present).
    pub fn header_len(&self) -> usize {
        1 + 2 * self.node_id_width
            + self.channel_width
            + self.packet_id_width
            + 1
            + if self.signal_fields { 3 } else { 0 }
    }

    /// Bytes a frame needs besides its payload.
    pub fn overhead(&self) -> usize {
        self.magic.len() + self.length_width + self.header_len() + self.checksum.width()
    }

    /// Largest payload that still fits in `max_frame_size`.
    pub fn max_payload(&self) -> usize {
        self.max_frame_size.saturating_sub(self.overhead())
    }

    /// Destination value reserved for broadcast: all ones at the node id width.
    pub fn broadcast_id(&self) -> u64 {
        max_for_width(self.node_id_width)
    }

    pub fn validate(&self) -> Result<(), String> {
        if ![1, 2, 4].contains(&self.length_width) {
            return Err(format!("length_width must be 1, 2 or 4 (got {})", self.length_width));
        }
        if !(1..=8).contains(&self.node_id_width) {
            return Err(format!("node_id_width must be 1..=8 (got {})", self.node_id_width));
        }
        if ![1, 2].contains(&self.channel_width) {
            return Err(format!("channel_width must be 1 or 2 (got {})", self.channel_width));
        }
        if ![2, 4].contains(&self.packet_id_width) {
            return Err(format!(
                "packet_id_width must be 2 or 4 (got {})",
                self.packet_id_width
            ));
        }
        if self.magic.len() > 8 {
            return Err("magic marker longer than 8 bytes".to_string());
        }
        if self.max_frame_size <= self.overhead() {
            return Err(format!(
                "max_frame_size {} leaves no room for payload (overhead {})",
                self.max_frame_size,
                self.overhead()
            ));
        }
        let body_max = self.max_frame_size - self.magic.len() - self.length_width;
        if body_max as u64 > max_for_width(self.length_width) + self.checksum.width() as u64 {
            return Err(format!(
                "max_frame_size {} not expressible with a {}-byte length field",
                self.max_frame_size, self.length_width
            ));
        }
        Ok(())
    }
}

fn max_for_width(width: usize) -> u64 {
    if width >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * width)) - 1
    }
}

/// Outcome of one decode attempt at the front of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A valid frame; `consumed` bytes belong to it.
    Packet { packet: Packet, consumed: usize },
    /// Not an error: buffer more bytes and try again.
    Incomplete,
    /// Frame rejected; drop `skipped` bytes and rescan.
    Corrupt(CorruptFrame),
}

/// Stateless encoder/decoder for one [`FrameLayout`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    layout: FrameLayout,
}

impl FrameCodec {
    pub fn new(layout: FrameLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Serialize a packet into a complete frame.
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, CodecError> {
        let l = &self.layout;
        if let PacketKind::Unknown(code) = packet.kind {
            if !matches!(PacketKind::from_code(code), PacketKind::Unknown(_)) {
                return Err(CodecError::ReservedKind(code));
            }
        }
        let dest = match packet.destination {
            Destination::Broadcast => l.broadcast_id(),
            Destination::Node(id) => id,
        };
        check_width("source", packet.source, l.node_id_width)?;
        check_width("destination", dest, l.node_id_width)?;
        if packet.destination != Destination::Broadcast && dest == l.broadcast_id() {
            // A unicast id equal to the broadcast marker would decode as broadcast.
            return Err(CodecError::FieldOverflow {
                field: "destination",
                value: dest,
                width: l.node_id_width,
            });
        }
        check_width("channel", packet.channel as u64, l.channel_width)?;
        check_width("packet id", packet.id as u64, l.packet_id_width)?;

        let size = l.overhead() + packet.payload.len();
        if size > l.max_frame_size {
            return Err(CodecError::PayloadTooLarge {
                size,
                max: l.max_frame_size,
            });
        }

        let mut body = Vec::with_capacity(l.header_len() + packet.payload.len());
        body.put_u8(packet.kind.code());
        body.put_uint(packet.source, l.node_id_width);
        body.put_uint(dest, l.node_id_width);
        body.put_uint(packet.channel as u64, l.channel_width);
        body.put_uint(packet.id as u64, l.packet_id_width);
        body.put_u8(packet.hop_count);
        if l.signal_fields {
            // rssi 0 means "not reported"
            let (rssi, snr) = match packet.signal {
                Some(s) => (s.rssi, (s.snr * 4.0).round().clamp(-128.0, 127.0) as i8),
                None => (0, 0),
            };
            body.put_i16(rssi);
            body.put_i8(snr);
        }
        body.extend_from_slice(&packet.payload);
        check_width("length", body.len() as u64, l.length_width)?;

        let mut frame = Vec::with_capacity(size);
        frame.extend_from_slice(&l.magic);
        frame.put_uint(body.len() as u64, l.length_width);
        frame.extend_from_slice(&body);
        frame.put_uint(l.checksum.compute(&body) as u64, l.checksum.width());
        Ok(frame)
    }

    /// Try to decode one frame starting at `buf[0]`.
    pub fn decode(&self, buf: &[u8]) -> Decoded {
        let l = &self.layout;
        let magic_len = l.magic.len();

        let probe = buf.len().min(magic_len);
        if buf[..probe] != l.magic[..probe] {
            return Decoded::Corrupt(CorruptFrame {
                reason: CorruptReason::BadMarker,
                skipped: 1,
            });
        }
        if buf.len() < magic_len + l.length_width {
            return Decoded::Incomplete;
        }

        let declared = (&buf[magic_len..]).get_uint(l.length_width) as usize;
        if declared < l.header_len() {
            return Decoded::Corrupt(CorruptFrame {
                reason: CorruptReason::BadLength { declared },
                skipped: 1,
            });
        }
        let total = magic_len + l.length_width + declared + l.checksum.width();
        if total > l.max_frame_size {
            return Decoded::Corrupt(CorruptFrame {
                reason: CorruptReason::Oversize { declared },
                skipped: 1,
            });
        }
        if buf.len() < total {
            return Decoded::Incomplete;
        }

        let body_start = magic_len + l.length_width;
        let body = &buf[body_start..body_start + declared];
        let expected = (&buf[body_start + declared..total]).get_uint(l.checksum.width()) as u32;
        let actual = l.checksum.compute(body);
        if expected != actual {
            return Decoded::Corrupt(CorruptFrame {
                reason: CorruptReason::ChecksumMismatch { expected, actual },
                skipped: 1,
            });
        }

        let mut cur = body;
        let kind = PacketKind::from_code(cur.get_u8());
        let source = cur.get_uint(l.node_id_width);
        let dest = cur.get_uint(l.node_id_width);
        let channel = cur.get_uint(l.channel_width) as u16;
        let id = cur.get_uint(l.packet_id_width) as u32;
        let hop_count = cur.get_u8();
        let signal = if l.signal_fields {
            let rssi = cur.get_i16();
            let snr = cur.get_i8();
            (rssi != 0).then(|| SignalQuality {
                rssi,
                snr: snr as f32 / 4.0,
            })
        } else {
            None
        };
        let destination = if dest == l.broadcast_id() {
            Destination::Broadcast
        } else {
            Destination::Node(dest)
        };

        Decoded::Packet {
            packet: Packet {
                kind,
                source,
                destination,
                channel,
                id,
                hop_count,
                signal,
                payload: cur.to_vec(),
            },
            consumed: total,
        }
    }
}

fn check_width(field: &'static str, value: u64, width: usize) -> Result<(), CodecError> {
    if value > max_for_width(width) {
        return Err(CodecError::FieldOverflow {
            field,
            value,
            width,
        });
    }
    Ok(())
}

/// Incremental framer: push arbitrary chunks, pull whole packets.
pub struct FrameReader {
    codec: FrameCodec,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buf: BytesMut::with_capacity(4096),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered and not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next packet or corrupt-frame report, or `None` when more bytes are needed.
    pub fn next_packet(&mut self) -> Option<Result<Packet, CorruptFrame>> {
        loop {
            if !self.align() {
                return None;
            }
            match self.codec.decode(&self.buf) {
                Decoded::Packet { packet, consumed } => {
                    self.buf.advance(consumed);
                    return Some(Ok(packet));
                }
                Decoded::Incomplete => return None,
                Decoded::Corrupt(c) if c.reason == CorruptReason::BadMarker => {
                    // align() guarantees a marker prefix; only reachable for partial markers
                    self.buf.advance(c.skipped);
                    continue;
                }
                Decoded::Corrupt(c) => {
                    self.buf.advance(c.skipped.min(self.buf.len()));
                    return Some(Err(c));
                }
            }
        }
    }

    /// Drop noise before the next marker. Returns false when nothing decodable is buffered.
    fn align(&mut self) -> bool {
        let magic = &self.codec.layout.magic;
        if self.buf.is_empty() {
            return false;
        }
        if magic.is_empty() {
            return true;
        }
        if let Some(pos) = self.buf.windows(magic.len()).position(|w| w == magic.as_slice()) {
            if pos > 0 {
                self.buf.advance(pos);
            }
            return true;
        }
        // Keep a tail that may be the start of a marker split across reads
        let keep = (1..magic.len())
            .rev()
            .find(|&n| n <= self.buf.len() && self.buf[self.buf.len() - n..] == magic[..n])
            .unwrap_or(0);
        let drop = self.buf.len() - keep;
        self.buf.advance(drop);
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_packet(id: u32) -> Packet {
        Packet {
            kind: PacketKind::Text,
            source: 0x1a2b3c4d,
            destination: Destination::Broadcast,
            channel: 0,
            id,
            hop_count: 3,
            signal: Some(SignalQuality {
                rssi: -97,
                snr: 6.25,
            }),
            payload: b"\0\0\0\0hello mesh".to_vec(),
        }
    }

    fn compact() -> FrameLayout {
        FrameLayout {
            version: 2,
            magic: vec![0xAA],
            length_width: 1,
            node_id_width: 2,
            channel_width: 1,
            packet_id_width: 2,
            signal_fields: false,
            checksum: ChecksumKind::Crc16Arc,
            max_frame_size: 200,
        }
    }

    #[test]
    fn roundtrip_default_layout() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let p = text_packet(0xDEADBEEF);
        let bytes = codec.encode(&p).unwrap();
        assert_eq!(&bytes[..2], &[0x94, 0xC3]);
        match codec.decode(&bytes) {
            Decoded::Packet { packet, consumed } => {
                assert_eq!(packet, p);
                assert_eq!(consumed, bytes.len());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn roundtrip_compact_layout_with_direct_destination() {
        let codec = FrameCodec::new(compact());
        let p = Packet {
            kind: PacketKind::Ack,
            source: 0x0102,
            destination: Destination::Node(0x0304),
            channel: 2,
            id: 0xBEEF,
            hop_count: 1,
            signal: None,
            payload: vec![0xBE, 0xEF],
        };
        let bytes = codec.encode(&p).unwrap();
        assert_eq!(bytes.len(), compact().overhead() + 2);
        assert!(matches!(codec.decode(&bytes), Decoded::Packet { packet, .. } if packet == p));
    }

    #[test]
    fn every_strict_prefix_is_incomplete() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let bytes = codec.encode(&text_packet(9)).unwrap();
        for n in 1..bytes.len() {
            assert_eq!(codec.decode(&bytes[..n]), Decoded::Incomplete, "prefix {}", n);
        }
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let mut bytes = codec.encode(&text_packet(9)).unwrap();
        let last = bytes.len() - 5;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            codec.decode(&bytes),
            Decoded::Corrupt(CorruptFrame {
                reason: CorruptReason::ChecksumMismatch { .. },
                skipped: 1
            })
        ));
    }

    #[test]
    fn oversize_declared_length_is_rejected_before_buffering() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let bytes = [0x94, 0xC3, 0xFF, 0xFF];
        assert!(matches!(
            codec.decode(&bytes),
            Decoded::Corrupt(CorruptFrame {
                reason: CorruptReason::Oversize { declared: 0xFFFF },
                ..
            })
        ));
    }

    #[test]
    fn payload_too_large() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let mut p = text_packet(1);
        p.payload = vec![b'x'; FrameLayout::v1().max_payload() + 1];
        assert!(matches!(
            codec.encode(&p),
            Err(CodecError::PayloadTooLarge { max: 256, .. })
        ));
        p.payload.pop();
        assert_eq!(codec.encode(&p).unwrap().len(), 256);
    }

    #[test]
    fn field_overflow_on_narrow_layout() {
        let codec = FrameCodec::new(compact());
        let mut p = text_packet(1);
        p.signal = None;
        assert!(matches!(
            codec.encode(&p),
            Err(CodecError::FieldOverflow { field: "source", .. })
        ));
        p.source = 1;
        p.destination = Destination::Node(0xFFFF);
        assert!(matches!(
            codec.encode(&p),
            Err(CodecError::FieldOverflow {
                field: "destination",
                ..
            })
        ));
    }

    #[test]
    fn unknown_kind_survives_decode() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let mut p = text_packet(3);
        p.kind = PacketKind::Unknown(77);
        let bytes = codec.encode(&p).unwrap();
        assert!(matches!(codec.decode(&bytes), Decoded::Packet { packet, .. } if packet.kind == PacketKind::Unknown(77)));
    }

    #[test]
    fn reader_skips_noise_and_handles_split_marker() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let bytes = codec.encode(&text_packet(5)).unwrap();
        let mut reader = FrameReader::new(codec);
        reader.push(b"INFO | boot ok\r\n");
        reader.push(&bytes[..1]);
        assert!(reader.next_packet().is_none());
        assert_eq!(reader.buffered(), 1);
        reader.push(&bytes[1..]);
        let p = reader.next_packet().unwrap().unwrap();
        assert_eq!(p.id, 5);
        assert!(reader.next_packet().is_none());
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn reader_resyncs_after_corrupt_frame() {
        let codec = FrameCodec::new(FrameLayout::v1());
        let mut bad = codec.encode(&text_packet(1)).unwrap();
        let mid = bad.len() / 2;
        bad[mid] ^= 0x5A;
        let good_a = codec.encode(&text_packet(2)).unwrap();
        let good_b = codec.encode(&text_packet(3)).unwrap();

        let mut reader = FrameReader::new(codec);
        reader.push(&good_a);
        reader.push(&bad);
        reader.push(&good_b);

        let mut ids = Vec::new();
        let mut corrupt = 0;
        while let Some(item) = reader.next_packet() {
            match item {
                Ok(p) => ids.push(p.id),
                Err(_) => corrupt += 1,
            }
        }
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(corrupt, 1);
    }

    #[test]
    fn layout_validation() {
        assert!(FrameLayout::v1().validate().is_ok());
        assert!(compact().validate().is_ok());
        let mut l = FrameLayout::v1();
        l.length_width = 3;
        assert!(l.validate().is_err());
        let mut l = FrameLayout::v1();
        l.max_frame_size = 10;
        assert!(l.validate().is_err());
        let mut l = compact();
        l.max_frame_size = 1000;
        assert!(l.validate().is_err());
    }
}
