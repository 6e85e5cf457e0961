//! Frame codec behaviour at the byte-stream level: resync after garbage, checksum
//! rejection, unknown kinds, and encode-side limits.

use meshchat::mesh::framer::{FrameCodec, FrameLayout, FrameReader};
use meshchat::mesh::payload::{Payload, TextPayload};
use meshchat::mesh::{
    ChecksumKind, CodecError, CorruptReason, Destination, Packet, PacketKind, SignalQuality,
};

fn text_packet(id: u32, body: &str) -> Packet {
    let layout = FrameLayout::v1();
    Packet {
        kind: PacketKind::Text,
        source: 0x1234_5678,
        destination: Destination::Node(0x0a0a_0a0a),
        channel: 1,
        id,
        hop_count: 3,
        signal: Some(SignalQuality {
            rssi: -97,
            snr: 6.25,
        }),
        payload: Payload::Text(TextPayload {
            sent_at: 1_700_000_000,
            body: body.to_string(),
        })
        .encode(&layout)
        .expect("payload"),
    }
}

#[test]
fn resyncs_after_garbage_and_corrupt_frames() {
    let codec = FrameCodec::new(FrameLayout::v1());
    let first = codec.encode(&text_packet(1, "first")).unwrap();
    let mut damaged = codec.encode(&text_packet(2, "damaged")).unwrap();
    let last = damaged.len() - 1;
    damaged[last] ^= 0xFF;
    let third = codec.encode(&text_packet(3, "third")).unwrap();

    let mut stream = vec![0x00, 0x94, 0x13, 0x37];
    stream.extend_from_slice(&first);
    stream.extend_from_slice(&damaged);
    stream.extend_from_slice(&[0xC3, 0x94]);
    stream.extend_from_slice(&third);

    let mut reader = FrameReader::new(codec);
    let mut ids = Vec::new();
    let mut checksum_failures = 0;
    // Feed in small chunks so frames straddle reads
    for chunk in stream.chunks(5) {
        reader.push(chunk);
        while let Some(next) = reader.next_packet() {
            match next {
                Ok(packet) => ids.push(packet.id),
                Err(corrupt) => {
                    if matches!(corrupt.reason, CorruptReason::ChecksumMismatch { .. }) {
                        checksum_failures += 1;
                    }
                }
            }
        }
    }
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(checksum_failures, 1);
}

#[test]
fn decoded_packet_keeps_header_fields() {
    let codec = FrameCodec::new(FrameLayout::v1());
    let original = text_packet(0xdead_beef, "hello mesh");
    let mut reader = FrameReader::new(codec.clone());
    reader.push(&codec.encode(&original).unwrap());
    let decoded = reader.next_packet().unwrap().unwrap();
    assert_eq!(decoded, original);
    assert_eq!(reader.buffered(), 0);
}

#[test]
fn unknown_kind_is_a_packet_not_corruption() {
    let codec = FrameCodec::new(FrameLayout::v1());
    let mut packet = text_packet(9, "x");
    packet.kind = PacketKind::Unknown(0x42);
    packet.payload = vec![1, 2, 3];
    let mut reader = FrameReader::new(codec.clone());
    reader.push(&codec.encode(&packet).unwrap());
    let decoded = reader.next_packet().unwrap().unwrap();
    assert_eq!(decoded.kind, PacketKind::Unknown(0x42));
    assert_eq!(decoded.payload, vec![1, 2, 3]);
}

#[test]
fn unknown_kind_with_known_code_is_rejected() {
    let codec = FrameCodec::new(FrameLayout::v1());
    let mut packet = text_packet(10, "x");
    packet.kind = PacketKind::Unknown(4);
    assert_eq!(codec.encode(&packet), Err(CodecError::ReservedKind(4)));
}

#[test]
fn signal_is_quantised_on_the_wire() {
    let codec = FrameCodec::new(FrameLayout::v1());
    let mut reader = FrameReader::new(codec.clone());

    let mut coarse = text_packet(11, "snr");
    coarse.signal = Some(SignalQuality { rssi: -80, snr: 6.1 });
    reader.push(&codec.encode(&coarse).unwrap());
    let decoded = reader.next_packet().unwrap().unwrap();
    assert_eq!(decoded.signal, Some(SignalQuality { rssi: -80, snr: 6.0 }));

    let mut silent = text_packet(12, "rssi");
    silent.signal = Some(SignalQuality { rssi: 0, snr: 2.5 });
    reader.push(&codec.encode(&silent).unwrap());
    assert_eq!(reader.next_packet().unwrap().unwrap().signal, None);
}

#[test]
fn encode_enforces_frame_limits() {
    let layout = FrameLayout::v1();
    let codec = FrameCodec::new(layout.clone());
    let mut big = text_packet(1, "");
    big.payload = vec![b'a'; layout.max_payload() + 1];
    assert!(matches!(
        codec.encode(&big),
        Err(CodecError::PayloadTooLarge { .. })
    ));

    let mut exact = text_packet(1, "");
    exact.payload = vec![b'a'; layout.max_payload()];
    assert_eq!(codec.encode(&exact).unwrap().len(), layout.max_frame_size);

    let narrow = FrameCodec::new(FrameLayout {
        node_id_width: 2,
        ..FrameLayout::v1()
    });
    assert!(matches!(
        narrow.encode(&text_packet(1, "hi")),
        Err(CodecError::FieldOverflow { .. })
    ));
}

#[test]
fn alternate_layout_round_trips() {
    let layout = FrameLayout {
        version: 2,
        magic: vec![0xAA],
        length_width: 1,
        node_id_width: 4,
        channel_width: 2,
        packet_id_width: 4,
        signal_fields: false,
        checksum: ChecksumKind::Crc32,
        max_frame_size: 200,
    };
    layout.validate().unwrap();
    let codec = FrameCodec::new(layout);
    let mut packet = text_packet(77, "compact");
    packet.signal = None;
    packet.channel = 300;
    let mut reader = FrameReader::new(codec.clone());
    reader.push(&codec.encode(&packet).unwrap());
    assert_eq!(reader.next_packet().unwrap().unwrap(), packet);
}
