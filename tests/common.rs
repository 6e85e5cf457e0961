//! Test utilities & fixtures.
//! A gateway wired to an in-memory link with fast timers, plus a scripted radio that
//! speaks the default frame layout on the other end.
#![allow(dead_code)]

use std::time::Duration;

use meshchat::gateway::outbox::OutboxSettings;
use meshchat::gateway::registry::{Channel, ChannelSource};
use meshchat::gateway::{Gateway, GatewaySettings, Profile, Session, SessionEvent};
use meshchat::mesh::framer::{FrameCodec, FrameLayout, FrameReader};
use meshchat::mesh::payload::{AckPayload, NodeInfoPayload, Payload, PositionPayload, TextPayload};
use meshchat::mesh::supervisor::{BackoffPolicy, SupervisorSettings};
use meshchat::mesh::transport::MemoryConnector;
use meshchat::mesh::{ChannelId, Destination, NodeId, Packet, PacketId, PacketKind};
use meshchat::storage::{NullStore, Persistence};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::timeout;

pub const GATEWAY_ID: NodeId = 0x0a0a_0a0a;
pub const ALICE: NodeId = 0x0000_a11c;
pub const BOB: NodeId = 0x0000_0b0b;
/// Upper bound for anything that should happen "promptly" in a test.
pub const WAIT: Duration = Duration::from_secs(3);

pub fn settings() -> GatewaySettings {
    GatewaySettings {
        profile: Profile {
            node_id: GATEWAY_ID,
            display_name: "Test Gateway".to_string(),
        },
        hop_limit: 3,
        channels: vec![channel(0, "Primary"), channel(1, "Ops")],
        layout: FrameLayout::v1(),
        outbox: OutboxSettings {
            ack_timeout: Duration::from_secs(5),
            max_attempts: 3,
            max_queue: 16,
        },
        link: SupervisorSettings {
            backoff: BackoffPolicy {
                base: Duration::from_millis(10),
                max: Duration::from_millis(50),
                jitter: 0.0,
            },
            liveness_timeout: None,
            min_send_gap: Duration::ZERO,
        },
        session_queue_depth: 64,
        history_page: 50,
        flush_interval: Duration::ZERO,
    }
}

fn channel(id: ChannelId, label: &str) -> Channel {
    Channel {
        id,
        label: label.to_string(),
        encrypted: false,
        source: ChannelSource::Configured,
    }
}

/// A running gateway with one radio link plugged in and one session subscribed to
/// channels 0 and 1.
pub struct Harness {
    pub gateway: Gateway,
    pub connector: MemoryConnector,
    pub radio: Radio,
    pub session: Session,
}

pub async fn start() -> Harness {
    start_with(settings(), NullStore).await
}

pub async fn start_with<P: Persistence>(settings: GatewaySettings, store: P) -> Harness {
    let connector = MemoryConnector::new();
    let radio = Radio::new(connector.plug());
    let gateway = Gateway::spawn(settings, connector.clone(), store).expect("spawn gateway");
    let mut session = gateway.handle().attach().await.expect("attach");
    session.subscribe([0, 1]).await.expect("subscribe");
    wait_link(&mut session, true).await;
    Harness {
        gateway,
        connector,
        radio,
        session,
    }
}

/// Radio side of a [`MemoryConnector`](meshchat::mesh::transport::MemoryConnector) link.
pub struct Radio {
    stream: DuplexStream,
    codec: FrameCodec,
    reader: FrameReader,
}

impl Radio {
    pub fn new(stream: DuplexStream) -> Self {
        let codec = FrameCodec::new(FrameLayout::v1());
        Self {
            stream,
            reader: FrameReader::new(codec.clone()),
            codec,
        }
    }

    pub async fn send(&mut self, packet: &Packet) {
        let frame = self.codec.encode(packet).expect("encode");
        self.send_raw(&frame).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("radio write");
    }

    /// Next frame the gateway wrote.
    pub async fn recv(&mut self) -> Packet {
        let reader = &mut self.reader;
        let stream = &mut self.stream;
        timeout(WAIT, async {
            loop {
                if let Some(next) = reader.next_packet() {
                    return next.expect("gateway wrote a corrupt frame");
                }
                let mut buf = [0u8; 512];
                let n = stream.read(&mut buf).await.expect("radio read");
                assert!(n > 0, "gateway closed the link");
                reader.push(&buf[..n]);
            }
        })
        .await
        .expect("timed out waiting for a frame from the gateway")
    }

    pub async fn recv_text(&mut self) -> (Packet, TextPayload) {
        let packet = self.recv().await;
        assert_eq!(packet.kind, PacketKind::Text);
        match Payload::decode(packet.kind, &packet.payload, self.codec.layout()) {
            Ok(Some(Payload::Text(text))) => (packet, text),
            other => panic!("expected text payload, got {:?}", other),
        }
    }

    /// True if the gateway writes nothing for `quiet`.
    pub async fn is_silent_for(&mut self, quiet: Duration) -> bool {
        let mut buf = [0u8; 64];
        timeout(quiet, self.stream.read(&mut buf)).await.is_err()
    }
}

pub fn packet(kind: PacketKind, source: NodeId, destination: Destination, channel: ChannelId, id: PacketId, payload: &Payload) -> Packet {
    Packet {
        kind,
        source,
        destination,
        channel,
        id,
        hop_count: 2,
        signal: None,
        payload: payload.encode(&FrameLayout::v1()).expect("payload encode"),
    }
}

pub fn text(source: NodeId, destination: Destination, channel: ChannelId, id: PacketId, body: &str) -> Packet {
    let payload = Payload::Text(TextPayload {
        sent_at: 0,
        body: body.to_string(),
    });
    packet(PacketKind::Text, source, destination, channel, id, &payload)
}

/// An ack from `source` for packet `acked` that `original_sender` sent.
pub fn ack(source: NodeId, original_sender: NodeId, acked: PacketId, id: PacketId) -> Packet {
    let payload = Payload::Ack(AckPayload { acked_id: acked });
    packet(PacketKind::Ack, source, Destination::Node(original_sender), 0, id, &payload)
}

pub fn node_info(source: NodeId, long_name: &str, observed_at: u32, id: PacketId) -> Packet {
    let short: String = long_name.chars().take(4).collect();
    let payload = Payload::NodeInfo(NodeInfoPayload {
        observed_at,
        long_name: long_name.to_string(),
        short_name: short,
        channels: Vec::new(),
    });
    packet(PacketKind::NodeInfo, source, Destination::Broadcast, 0, id, &payload)
}

pub fn position(source: NodeId, time: u32, id: PacketId) -> Packet {
    let payload = Payload::Position(PositionPayload {
        time,
        latitude_i: 377_749_000,
        longitude_i: -1_224_194_000,
        altitude: 16,
    });
    packet(PacketKind::Position, source, Destination::Broadcast, 0, id, &payload)
}

/// Unix seconds `ago` seconds before now.
pub fn unix_ago(ago: i64) -> u32 {
    (chrono::Utc::now().timestamp() - ago) as u32
}

/// Skip events until one matches.
pub async fn next_matching<F>(session: &mut Session, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = session.recv().await.expect("gateway closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}

pub async fn wait_link(session: &mut Session, connected: bool) {
    next_matching(session, |e| {
        matches!(e, SessionEvent::LinkStatus { status } if status.connected == connected)
    })
    .await;
}

/// Messages delivered to `session` within `window`.
pub async fn collect_messages(session: &mut Session, window: Duration) -> Vec<meshchat::storage::messages::Message> {
    let mut out = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, session.recv()).await {
        if let SessionEvent::Message { message, .. } = event {
            out.push(message);
        }
    }
    out
}
