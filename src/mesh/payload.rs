//! Typed payloads carried inside frames, one encoding per [`PacketKind`].
//!
//! All integers are big-endian. Strings are a one-byte length followed by UTF-8.
//! Widths that are shared with the frame header (packet ids, channel ids) follow the
//! active [`FrameLayout`].
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use super::errors::PayloadError;
use super::framer::FrameLayout;
use super::{ChannelId, PacketId, PacketKind};

/// Chat text. `sent_at` is unix seconds from the originator's clock, 0 if unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPayload {
    pub sent_at: u32,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub acked_id: PacketId,
}

/// A channel advertised by a node in its NodeInfo announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnouncedChannel {
    pub id: ChannelId,
    pub label: String,
    pub encrypted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfoPayload {
    pub observed_at: u32,
    pub long_name: String,
    pub short_name: String,
    pub channels: Vec<AnnouncedChannel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionPayload {
    pub time: u32,
    /// 1e-7 degrees
    pub latitude_i: i32,
    /// 1e-7 degrees
    pub longitude_i: i32,
    /// metres
    pub altitude: i32,
}

impl PositionPayload {
    pub fn latitude(&self) -> f64 {
        self.latitude_i as f64 * 1e-7
    }

    pub fn longitude(&self) -> f64 {
        self.longitude_i as f64 * 1e-7
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryPayload {
    pub time: u32,
    /// 0-100, 101 when running on external power
    pub battery_level: u8,
    pub voltage_mv: u16,
    pub channel_utilization: u8,
    pub air_util_tx: u8,
    pub uptime_seconds: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    NodeInfo(NodeInfoPayload),
    Position(PositionPayload),
    Telemetry(TelemetryPayload),
    Text(TextPayload),
    Ack(AckPayload),
}

impl Payload {
    pub fn kind(&self) -> PacketKind {
        match self {
            Payload::NodeInfo(_) => PacketKind::NodeInfo,
            Payload::Position(_) => PacketKind::Position,
            Payload::Telemetry(_) => PacketKind::Telemetry,
            Payload::Text(_) => PacketKind::Text,
            Payload::Ack(_) => PacketKind::Ack,
        }
    }

    /// Decode the payload of a known kind. Returns `Ok(None)` for unknown kinds.
    pub fn decode(
        kind: PacketKind,
        data: &[u8],
        layout: &FrameLayout,
    ) -> Result<Option<Payload>, PayloadError> {
        let mut cur = data;
        let payload = match kind {
            PacketKind::Text => {
                let sent_at = take_u32(&mut cur)?;
                let body = std::str::from_utf8(cur)
                    .map_err(|_| PayloadError::InvalidUtf8)?
                    .to_string();
                cur = &[];
                Payload::Text(TextPayload { sent_at, body })
            }
            PacketKind::Ack => {
                need(&cur, layout.packet_id_width)?;
                Payload::Ack(AckPayload {
                    acked_id: cur.get_uint(layout.packet_id_width) as PacketId,
                })
            }
            PacketKind::NodeInfo => {
                let observed_at = take_u32(&mut cur)?;
                let long_name = take_str(&mut cur)?;
                let short_name = take_str(&mut cur)?;
                need(&cur, 1)?;
                let count = cur.get_u8() as usize;
                let mut channels = Vec::with_capacity(count);
                for _ in 0..count {
                    need(&cur, layout.channel_width + 1)?;
                    let id = cur.get_uint(layout.channel_width) as ChannelId;
                    let flags = cur.get_u8();
                    let label = take_str(&mut cur)?;
                    channels.push(AnnouncedChannel {
                        id,
                        label,
                        encrypted: flags & 0x01 != 0,
                    });
                }
                Payload::NodeInfo(NodeInfoPayload {
                    observed_at,
                    long_name,
                    short_name,
                    channels,
                })
            }
            PacketKind::Position => {
                need(&cur, 16)?;
                Payload::Position(PositionPayload {
                    time: cur.get_u32(),
                    latitude_i: cur.get_i32(),
                    longitude_i: cur.get_i32(),
                    altitude: cur.get_i32(),
                })
            }
            PacketKind::Telemetry => {
                need(&cur, 13)?;
                Payload::Telemetry(TelemetryPayload {
                    time: cur.get_u32(),
                    battery_level: cur.get_u8(),
                    voltage_mv: cur.get_u16(),
                    channel_utilization: cur.get_u8(),
                    air_util_tx: cur.get_u8(),
                    uptime_seconds: cur.get_u32(),
                })
            }
            PacketKind::Unknown(_) => return Ok(None),
        };
        if !cur.is_empty() {
            return Err(PayloadError::TrailingBytes(cur.len()));
        }
        Ok(Some(payload))
    }

    pub fn encode(&self, layout: &FrameLayout) -> Result<Vec<u8>, PayloadError> {
        let mut out = Vec::with_capacity(32);
        match self {
            Payload::Text(t) => {
                out.put_u32(t.sent_at);
                out.extend_from_slice(t.body.as_bytes());
            }
            Payload::Ack(a) => out.put_uint(a.acked_id as u64, layout.packet_id_width),
            Payload::NodeInfo(n) => {
                out.put_u32(n.observed_at);
                put_str(&mut out, &n.long_name)?;
                put_str(&mut out, &n.short_name)?;
                if n.channels.len() > u8::MAX as usize {
                    return Err(PayloadError::TooManyChannels(n.channels.len()));
                }
                out.put_u8(n.channels.len() as u8);
                for ch in &n.channels {
                    out.put_uint(ch.id as u64, layout.channel_width);
                    out.put_u8(if ch.encrypted { 0x01 } else { 0x00 });
                    put_str(&mut out, &ch.label)?;
                }
            }
            Payload::Position(p) => {
                out.put_u32(p.time);
                out.put_i32(p.latitude_i);
                out.put_i32(p.longitude_i);
                out.put_i32(p.altitude);
            }
            Payload::Telemetry(t) => {
                out.put_u32(t.time);
                out.put_u8(t.battery_level);
                out.put_u16(t.voltage_mv);
                out.put_u8(t.channel_utilization);
                out.put_u8(t.air_util_tx);
                out.put_u32(t.uptime_seconds);
            }
        }
        Ok(out)
    }

    /// Short one-line description for trace logs.
    pub fn summary(&self) -> String {
        match self {
            Payload::Text(t) => format!("text {} bytes", t.body.len()),
            Payload::Ack(a) => format!("ack id=0x{:08x}", a.acked_id),
            Payload::NodeInfo(n) => {
                let ln = n.long_name.trim();
                let sn = n.short_name.trim();
                match (ln.is_empty(), sn.is_empty()) {
                    (false, false) => format!("user {} ({})", ln, sn),
                    (true, true) => "user".to_string(),
                    _ => format!("user {}{}", ln, sn),
                }
            }
            Payload::Position(p) => format!(
                "position lat={:.5} lon={:.5} alt={}m",
                p.latitude(),
                p.longitude(),
                p.altitude
            ),
            Payload::Telemetry(t) => {
                let mut parts = Vec::new();
                if t.battery_level > 100 {
                    parts.push("batt=ext".to_string());
                } else {
                    parts.push(format!("batt={}%", t.battery_level));
                }
                parts.push(format!("v={:.2}V", t.voltage_mv as f32 / 1000.0));
                parts.push(format!("util={}%", t.channel_utilization));
                parts.push(format!("tx={}%", t.air_util_tx));
                parts.push(format!("up={}s", t.uptime_seconds));
                format!("telemetry/device {}", parts.join(" "))
            }
        }
    }
}

fn need(cur: &&[u8], n: usize) -> Result<(), PayloadError> {
    if cur.remaining() < n {
        return Err(PayloadError::Truncated {
            needed: n - cur.remaining(),
        });
    }
    Ok(())
}

fn take_u32(cur: &mut &[u8]) -> Result<u32, PayloadError> {
    need(cur, 4)?;
    Ok(cur.get_u32())
}

fn take_str(cur: &mut &[u8]) -> Result<String, PayloadError> {
    need(cur, 1)?;
    let len = cur.get_u8() as usize;
    need(cur, len)?;
    let s = std::str::from_utf8(&cur[..len])
        .map_err(|_| PayloadError::InvalidUtf8)?
        .to_string();
    cur.advance(len);
    Ok(s)
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), PayloadError> {
    if s.len() > u8::MAX as usize {
        return Err(PayloadError::StringTooLong(s.len()));
    }
    out.put_u8(s.len() as u8);
    out.extend_from_slice(s.as_bytes());
    Ok(())
}
