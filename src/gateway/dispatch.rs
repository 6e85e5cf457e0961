//! Packet dispatcher: classify each decoded packet and apply it to the registry and
//! message store.
//!
//! Runs only inside the gateway core task, so mutations are serialized without locks.
//! `dispatch` reports what changed; the core turns those changes into session events.
use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, trace, warn};

use super::registry::{Node, NodeUpdate, Registry};
use crate::logutil::{escape_log, truncate_for_log};
use crate::mesh::framer::FrameLayout;
use crate::mesh::payload::{Payload, TextPayload};
use crate::mesh::{format_node_id, Destination, NodeId, Packet, PacketKind};
use crate::metrics;
use crate::storage::messages::{
    Cursor, DedupKey, DeliveryState, Message, MessageStore, RecordOutcome,
};

/// Acks seen before their message, kept until the message shows up.
const EARLY_ACK_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Node(Node),
    /// The channel list grew or an announced label changed.
    Channels,
    /// A message was inserted or its delivery state moved.
    Message { message: Message, cursor: Cursor },
}

pub struct Dispatcher {
    layout: FrameLayout,
    registry: Registry,
    store: MessageStore,
    early_acks: VecDeque<DedupKey>,
    early_ack_set: HashSet<DedupKey>,
}

impl Dispatcher {
    pub fn new(layout: FrameLayout, registry: Registry, store: MessageStore) -> Self {
        Self {
            layout,
            registry,
            store,
            early_acks: VecDeque::new(),
            early_ack_set: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Route one packet. Malformed payloads and unknown kinds are logged and dropped.
    pub fn dispatch(&mut self, packet: Packet, received_at: DateTime<Utc>) -> Vec<Change> {
        if let PacketKind::Unknown(code) = packet.kind {
            metrics::inc_unknown_kinds();
            debug!(
                "Dropping packet 0x{:08x} from {} with unknown kind {}",
                packet.id,
                format_node_id(packet.source),
                code
            );
            return Vec::new();
        }
        let payload = match Payload::decode(packet.kind, &packet.payload, &self.layout) {
            Ok(Some(p)) => p,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!(
                    "Dropping {} packet 0x{:08x} from {}: {}",
                    packet.kind.label(),
                    packet.id,
                    format_node_id(packet.source),
                    e
                );
                return Vec::new();
            }
        };
        trace!(
            "{} -> {:?} ch={} id=0x{:08x} hops={} {}",
            format_node_id(packet.source),
            packet.destination,
            packet.channel,
            packet.id,
            packet.hop_count,
            escape_log(&payload.summary())
        );

        let mut update = NodeUpdate::seen(received_at);
        update.signal = packet.signal;
        update.hop_count = Some(packet.hop_count);
        let mut changes = Vec::new();

        match payload {
            Payload::NodeInfo(info) => {
                update.observed_at = observed(info.observed_at, received_at);
                update.names = Some((info.long_name, info.short_name));
                if self.registry.announce_channels(&info.channels) {
                    changes.push(Change::Channels);
                }
            }
            Payload::Position(pos) => {
                update.observed_at = observed(pos.time, received_at);
                update.position = Some(pos);
            }
            Payload::Telemetry(tel) => {
                update.observed_at = observed(tel.time, received_at);
                update.telemetry = Some(tel);
            }
            Payload::Text(text) => {
                if let Some(change) = self.on_text(&packet, text, received_at) {
                    changes.push(change);
                }
            }
            Payload::Ack(ack) => {
                if let Some(change) = self.on_ack(packet.destination, ack.acked_id) {
                    changes.push(change);
                }
            }
        }

        let node = self.registry.upsert_node(packet.source, update).clone();
        changes.insert(0, Change::Node(node));
        changes
    }

    fn on_text(&mut self, packet: &Packet, text: TextPayload, received_at: DateTime<Utc>) -> Option<Change> {
        let key = DedupKey::new(packet.id, packet.source);
        let state = if self.take_early_ack(&key) {
            DeliveryState::Acked
        } else {
            DeliveryState::Sent
        };
        let message = Message {
            key,
            channel: packet.channel,
            destination: packet.destination,
            body: text.body,
            sent_at: observed(text.sent_at, received_at),
            state,
            outgoing: false,
        };
        let preview = truncate_for_log(&message.body, 60);
        match self.store.record(message) {
            RecordOutcome::Inserted => {
                debug!("New message {} on ch {}: {}", key, packet.channel, preview);
                self.message_change(&key)
            }
            RecordOutcome::Updated { previous } => {
                let current = self.store.get(&key).map(|m| m.state);
                if current == Some(previous) {
                    metrics::inc_duplicates_suppressed();
                    trace!("Duplicate {} via {} hops suppressed", key, packet.hop_count);
                    None
                } else {
                    self.message_change(&key)
                }
            }
        }
    }

    fn on_ack(&mut self, destination: Destination, acked_id: u32) -> Option<Change> {
        let Destination::Node(sender) = destination else {
            debug!("Ignoring broadcast ack for 0x{:08x}", acked_id);
            return None;
        };
        let key = DedupKey::new(acked_id, sender);
        if !self.store.contains(&key) {
            self.remember_early_ack(key);
            return None;
        }
        self.apply_state(&key, DeliveryState::Acked)
    }

    /// Move a stored message to `state`, reporting the change if there was one.
    pub fn apply_state(&mut self, key: &DedupKey, state: DeliveryState) -> Option<Change> {
        self.store.advance(key, state)?;
        self.message_change(key)
    }

    /// Store a message created by this gateway.
    pub fn record_outgoing(&mut self, message: Message) -> Option<Change> {
        let key = message.key;
        match self.store.record(message) {
            RecordOutcome::Inserted => self.message_change(&key),
            RecordOutcome::Updated { .. } => None,
        }
    }

    fn message_change(&self, key: &DedupKey) -> Option<Change> {
        let message = self.store.get(key)?.clone();
        let cursor = self.store.cursor_of(key)?;
        Some(Change::Message { message, cursor })
    }

    fn remember_early_ack(&mut self, key: DedupKey) {
        if !self.early_ack_set.insert(key) {
            return;
        }
        self.early_acks.push_back(key);
        if self.early_acks.len() > EARLY_ACK_CAPACITY {
            if let Some(old) = self.early_acks.pop_front() {
                self.early_ack_set.remove(&old);
            }
        }
    }

    fn take_early_ack(&mut self, key: &DedupKey) -> bool {
        if !self.early_ack_set.remove(key) {
            return false;
        }
        self.early_acks.retain(|k| k != key);
        true
    }

    /// Is `id` already used as a packet id by `sender`?
    pub fn is_known(&self, packet_id: u32, sender: NodeId) -> bool {
        self.store.contains(&DedupKey::new(packet_id, sender))
    }
}

/// Payload timestamp if the sender had one, capped at arrival so a fast clock cannot
/// push `last_seen` into the future.
fn observed(unix_secs: u32, received_at: DateTime<Utc>) -> DateTime<Utc> {
    if unix_secs == 0 {
        return received_at;
    }
    match Utc.timestamp_opt(unix_secs as i64, 0).single() {
        Some(t) if t < received_at => t,
        _ => received_at,
    }
}
