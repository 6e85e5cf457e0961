//! Chat history with deduplication.
//!
//! Messages live in an append-only arena indexed two ways: by [`DedupKey`] for the
//! duplicate check, and per channel by `(sent_at, seq)` for ordered history. A repeated
//! delivery of the same key never creates a second entry; it can only move the stored
//! delivery state forward.
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::mesh::{ChannelId, Destination, NodeId, PacketId};

/// Identity of a logical message: the packet id together with the originating node.
/// Packet ids are only unique per sender, and clocks on the mesh drift too much for
/// timestamps to tell retransmissions apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub packet_id: PacketId,
    pub sender: NodeId,
}

impl DedupKey {
    pub fn new(packet_id: PacketId, sender: NodeId) -> Self {
        Self { packet_id, sender }
    }
}

impl std::fmt::Display for DedupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}#{:08x}",
            crate::mesh::format_node_id(self.sender),
            self.packet_id
        )
    }
}

/// `Pending -> Sent -> Acked`, or `Sent -> Failed` once the retry budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    Sent,
    Acked,
    Failed,
}

impl DeliveryState {
    fn rank(self) -> u8 {
        match self {
            DeliveryState::Pending => 0,
            DeliveryState::Sent => 1,
            DeliveryState::Acked | DeliveryState::Failed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DeliveryState::Acked | DeliveryState::Failed)
    }

    /// Merge an observed state into this one. Terminal states never change and nothing
    /// moves backwards.
    pub fn merge(self, observed: DeliveryState) -> DeliveryState {
        if self.is_terminal() || observed.rank() <= self.rank() {
            self
        } else {
            observed
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Sent => "sent",
            DeliveryState::Acked => "acked",
            DeliveryState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: DedupKey,
    pub channel: ChannelId,
    pub destination: Destination,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub state: DeliveryState,
    /// Originated by this gateway rather than received from the mesh.
    #[serde(default)]
    pub outgoing: bool,
}

impl Message {
    pub fn sender(&self) -> NodeId {
        self.key.sender
    }
}

/// Position in a channel's history. History reads resume strictly after a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cursor {
    /// Send time in unix milliseconds.
    pub ts: i64,
    /// Store-wide insertion sequence, breaks ties between equal timestamps.
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    /// The key was already stored. `previous` is the state before merging.
    Updated { previous: DeliveryState },
}

#[derive(Debug)]
struct Entry {
    message: Message,
    cursor: Cursor,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    entries: Vec<Entry>,
    by_key: HashMap<DedupKey, usize>,
    by_channel: HashMap<ChannelId, BTreeMap<Cursor, usize>>,
    next_seq: u64,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message or merge its delivery state into the stored copy. Idempotent.
    pub fn record(&mut self, message: Message) -> RecordOutcome {
        if let Some(&idx) = self.by_key.get(&message.key) {
            let stored = &mut self.entries[idx].message;
            let previous = stored.state;
            stored.state = previous.merge(message.state);
            return RecordOutcome::Updated { previous };
        }

        let cursor = Cursor {
            ts: message.sent_at.timestamp_millis(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let idx = self.entries.len();
        self.by_key.insert(message.key, idx);
        self.by_channel
            .entry(message.channel)
            .or_default()
            .insert(cursor, idx);
        self.entries.push(Entry { message, cursor });
        RecordOutcome::Inserted
    }

    /// Move a stored message's state forward. Returns the message if its state changed.
    pub fn advance(&mut self, key: &DedupKey, observed: DeliveryState) -> Option<&Message> {
        let idx = *self.by_key.get(key)?;
        let stored = &mut self.entries[idx].message;
        let next = stored.state.merge(observed);
        if next == stored.state {
            return None;
        }
        stored.state = next;
        Some(&*stored)
    }

    pub fn get(&self, key: &DedupKey) -> Option<&Message> {
        self.by_key.get(key).map(|&idx| &self.entries[idx].message)
    }

    pub fn contains(&self, key: &DedupKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn cursor_of(&self, key: &DedupKey) -> Option<Cursor> {
        self.by_key.get(key).map(|&idx| self.entries[idx].cursor)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All messages in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Message> + '_ {
        self.entries.iter().map(|e| &e.message)
    }

    /// Messages per channel, for status reporting.
    pub fn counts_by_channel(&self) -> BTreeMap<ChannelId, usize> {
        self.by_channel
            .iter()
            .map(|(ch, index)| (*ch, index.len()))
            .collect()
    }

    /// Channel history ordered by send time, starting strictly after `since`.
    ///
    /// The iterator is lazy and finite; restarting from any returned cursor yields the
    /// remainder of the same sequence.
    pub fn history(
        &self,
        channel: ChannelId,
        since: Option<Cursor>,
    ) -> impl Iterator<Item = (Cursor, &Message)> + '_ {
        let lower = match since {
            Some(c) => Bound::Excluded(c),
            None => Bound::Unbounded,
        };
        self.by_channel
            .get(&channel)
            .into_iter()
            .flat_map(move |index| index.range((lower, Bound::Unbounded)))
            .map(move |(cursor, &idx)| (*cursor, &self.entries[idx].message))
    }

    /// One page of history plus the cursor to resume from (the last item returned).
    pub fn page(
        &self,
        channel: ChannelId,
        since: Option<Cursor>,
        limit: usize,
    ) -> (Vec<Message>, Option<Cursor>) {
        let mut last = since;
        let messages = self
            .history(channel, since)
            .take(limit)
            .map(|(cursor, m)| {
                last = Some(cursor);
                m.clone()
            })
            .collect();
        (messages, last)
    }
}
