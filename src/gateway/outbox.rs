//! Outbound delivery queue and retry timers.
//!
//! Pure bookkeeping with explicit `Instant`s so every transition can be driven from a
//! test. The core owns it and feeds it link events:
//!
//! ```text
//! enqueue ─▶ queue ─pop_for_transmit─▶ in_transit ─transmitted─▶ awaiting ack
//!              ▲                          │                          │
//!              └──── link_lost (front) ───┘                          │
//!              └──── deadline, attempts left (back) ─────────────────┘
//! ```
//!
//! Entries that never expect an ack (node announcements) leave after their first write.
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::errors::GatewayError;
use super::session::SessionId;
use crate::mesh::PacketId;
use crate::storage::messages::DedupKey;

#[derive(Debug, Clone)]
pub struct OutboxSettings {
    pub ack_timeout: Duration,
    /// Total transmissions per message, including the first.
    pub max_attempts: u8,
    /// Messages waiting for (re)transmission, not counting those awaiting an ack.
    pub max_queue: usize,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_attempts: 3,
            max_queue: 64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundEntry {
    pub key: DedupKey,
    pub frame: Vec<u8>,
    pub origin: Option<SessionId>,
    pub expects_ack: bool,
    attempts: u8,
    first_sent: Option<Instant>,
}

impl OutboundEntry {
    pub fn new(key: DedupKey, frame: Vec<u8>, origin: Option<SessionId>, expects_ack: bool) -> Self {
        Self {
            key,
            frame,
            origin,
            expects_ack,
            attempts: 0,
            first_sent: None,
        }
    }

    pub fn attempts(&self) -> u8 {
        self.attempts
    }
}

/// Result of a successful write reported by the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    pub key: DedupKey,
    pub attempt: u8,
    pub expects_ack: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expiry {
    /// Ack window passed; the message went back in the queue.
    Retry { key: DedupKey, attempt: u8 },
    /// Retry budget exhausted.
    Failed {
        key: DedupKey,
        origin: Option<SessionId>,
        attempts: u8,
    },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub queued: usize,
    pub in_transit: usize,
    pub awaiting_ack: usize,
}

#[derive(Debug)]
struct Awaiting {
    entry: OutboundEntry,
    deadline: Instant,
}

#[derive(Debug)]
pub struct Outbox {
    settings: OutboxSettings,
    queue: VecDeque<OutboundEntry>,
    in_transit: VecDeque<OutboundEntry>,
    // Deadlines are transmit time + a fixed timeout, so this stays sorted
    awaiting: VecDeque<Awaiting>,
}

impl Outbox {
    pub fn new(settings: OutboxSettings) -> Self {
        Self {
            settings,
            queue: VecDeque::new(),
            in_transit: VecDeque::new(),
            awaiting: VecDeque::new(),
        }
    }

    pub fn settings(&self) -> &OutboxSettings {
        &self.settings
    }

    fn backlog(&self) -> usize {
        self.queue.len() + self.in_transit.len()
    }

    pub fn is_full(&self) -> bool {
        self.backlog() >= self.settings.max_queue
    }

    pub fn stats(&self) -> OutboxStats {
        OutboxStats {
            queued: self.queue.len(),
            in_transit: self.in_transit.len(),
            awaiting_ack: self.awaiting.len(),
        }
    }

    /// Append a new message at the back of the queue.
    pub fn enqueue(&mut self, entry: OutboundEntry) -> Result<(), GatewayError> {
        if self.is_full() {
            return Err(GatewayError::QueueFull(self.backlog()));
        }
        self.queue.push_back(entry);
        Ok(())
    }

    /// Take the next frame to hand to the link. It stays tracked as in transit until the
    /// link reports the write or the link drops.
    pub fn pop_for_transmit(&mut self) -> Option<(PacketId, Vec<u8>)> {
        let entry = self.queue.pop_front()?;
        let out = (entry.key.packet_id, entry.frame.clone());
        self.in_transit.push_back(entry);
        Some(out)
    }

    /// The link wrote `packet_id`. Arms the ack deadline for messages that expect one.
    pub fn transmitted(&mut self, packet_id: PacketId, now: Instant) -> Option<Transmission> {
        let pos = self
            .in_transit
            .iter()
            .position(|e| e.key.packet_id == packet_id)?;
        let mut entry = self.in_transit.remove(pos)?;
        entry.attempts = entry.attempts.saturating_add(1);
        entry.first_sent.get_or_insert(now);
        let tx = Transmission {
            key: entry.key,
            attempt: entry.attempts,
            expects_ack: entry.expects_ack,
        };
        if entry.expects_ack {
            self.awaiting.push_back(Awaiting {
                entry,
                deadline: now + self.settings.ack_timeout,
            });
        }
        Some(tx)
    }

    /// The link dropped. Frames handed to it but not confirmed written go back to the
    /// front of the queue in their original order.
    pub fn link_lost(&mut self) -> usize {
        let n = self.in_transit.len();
        while let Some(entry) = self.in_transit.pop_back() {
            self.queue.push_front(entry);
        }
        n
    }

    /// An ack arrived. Returns when the message was first written, for latency metrics.
    pub fn acknowledged(&mut self, key: &DedupKey) -> Option<Option<Instant>> {
        if let Some(pos) = self.awaiting.iter().position(|a| a.entry.key == *key) {
            return self.awaiting.remove(pos).map(|a| a.entry.first_sent);
        }
        // A retransmission may already be queued or on the wire
        for list in [&mut self.queue, &mut self.in_transit] {
            if let Some(pos) = list.iter().position(|e| e.key == *key) {
                return list.remove(pos).map(|e| e.first_sent);
            }
        }
        None
    }

    /// True while a frame with this packet id is queued, on the wire or awaiting its ack.
    pub fn holds(&self, packet_id: PacketId) -> bool {
        self.queue
            .iter()
            .chain(self.in_transit.iter())
            .chain(self.awaiting.iter().map(|a| &a.entry))
            .any(|e| e.key.packet_id == packet_id)
    }

    /// Expire every ack window that closed at or before `now`.
    pub fn poll_deadlines(&mut self, now: Instant) -> Vec<Expiry> {
        let mut expired = Vec::new();
        while self.awaiting.front().is_some_and(|a| a.deadline <= now) {
            let Some(Awaiting { entry, .. }) = self.awaiting.pop_front() else {
                break;
            };
            if entry.attempts < self.settings.max_attempts {
                expired.push(Expiry::Retry {
                    key: entry.key,
                    attempt: entry.attempts + 1,
                });
                self.queue.push_back(entry);
            } else {
                expired.push(Expiry::Failed {
                    key: entry.key,
                    origin: entry.origin,
                    attempts: entry.attempts,
                });
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbox(max_attempts: u8, max_queue: usize) -> Outbox {
        Outbox::new(OutboxSettings {
            ack_timeout: Duration::from_secs(10),
            max_attempts,
            max_queue,
        })
    }

    fn entry(id: PacketId) -> OutboundEntry {
        OutboundEntry::new(DedupKey::new(id, 1), vec![id as u8], None, true)
    }

    fn drain(ob: &mut Outbox) -> Vec<PacketId> {
        std::iter::from_fn(|| ob.pop_for_transmit().map(|(id, _)| id)).collect()
    }

    #[test]
    fn link_loss_requeues_in_order_ahead_of_new_messages() {
        let mut ob = outbox(3, 10);
        ob.enqueue(entry(1)).unwrap();
        ob.enqueue(entry(2)).unwrap();
        assert_eq!(drain(&mut ob), vec![1, 2]);
        ob.enqueue(entry(3)).unwrap();
        assert_eq!(ob.link_lost(), 2);
        assert_eq!(drain(&mut ob), vec![1, 2, 3]);
    }

    #[test]
    fn deadline_retries_then_fails() {
        let mut ob = outbox(2, 10);
        let t0 = Instant::now();
        ob.enqueue(entry(7)).unwrap();
        ob.pop_for_transmit();
        assert_eq!(ob.transmitted(7, t0).unwrap().attempt, 1);
        assert!(ob.poll_deadlines(t0 + Duration::from_secs(9)).is_empty());

        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(
            ob.poll_deadlines(t1),
            vec![Expiry::Retry {
                key: DedupKey::new(7, 1),
                attempt: 2
            }]
        );
        ob.pop_for_transmit();
        assert_eq!(ob.transmitted(7, t1).unwrap().attempt, 2);
        match ob.poll_deadlines(t1 + Duration::from_secs(10)).as_slice() {
            [Expiry::Failed { attempts: 2, .. }] => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ob.stats(), OutboxStats::default());
    }

    #[test]
    fn holds_tracks_every_stage() {
        let mut ob = outbox(3, 10);
        ob.enqueue(entry(4)).unwrap();
        assert!(ob.holds(4));
        ob.pop_for_transmit();
        assert!(ob.holds(4));
        ob.transmitted(4, Instant::now());
        assert!(ob.holds(4));
        assert!(!ob.holds(5));
        ob.acknowledged(&DedupKey::new(4, 1));
        assert!(!ob.holds(4));
    }

    #[test]
    fn ack_clears_any_stage() {
        let mut ob = outbox(3, 10);
        let now = Instant::now();
        ob.enqueue(entry(1)).unwrap();
        ob.enqueue(entry(2)).unwrap();
        ob.pop_for_transmit();
        ob.transmitted(1, now);
        assert_eq!(ob.acknowledged(&DedupKey::new(1, 1)), Some(Some(now)));
        assert_eq!(ob.acknowledged(&DedupKey::new(2, 1)), Some(None));
        assert_eq!(ob.acknowledged(&DedupKey::new(3, 1)), None);
        assert_eq!(ob.stats().awaiting_ack, 0);
        assert!(!ob.holds(1));
    }

    #[test]
    fn full_queue_rejects_without_dropping() {
        let mut ob = outbox(3, 2);
        ob.enqueue(entry(1)).unwrap();
        ob.enqueue(entry(2)).unwrap();
        assert!(matches!(ob.enqueue(entry(3)), Err(GatewayError::QueueFull(2))));
        assert_eq!(drain(&mut ob), vec![1, 2]);
    }

    #[test]
    fn announcements_leave_after_write() {
        let mut ob = outbox(3, 2);
        ob.enqueue(OutboundEntry::new(DedupKey::new(9, 1), vec![], None, false))
            .unwrap();
        ob.pop_for_transmit();
        let tx = ob.transmitted(9, Instant::now()).unwrap();
        assert!(!tx.expects_ack);
        assert_eq!(ob.stats(), OutboxStats::default());
    }
}
