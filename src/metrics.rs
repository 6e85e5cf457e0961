//! Process-wide counters for the link and delivery paths.
//! Plain atomics; `snapshot()` is what `status`-style reporting and tests read.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

static FRAMES_DECODED: AtomicU64 = AtomicU64::new(0);
static CORRUPT_FRAMES: AtomicU64 = AtomicU64::new(0);
static UNKNOWN_KINDS: AtomicU64 = AtomicU64::new(0);
static DUPLICATES_SUPPRESSED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_TRANSMITTED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_ACKED: AtomicU64 = AtomicU64::new(0);
static MESSAGES_FAILED: AtomicU64 = AtomicU64::new(0);
static RETRIES: AtomicU64 = AtomicU64::new(0);
static RECONNECTS: AtomicU64 = AtomicU64::new(0);
static SESSION_EVENTS_DROPPED: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_SUM_MS: AtomicU64 = AtomicU64::new(0);
static ACK_LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

pub fn inc_frames_decoded() {
    FRAMES_DECODED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_corrupt_frames() {
    CORRUPT_FRAMES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_unknown_kinds() {
    UNKNOWN_KINDS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_duplicates_suppressed() {
    DUPLICATES_SUPPRESSED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_transmitted() {
    MESSAGES_TRANSMITTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_acked() {
    MESSAGES_ACKED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_messages_failed() {
    MESSAGES_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_retries() {
    RETRIES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnects() {
    RECONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_session_events_dropped() {
    SESSION_EVENTS_DROPPED.fetch_add(1, Ordering::Relaxed);
}
pub fn observe_ack_latency(sent_at: Instant) {
    let ms = sent_at.elapsed().as_millis() as u64;
    ACK_LATENCY_SUM_MS.fetch_add(ms, Ordering::Relaxed);
    ACK_LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub frames_decoded: u64,
    pub corrupt_frames: u64,
    pub unknown_kinds: u64,
    pub duplicates_suppressed: u64,
    pub messages_transmitted: u64,
    pub messages_acked: u64,
    pub messages_failed: u64,
    pub retries: u64,
    pub reconnects: u64,
    pub session_events_dropped: u64,
    pub ack_latency_avg_ms: Option<u64>,
}

pub fn snapshot() -> MetricsSnapshot {
    let sum = ACK_LATENCY_SUM_MS.load(Ordering::Relaxed);
    let count = ACK_LATENCY_COUNT.load(Ordering::Relaxed);
    MetricsSnapshot {
        frames_decoded: FRAMES_DECODED.load(Ordering::Relaxed),
        corrupt_frames: CORRUPT_FRAMES.load(Ordering::Relaxed),
        unknown_kinds: UNKNOWN_KINDS.load(Ordering::Relaxed),
        duplicates_suppressed: DUPLICATES_SUPPRESSED.load(Ordering::Relaxed),
        messages_transmitted: MESSAGES_TRANSMITTED.load(Ordering::Relaxed),
        messages_acked: MESSAGES_ACKED.load(Ordering::Relaxed),
        messages_failed: MESSAGES_FAILED.load(Ordering::Relaxed),
        retries: RETRIES.load(Ordering::Relaxed),
        reconnects: RECONNECTS.load(Ordering::Relaxed),
        session_events_dropped: SESSION_EVENTS_DROPPED.load(Ordering::Relaxed),
        ack_latency_avg_ms: if count > 0 { Some(sum / count) } else { None },
    }
}
