//! Link supervisor: the single task that owns the radio connection.
//!
//! Each link gets a dedicated reader task that pulls raw chunks off the device. The
//! supervisor feeds them to a [`FrameReader`], forwards decoded packets to the gateway
//! core, writes outbound frames (respecting a minimum gap between transmissions), watches
//! liveness, and reconnects with exponential backoff when the link drops. A write that
//! stalls for longer than the liveness timeout drops the link.
//!
//! Every successful connect starts a new link *epoch*. Outbound frames are stamped with
//! the epoch they were queued for; a frame that reaches the writer after its link died
//! is discarded here, and the core requeues the message in its original position when it
//! sees [`LinkEvent::Down`].
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::errors::TransportError;
use super::framer::{FrameCodec, FrameReader};
use super::transport::{Connector, Link};
use super::{Packet, PacketId};
use crate::logutil::hex_snippet;
use crate::metrics;

const RX_CHUNK_QUEUE: usize = 64;

/// Monotonic link generation, starting at 1 for the first successful connect.
pub type LinkEpoch = u64;

/// Exponential backoff: `base * 2^attempt`, capped at `max`, minus up to `jitter` of it.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction 0.0..=1.0 of the delay that may be randomly shaved off.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Deterministic upper bound of the delay before attempt `attempt` (0-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn next_delay(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return ceiling;
        }
        let shave = rand::thread_rng().gen_range(0.0..=jitter);
        ceiling.mul_f64(1.0 - shave)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub backoff: BackoffPolicy,
    /// No bytes in and no successful write for this long drops the link. `None` disables.
    pub liveness_timeout: Option<Duration>,
    pub min_send_gap: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            liveness_timeout: Some(Duration::from_secs(600)),
            min_send_gap: Duration::from_millis(250),
        }
    }
}

/// A frame queued for one link epoch.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub packet_id: PacketId,
    pub epoch: LinkEpoch,
    pub bytes: Vec<u8>,
}

/// What the supervisor reports to the gateway core, in order.
#[derive(Debug)]
pub enum LinkEvent {
    Up { epoch: LinkEpoch, target: String },
    Down { epoch: LinkEpoch, reason: String },
    Packet(Packet),
    /// A frame was written to the device.
    Transmitted { packet_id: PacketId, epoch: LinkEpoch },
}

pub struct LinkSupervisor<C: Connector> {
    connector: C,
    codec: FrameCodec,
    settings: SupervisorSettings,
    events: mpsc::Sender<LinkEvent>,
    outbound: mpsc::Receiver<OutboundFrame>,
    last_send: Option<Instant>,
}

/// The core went away; the supervisor should stop.
struct Detached;

/// Reads raw chunks off one link until it fails. Aborted when its epoch ends.
struct ReaderTask(JoinHandle<()>);

impl Drop for ReaderTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<C: Connector> LinkSupervisor<C> {
    pub fn new(
        connector: C,
        codec: FrameCodec,
        settings: SupervisorSettings,
        events: mpsc::Sender<LinkEvent>,
        outbound: mpsc::Receiver<OutboundFrame>,
    ) -> Self {
        Self {
            connector,
            codec,
            settings,
            events,
            outbound,
            last_send: None,
        }
    }

    /// Run until the core drops either end of its channels.
    pub async fn run(mut self) {
        let target = self.connector.describe();
        info!("Starting link supervisor for {}", target);
        let mut epoch: LinkEpoch = 0;
        let mut attempt: u32 = 0;

        loop {
            let link = match self.connector.connect().await {
                Ok(link) => link,
                Err(e) => {
                    let delay = self.settings.backoff.next_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(
                        "Link to {} unavailable (attempt {}): {}; retrying in {}ms",
                        target,
                        attempt,
                        e,
                        delay.as_millis()
                    );
                    if self.idle(delay).await.is_err() {
                        break;
                    }
                    continue;
                }
            };

            attempt = 0;
            epoch += 1;
            info!("Link to {} up (epoch {})", target, epoch);
            if self
                .events
                .send(LinkEvent::Up {
                    epoch,
                    target: target.clone(),
                })
                .await
                .is_err()
            {
                break;
            }

            match self.serve(link, epoch).await {
                Ok(Detached) => break,
                Err(e) => {
                    metrics::inc_reconnects();
                    warn!("Link to {} lost (epoch {}): {}", target, epoch, e);
                    let down = LinkEvent::Down {
                        epoch,
                        reason: e.to_string(),
                    };
                    if self.events.send(down).await.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Link supervisor for {} stopped", target);
    }

    /// Sleep out a backoff delay. Frames arriving meanwhile belong to a dead epoch.
    async fn idle(&mut self, delay: Duration) -> Result<(), Detached> {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => return Ok(()),
                frame = self.outbound.recv() => match frame {
                    Some(f) => debug!("Discarding frame 0x{:08x} queued while link down", f.packet_id),
                    None => return Err(Detached),
                },
            }
        }
    }

    async fn serve(&mut self, link: Link, epoch: LinkEpoch) -> Result<Detached, TransportError> {
        let Link {
            reader: mut link_reader,
            mut writer,
        } = link;
        let (chunk_tx, mut chunks) = mpsc::channel(RX_CHUNK_QUEUE);
        let _rx = ReaderTask(tokio::spawn(async move {
            loop {
                let chunk = link_reader.read_chunk().await;
                let failed = chunk.is_err();
                if chunk_tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        }));

        let mut reader = FrameReader::new(self.codec.clone());
        let mut last_activity = Instant::now();
        let liveness = self.settings.liveness_timeout;
        let check_every = liveness
            .map(|t| (t / 4).max(Duration::from_millis(10)))
            .unwrap_or(Duration::from_secs(3600));
        let mut liveness_tick = tokio::time::interval(check_every);
        liveness_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                chunk = chunks.recv() => {
                    let chunk = chunk.unwrap_or_else(|| Err(TransportError::Closed))?;
                    last_activity = Instant::now();
                    trace!("rx {} bytes: {}", chunk.len(), hex_snippet(&chunk, 48));
                    reader.push(&chunk);
                    while let Some(next) = reader.next_packet() {
                        match next {
                            Ok(packet) => {
                                metrics::inc_frames_decoded();
                                if self.events.send(LinkEvent::Packet(packet)).await.is_err() {
                                    return Ok(Detached);
                                }
                            }
                            Err(corrupt) => {
                                metrics::inc_corrupt_frames();
                                warn!("Discarding {}; {} bytes buffered", corrupt, reader.buffered());
                            }
                        }
                    }
                }
                frame = self.outbound.recv() => {
                    let Some(frame) = frame else { return Ok(Detached) };
                    if frame.epoch != epoch {
                        debug!(
                            "Dropping frame 0x{:08x} for stale epoch {} (current {})",
                            frame.packet_id, frame.epoch, epoch
                        );
                        continue;
                    }
                    self.enforce_min_send_gap().await;
                    trace!("tx {} bytes: {}", frame.bytes.len(), hex_snippet(&frame.bytes, 48));
                    // A device that stops draining its input must not wedge the link
                    match liveness {
                        Some(limit) => tokio::time::timeout(limit, writer.write_frame(&frame.bytes))
                            .await
                            .map_err(|_| TransportError::LivenessTimeout(limit))??,
                        None => writer.write_frame(&frame.bytes).await?,
                    }
                    self.last_send = Some(Instant::now());
                    last_activity = Instant::now();
                    let sent = LinkEvent::Transmitted { packet_id: frame.packet_id, epoch };
                    if self.events.send(sent).await.is_err() {
                        return Ok(Detached);
                    }
                }
                _ = liveness_tick.tick(), if liveness.is_some() => {
                    if let Some(timeout) = liveness {
                        if last_activity.elapsed() >= timeout {
                            return Err(TransportError::LivenessTimeout(timeout));
                        }
                    }
                }
            }
        }
    }

    /// Ensure at least `min_send_gap` has elapsed since the last frame written.
    async fn enforce_min_send_gap(&self) {
        let min_gap = self.settings.min_send_gap;
        if let Some(last) = self.last_send {
            let elapsed = last.elapsed();
            if elapsed < min_gap {
                let wait = min_gap - elapsed;
                debug!(
                    "Gating: waiting {}ms to respect minimum {}ms between sends",
                    wait.as_millis(),
                    min_gap.as_millis()
                );
                sleep(wait).await;
            }
        }
    }
}
