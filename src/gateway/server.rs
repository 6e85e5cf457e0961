//! Gateway core task and its handle.
//!
//! [`Gateway::spawn`] starts two tasks: the link supervisor and the core. The core is the
//! single writer for the registry, message store, outbox and session table; it selects
//! over link events, client commands, and a timer tick that drives ack deadlines and
//! periodic persistence.
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::Utc;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::dispatch::{Change, Dispatcher};
use super::errors::{GatewayError, RegistryError};
use super::outbox::{Expiry, OutboundEntry, Outbox, OutboxSettings, OutboxStats};
use super::registry::{Channel, Node, Registry};
use super::session::{Broadcaster, LinkStatus, Session, SessionEvent, SessionId};
use super::Profile;
use crate::logutil::{escape_log, truncate_for_log};
use crate::mesh::framer::{FrameCodec, FrameLayout};
use crate::mesh::payload::{AnnouncedChannel, NodeInfoPayload, Payload, TextPayload};
use crate::mesh::supervisor::{LinkEvent, LinkSupervisor, OutboundFrame, SupervisorSettings};
use crate::mesh::transport::Connector;
use crate::mesh::{ChannelId, CodecError, Destination, NodeId, Packet, PacketId, PacketKind};
use crate::metrics;
use crate::storage::messages::{Cursor, DedupKey, DeliveryState, Message, MessageStore};
use crate::storage::{Persistence, SnapshotRef};
use crate::validation::{validate_body, validate_display_name};

const COMMAND_QUEUE: usize = 256;
const LINK_EVENT_QUEUE: usize = 256;
const OUTBOUND_FRAME_QUEUE: usize = 16;
const RANDOM_ID_ATTEMPTS: usize = 64;

/// Everything the core needs, resolved from configuration.
#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub profile: Profile,
    pub hop_limit: u8,
    pub channels: Vec<Channel>,
    pub layout: FrameLayout,
    pub outbox: OutboxSettings,
    pub link: SupervisorSettings,
    pub session_queue_depth: usize,
    pub history_page: usize,
    /// Zero flushes only at shutdown.
    pub flush_interval: Duration,
}

/// An outbound chat message as requested by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub channel: ChannelId,
    pub body: String,
    /// Direct message target; `None` broadcasts on the channel.
    pub to: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryPage {
    pub channel: ChannelId,
    pub messages: Vec<Message>,
    /// Pass back as `since` to continue after the last message returned.
    pub next: Option<Cursor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub profile: Profile,
    pub link: LinkStatus,
    pub nodes: usize,
    pub messages: usize,
    pub sessions: usize,
    pub outbox: OutboxStats,
}

pub(crate) enum Command {
    Attach {
        reply: oneshot::Sender<(SessionId, mpsc::Receiver<SessionEvent>)>,
    },
    Detach {
        session: SessionId,
        reply: Option<oneshot::Sender<bool>>,
    },
    Subscribe {
        session: SessionId,
        channels: Vec<ChannelId>,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Send {
        origin: Option<SessionId>,
        request: SendRequest,
        reply: oneshot::Sender<Result<Message, GatewayError>>,
    },
    History {
        channel: ChannelId,
        since: Option<Cursor>,
        limit: Option<usize>,
        reply: oneshot::Sender<HistoryPage>,
    },
    Nodes {
        reply: oneshot::Sender<Vec<Node>>,
    },
    Node {
        id: NodeId,
        reply: oneshot::Sender<Result<Node, RegistryError>>,
    },
    Channels {
        reply: oneshot::Sender<Vec<Channel>>,
    },
    Status {
        reply: oneshot::Sender<GatewayStatus>,
    },
    Announce {
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    SetDisplayName {
        name: String,
        reply: oneshot::Sender<Result<Profile, GatewayError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable entry point to a running gateway.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::Sender<Command>,
}

impl GatewayHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| GatewayError::Closed)?;
        rx.await.map_err(|_| GatewayError::Closed)
    }

    /// Connect a new session. It starts with no subscriptions and immediately receives
    /// the gateway config, known nodes and link status.
    pub async fn attach(&self) -> Result<Session, GatewayError> {
        let (id, events) = self.request(|reply| Command::Attach { reply }).await?;
        Ok(Session::new(id, self.clone(), events))
    }

    pub async fn detach(&self, session: SessionId) -> Result<bool, GatewayError> {
        self.request(|reply| Command::Detach {
            session,
            reply: Some(reply),
        })
        .await
    }

    /// Fire-and-forget detach for use from `Drop`.
    pub(crate) fn detach_now(&self, session: SessionId) {
        let _ = self.tx.try_send(Command::Detach {
            session,
            reply: None,
        });
    }

    pub async fn subscribe(
        &self,
        session: SessionId,
        channels: Vec<ChannelId>,
    ) -> Result<(), GatewayError> {
        self.request(|reply| Command::Subscribe {
            session,
            channels,
            reply,
        })
        .await?
    }

    /// Queue a message. `origin` receives the `send_failed` notification if it fails.
    pub async fn send(
        &self,
        origin: Option<SessionId>,
        request: SendRequest,
    ) -> Result<Message, GatewayError> {
        self.request(|reply| Command::Send {
            origin,
            request,
            reply,
        })
        .await?
    }

    pub async fn history(
        &self,
        channel: ChannelId,
        since: Option<Cursor>,
        limit: Option<usize>,
    ) -> Result<HistoryPage, GatewayError> {
        self.request(|reply| Command::History {
            channel,
            since,
            limit,
            reply,
        })
        .await
    }

    pub async fn nodes(&self) -> Result<Vec<Node>, GatewayError> {
        self.request(|reply| Command::Nodes { reply }).await
    }

    pub async fn node(&self, id: NodeId) -> Result<Node, GatewayError> {
        Ok(self.request(|reply| Command::Node { id, reply }).await??)
    }

    pub async fn channels(&self) -> Result<Vec<Channel>, GatewayError> {
        self.request(|reply| Command::Channels { reply }).await
    }

    pub async fn status(&self) -> Result<GatewayStatus, GatewayError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Broadcast this gateway's NodeInfo (display name and configured channels).
    pub async fn announce(&self) -> Result<(), GatewayError> {
        self.request(|reply| Command::Announce { reply }).await?
    }

    pub async fn set_display_name(&self, name: &str) -> Result<Profile, GatewayError> {
        let name = name.to_string();
        self.request(|reply| Command::SetDisplayName { name, reply })
            .await?
    }

    /// Stop the core after a final persistence flush.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }
}

/// A running gateway: core task plus link supervisor.
pub struct Gateway {
    handle: GatewayHandle,
    core: JoinHandle<()>,
    link: JoinHandle<()>,
}

impl Gateway {
    /// Load persisted state and start the core and link tasks. Must be called inside a
    /// Tokio runtime.
    pub fn spawn<C, P>(settings: GatewaySettings, connector: C, mut persistence: P) -> Result<Self>
    where
        C: Connector,
        P: Persistence,
    {
        let snapshot = persistence.load()?;
        info!(
            "Loaded {} nodes and {} messages from {}",
            snapshot.nodes.len(),
            snapshot.messages.len(),
            persistence.describe()
        );

        let mut profile = settings.profile.clone();
        if let Some(saved) = snapshot.profile {
            if saved.node_id == profile.node_id && !saved.display_name.trim().is_empty() {
                profile.display_name = saved.display_name;
            }
        }

        let mut registry = Registry::new(settings.channels.clone());
        registry.restore(snapshot.nodes);
        let mut store = MessageStore::new();
        let mut abandoned = 0usize;
        for mut message in snapshot.messages {
            // Frames for unfinished sends did not survive the restart
            if message.outgoing && !message.state.is_terminal() {
                message.state = DeliveryState::Failed;
                abandoned += 1;
            }
            store.record(message);
        }
        if abandoned > 0 {
            warn!("Marked {} unfinished outgoing messages as failed", abandoned);
        }

        let codec = FrameCodec::new(settings.layout.clone());
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(LINK_EVENT_QUEUE);
        let (frame_tx, frame_rx) = mpsc::channel(OUTBOUND_FRAME_QUEUE);

        let supervisor = LinkSupervisor::new(
            connector,
            codec.clone(),
            settings.link.clone(),
            event_tx,
            frame_rx,
        );
        let link = tokio::spawn(supervisor.run());

        let tick = (settings.outbox.ack_timeout / 4)
            .min(Duration::from_millis(250))
            .max(Duration::from_millis(5));
        let core = Core {
            dispatcher: Dispatcher::new(settings.layout.clone(), registry, store),
            outbox: Outbox::new(settings.outbox.clone()),
            broadcaster: Broadcaster::new(settings.session_queue_depth),
            codec,
            persistence: Box::new(persistence),
            profile,
            hop_limit: settings.hop_limit,
            history_page: settings.history_page.max(1),
            flush_interval: settings.flush_interval,
            tick,
            link: LinkStatus::default(),
            frames: frame_tx,
            id_cursor: 1,
            dirty: false,
        };
        let core = tokio::spawn(core.run(cmd_rx, event_rx));

        Ok(Self {
            handle: GatewayHandle { tx: cmd_tx },
            core,
            link,
        })
    }

    pub fn handle(&self) -> GatewayHandle {
        self.handle.clone()
    }

    /// Flush, stop the core, and wait for the link supervisor to wind down.
    pub async fn shutdown(self) -> Result<()> {
        if self.handle.shutdown().await.is_err() {
            debug!("Gateway core already stopped");
        }
        if let Err(e) = self.core.await {
            error!("Gateway core task failed: {}", e);
        }
        // The supervisor exits once the core drops its channels; a connect in progress
        // is not worth waiting for
        self.link.abort();
        let _ = self.link.await;
        Ok(())
    }
}

struct Core {
    dispatcher: Dispatcher,
    outbox: Outbox,
    broadcaster: Broadcaster,
    codec: FrameCodec,
    persistence: Box<dyn Persistence>,
    profile: Profile,
    hop_limit: u8,
    history_page: usize,
    flush_interval: Duration,
    tick: Duration,
    link: LinkStatus,
    frames: mpsc::Sender<OutboundFrame>,
    /// Where the fallback packet id scan resumes.
    id_cursor: PacketId,
    dirty: bool,
}

impl Core {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut link_events: mpsc::Receiver<LinkEvent>,
    ) {
        info!(
            "Gateway core started as {} ({})",
            crate::mesh::format_node_id(self.profile.node_id),
            escape_log(&self.profile.display_name)
        );
        let mut tick = tokio::time::interval(self.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_flush = Instant::now();
        let mut link_open = true;

        loop {
            tokio::select! {
                event = link_events.recv(), if link_open => match event {
                    Some(event) => self.on_link_event(event),
                    None => {
                        warn!("Link supervisor stopped");
                        link_open = false;
                        self.link.connected = false;
                    }
                },
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.flush();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All gateway handles dropped");
                        self.flush();
                        break;
                    }
                },
                _ = tick.tick() => {
                    self.expire_deadlines(Instant::now());
                    if !self.flush_interval.is_zero() && last_flush.elapsed() >= self.flush_interval {
                        self.flush();
                        last_flush = Instant::now();
                    }
                }
            }
            self.pump();
        }
        info!("Gateway core stopped");
    }

    fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Up { epoch, target } => {
                self.link = LinkStatus {
                    connected: true,
                    target: Some(target),
                    epoch,
                };
                self.broadcast_link_status();
            }
            LinkEvent::Down { epoch, reason } => {
                self.link.connected = false;
                self.link.epoch = epoch;
                let requeued = self.outbox.link_lost();
                if requeued > 0 {
                    info!("Link down ({}); requeued {} unsent frames", reason, requeued);
                }
                self.broadcast_link_status();
            }
            LinkEvent::Packet(packet) => {
                for change in self.dispatcher.dispatch(packet, Utc::now()) {
                    self.apply(change);
                }
            }
            LinkEvent::Transmitted { packet_id, .. } => {
                let Some(tx) = self.outbox.transmitted(packet_id, Instant::now()) else {
                    return;
                };
                metrics::inc_messages_transmitted();
                if tx.expects_ack && tx.attempt == 1 {
                    if let Some(change) = self.dispatcher.apply_state(&tx.key, DeliveryState::Sent) {
                        self.apply(change);
                    }
                }
            }
        }
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Attach { reply } => {
                let (id, events) = self.broadcaster.attach();
                self.broadcaster.send_to(id, self.config_event());
                let nodes = self.dispatcher.registry().list_nodes();
                self.broadcaster.send_to(id, SessionEvent::KnownNodes { nodes });
                let status = self.link.clone();
                self.broadcaster.send_to(id, SessionEvent::LinkStatus { status });
                if reply.send((id, events)).is_err() {
                    self.broadcaster.unsubscribe(id);
                }
            }
            Command::Detach { session, reply } => {
                let removed = self.broadcaster.unsubscribe(session);
                if let Some(reply) = reply {
                    let _ = reply.send(removed);
                }
            }
            Command::Subscribe {
                session,
                channels,
                reply,
            } => {
                let _ = reply.send(self.broadcaster.subscribe(session, channels));
            }
            Command::Send {
                origin,
                request,
                reply,
            } => {
                let _ = reply.send(self.send(origin, request));
            }
            Command::History {
                channel,
                since,
                limit,
                reply,
            } => {
                let limit = limit.unwrap_or(self.history_page).max(1);
                let (messages, next) = self.dispatcher.store().page(channel, since, limit);
                let _ = reply.send(HistoryPage {
                    channel,
                    messages,
                    next,
                });
            }
            Command::Nodes { reply } => {
                let _ = reply.send(self.dispatcher.registry().list_nodes());
            }
            Command::Node { id, reply } => {
                let _ = reply.send(self.dispatcher.registry().get_node(id));
            }
            Command::Channels { reply } => {
                let _ = reply.send(self.dispatcher.registry().list_channels());
            }
            Command::Status { reply } => {
                let _ = reply.send(GatewayStatus {
                    profile: self.profile.clone(),
                    link: self.link.clone(),
                    nodes: self.dispatcher.registry().node_count(),
                    messages: self.dispatcher.store().len(),
                    sessions: self.broadcaster.len(),
                    outbox: self.outbox.stats(),
                });
            }
            Command::Announce { reply } => {
                let _ = reply.send(self.announce());
            }
            Command::SetDisplayName { name, reply } => {
                let _ = reply.send(self.set_display_name(name));
            }
            // Handled by the run loop
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn send(&mut self, origin: Option<SessionId>, request: SendRequest) -> Result<Message, GatewayError> {
        validate_body(&request.body).map_err(|e| GatewayError::InvalidBody(e.to_string()))?;
        if self.dispatcher.registry().channel(request.channel).is_none() {
            return Err(GatewayError::UnknownChannel(request.channel));
        }
        if self.outbox.is_full() {
            let stats = self.outbox.stats();
            return Err(GatewayError::QueueFull(stats.queued + stats.in_transit));
        }

        let destination = request.to.map_or(Destination::Broadcast, Destination::Node);
        let packet_id = self.next_packet_id()?;
        let now = Utc::now();
        let key = DedupKey::new(packet_id, self.profile.node_id);
        let mut message = Message {
            key,
            channel: request.channel,
            destination,
            body: request.body,
            sent_at: now,
            state: DeliveryState::Pending,
            outgoing: true,
        };
        let payload = Payload::Text(TextPayload {
            sent_at: now.timestamp().clamp(0, u32::MAX as i64) as u32,
            body: message.body.clone(),
        });

        match self.build_frame(PacketKind::Text, destination, request.channel, packet_id, &payload) {
            Ok(frame) => {
                self.outbox
                    .enqueue(OutboundEntry::new(key, frame, origin, true))?;
                debug!(
                    "Queued {} on ch {}: {}",
                    key,
                    message.channel,
                    truncate_for_log(&message.body, 60)
                );
                if let Some(change) = self.dispatcher.record_outgoing(message.clone()) {
                    self.apply(change);
                }
                Ok(message)
            }
            Err(e) => {
                warn!("Cannot encode message {}: {}", key, e);
                metrics::inc_messages_failed();
                message.state = DeliveryState::Failed;
                if let Some(change) = self.dispatcher.record_outgoing(message) {
                    self.apply(change);
                }
                Err(GatewayError::Encode(e))
            }
        }
    }

    fn announce(&mut self) -> Result<(), GatewayError> {
        if self.outbox.is_full() {
            let stats = self.outbox.stats();
            return Err(GatewayError::QueueFull(stats.queued + stats.in_transit));
        }
        let channels = self
            .dispatcher
            .registry()
            .list_channels()
            .into_iter()
            .map(|c| AnnouncedChannel {
                id: c.id,
                label: c.label,
                encrypted: c.encrypted,
            })
            .collect();
        let payload = Payload::NodeInfo(NodeInfoPayload {
            observed_at: Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32,
            long_name: self.profile.display_name.clone(),
            short_name: self.profile.short_name(),
            channels,
        });
        let packet_id = self.next_packet_id()?;
        let frame = self.build_frame(PacketKind::NodeInfo, Destination::Broadcast, 0, packet_id, &payload)?;
        let key = DedupKey::new(packet_id, self.profile.node_id);
        self.outbox.enqueue(OutboundEntry::new(key, frame, None, false))?;
        info!("Queued announce as {}", escape_log(&self.profile.display_name));
        Ok(())
    }

    fn set_display_name(&mut self, name: String) -> Result<Profile, GatewayError> {
        let name = validate_display_name(&name).map_err(|e| GatewayError::InvalidName(e.to_string()))?;
        info!("Display name set to {}", escape_log(&name));
        self.profile.display_name = name;
        self.dirty = true;
        let event = self.config_event();
        self.broadcaster.broadcast(event);
        Ok(self.profile.clone())
    }

    fn build_frame(
        &self,
        kind: PacketKind,
        destination: Destination,
        channel: ChannelId,
        id: PacketId,
        payload: &Payload,
    ) -> Result<Vec<u8>, CodecError> {
        let bytes = payload.encode(self.codec.layout())?;
        self.codec.encode(&Packet {
            kind,
            source: self.profile.node_id,
            destination,
            channel,
            id,
            hop_count: self.hop_limit,
            signal: None,
            payload: bytes,
        })
    }

    /// Random non-zero id that fits the layout and is not in use by this node. A dense
    /// id space falls back to a scan from a rolling counter.
    fn next_packet_id(&mut self) -> Result<PacketId, GatewayError> {
        let width = self.codec.layout().packet_id_width;
        let mask = if width >= 4 {
            u32::MAX
        } else {
            (1u32 << (8 * width)) - 1
        };
        for _ in 0..RANDOM_ID_ATTEMPTS {
            let id = rand::random::<u32>() & mask;
            if self.packet_id_free(id) {
                return Ok(id);
            }
        }
        for step in 0..=mask {
            let id = self.id_cursor.wrapping_add(step) & mask;
            if self.packet_id_free(id) {
                self.id_cursor = id.wrapping_add(1);
                return Ok(id);
            }
        }
        warn!("Packet id space of {} bytes exhausted", width);
        Err(GatewayError::PacketIdsExhausted(self.dispatcher.store().len()))
    }

    fn packet_id_free(&self, id: PacketId) -> bool {
        id != 0 && !self.outbox.holds(id) && !self.dispatcher.is_known(id, self.profile.node_id)
    }

    fn apply(&mut self, change: Change) {
        self.dirty = true;
        match change {
            Change::Node(node) => self.broadcaster.broadcast(SessionEvent::NodeUpdated { node }),
            Change::Channels => {
                let event = self.config_event();
                self.broadcaster.broadcast(event);
            }
            Change::Message { message, cursor } => {
                if message.outgoing && message.state == DeliveryState::Acked {
                    if let Some(first_sent) = self.outbox.acknowledged(&message.key) {
                        metrics::inc_messages_acked();
                        if let Some(at) = first_sent {
                            metrics::observe_ack_latency(at);
                        }
                        info!("Message {} acknowledged", message.key);
                    }
                }
                self.broadcaster.publish(&message, cursor);
            }
        }
    }

    fn expire_deadlines(&mut self, now: Instant) {
        for expiry in self.outbox.poll_deadlines(now) {
            match expiry {
                Expiry::Retry { key, attempt } => {
                    metrics::inc_retries();
                    info!(
                        "No ack for {}; retransmitting (attempt {}/{})",
                        key,
                        attempt,
                        self.outbox.settings().max_attempts
                    );
                }
                Expiry::Failed {
                    key,
                    origin,
                    attempts,
                } => {
                    metrics::inc_messages_failed();
                    warn!("Message {} failed after {} attempts", key, attempts);
                    let channel = self.dispatcher.store().get(&key).map(|m| m.channel);
                    if let Some(change) = self.dispatcher.apply_state(&key, DeliveryState::Failed) {
                        self.apply(change);
                    }
                    if let (Some(origin), Some(channel)) = (origin, channel) {
                        self.broadcaster.send_to(
                            origin,
                            SessionEvent::SendFailed {
                                key,
                                channel,
                                reason: format!("no ack after {} attempts", attempts),
                            },
                        );
                    }
                }
            }
        }
    }

    /// Hand queued frames to the link while it is up and has room.
    fn pump(&mut self) {
        if !self.link.connected {
            return;
        }
        let epoch = self.link.epoch;
        while let Ok(permit) = self.frames.try_reserve() {
            let Some((packet_id, bytes)) = self.outbox.pop_for_transmit() else {
                break;
            };
            permit.send(OutboundFrame {
                packet_id,
                epoch,
                bytes,
            });
        }
    }

    fn config_event(&self) -> SessionEvent {
        SessionEvent::Config {
            profile: self.profile.clone(),
            channels: self.dispatcher.registry().list_channels(),
        }
    }

    fn broadcast_link_status(&mut self) {
        let status = self.link.clone();
        self.broadcaster.broadcast(SessionEvent::LinkStatus { status });
    }

    fn flush(&mut self) {
        if !self.dirty {
            return;
        }
        let state = SnapshotRef {
            profile: &self.profile,
            nodes: self.dispatcher.registry().nodes(),
            messages: self.dispatcher.store().iter().collect(),
        };
        match self.persistence.save(&state) {
            Ok(()) => {
                debug!("Persisted state to {}", self.persistence.describe());
                self.dirty = false;
            }
            Err(e) => warn!("Failed to persist state: {:#}", e),
        }
    }
}
