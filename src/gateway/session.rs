//! Connected web clients.
//!
//! [`Broadcaster`] lives inside the core task and fans events out over one bounded
//! queue per session. Delivery is best-effort: a full queue drops the event for that
//! session only, a closed queue removes the session. Neither blocks the core.
//!
//! [`Session`] is the client-side end. It owns its subscription set and history cursor
//! and filters on receive as well, so a channel it just left never leaks through events
//! that were already queued.
//!
//! Events and requests are serde-tagged JSON (`{"type": "..."}`) so a websocket layer
//! can forward them without translation.
use std::collections::{HashMap, HashSet};

use log::{debug, trace};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::errors::GatewayError;
use super::registry::{Channel, Node};
use super::server::{GatewayHandle, HistoryPage, SendRequest};
use super::Profile;
use crate::mesh::{ChannelId, NodeId};
use crate::metrics;
use crate::storage::messages::{Cursor, DedupKey, Message};

pub type SessionId = Uuid;

/// Radio link state as shown to clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub connected: bool,
    pub target: Option<String>,
    pub epoch: u64,
}

/// Server-pushed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    Config {
        profile: Profile,
        channels: Vec<Channel>,
    },
    KnownNodes {
        nodes: Vec<Node>,
    },
    NodeUpdated {
        node: Node,
    },
    /// A new message, or a delivery state change of a known one.
    Message {
        message: Message,
        cursor: Cursor,
    },
    LinkStatus {
        status: LinkStatus,
    },
    /// Sent only to the session that requested the send.
    SendFailed {
        key: DedupKey,
        channel: ChannelId,
        reason: String,
    },
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Config { .. } => "config",
            SessionEvent::KnownNodes { .. } => "known_nodes",
            SessionEvent::NodeUpdated { .. } => "node_updated",
            SessionEvent::Message { .. } => "message",
            SessionEvent::LinkStatus { .. } => "link_status",
            SessionEvent::SendFailed { .. } => "send_failed",
        }
    }
}

/// Client requests, as received from the web layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    #[serde(rename = "send")]
    Send {
        channel: ChannelId,
        body: String,
        #[serde(default)]
        to: Option<NodeId>,
    },
    #[serde(rename = "subscribe")]
    Subscribe { channels: Vec<ChannelId> },
    #[serde(rename = "announce")]
    Announce,
    #[serde(rename = "config.set")]
    ConfigSet { display_name: String },
    #[serde(rename = "history")]
    History {
        channel: ChannelId,
        #[serde(default)]
        since: Option<Cursor>,
        #[serde(default)]
        limit: Option<usize>,
    },
    #[serde(rename = "nodes")]
    Nodes,
}

/// Direct answer to one [`ClientRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientReply {
    Sent { message: Message },
    Subscribed { channels: Vec<ChannelId> },
    Announced,
    ConfigUpdated { profile: Profile },
    History(HistoryPage),
    Nodes { nodes: Vec<Node> },
    Error { error: String },
}

struct Slot {
    tx: mpsc::Sender<SessionEvent>,
    channels: HashSet<ChannelId>,
}

pub struct Broadcaster {
    sessions: HashMap<SessionId, Slot>,
    queue_depth: usize,
}

impl Broadcaster {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            queue_depth: queue_depth.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Register a new session with no subscriptions.
    pub fn attach(&mut self) -> (SessionId, mpsc::Receiver<SessionEvent>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_depth);
        self.sessions.insert(
            id,
            Slot {
                tx,
                channels: HashSet::new(),
            },
        );
        debug!("Session {} attached ({} active)", id, self.sessions.len());
        (id, rx)
    }

    /// Replace the session's channel subscription set.
    pub fn subscribe(
        &mut self,
        id: SessionId,
        channels: impl IntoIterator<Item = ChannelId>,
    ) -> Result<(), GatewayError> {
        let slot = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {}", id)))?;
        slot.channels = channels.into_iter().collect();
        Ok(())
    }

    pub fn unsubscribe(&mut self, id: SessionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            debug!("Session {} detached ({} active)", id, self.sessions.len());
        }
        removed
    }

    /// Deliver a message event to every session subscribed to its channel.
    pub fn publish(&mut self, message: &Message, cursor: Cursor) {
        let targets: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, slot)| slot.channels.contains(&message.channel))
            .map(|(id, _)| *id)
            .collect();
        if targets.is_empty() {
            return;
        }
        let event = SessionEvent::Message {
            message: message.clone(),
            cursor,
        };
        for id in targets {
            self.send_to(id, event.clone());
        }
    }

    /// Deliver to every session regardless of subscriptions.
    pub fn broadcast(&mut self, event: SessionEvent) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.send_to(id, event.clone());
        }
    }

    /// Best-effort delivery to one session. Returns false if the event was not queued.
    pub fn send_to(&mut self, id: SessionId, event: SessionEvent) -> bool {
        let Some(slot) = self.sessions.get(&id) else {
            return false;
        };
        match slot.tx.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(ev)) => {
                metrics::inc_session_events_dropped();
                debug!("Session {} queue full, dropped {} event", id, ev.kind());
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.unsubscribe(id);
                false
            }
        }
    }
}

/// Client-side handle of one connected session. Dropping it detaches the session.
pub struct Session {
    id: SessionId,
    gateway: GatewayHandle,
    events: mpsc::Receiver<SessionEvent>,
    channels: HashSet<ChannelId>,
    cursor: Option<Cursor>,
    closed: bool,
}

impl Session {
    pub(crate) fn new(id: SessionId, gateway: GatewayHandle, events: mpsc::Receiver<SessionEvent>) -> Self {
        Self {
            id,
            gateway,
            events,
            channels: HashSet::new(),
            cursor: None,
            closed: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn channels(&self) -> &HashSet<ChannelId> {
        &self.channels
    }

    /// Newest message position this session has received.
    pub fn cursor(&self) -> Option<Cursor> {
        self.cursor
    }

    /// Replace the subscription set.
    pub async fn subscribe(
        &mut self,
        channels: impl IntoIterator<Item = ChannelId>,
    ) -> Result<(), GatewayError> {
        let channels: HashSet<ChannelId> = channels.into_iter().collect();
        self.gateway
            .subscribe(self.id, channels.iter().copied().collect())
            .await?;
        self.channels = channels;
        Ok(())
    }

    /// Queue a message for the mesh. Returns the Pending message immediately; delivery
    /// progress arrives later as events.
    pub async fn send(&self, channel: ChannelId, body: &str) -> Result<Message, GatewayError> {
        self.send_request(SendRequest {
            channel,
            body: body.to_string(),
            to: None,
        })
        .await
    }

    pub async fn send_request(&self, request: SendRequest) -> Result<Message, GatewayError> {
        self.gateway.send(Some(self.id), request).await
    }

    pub async fn history(
        &self,
        channel: ChannelId,
        since: Option<Cursor>,
        limit: Option<usize>,
    ) -> Result<HistoryPage, GatewayError> {
        self.gateway.history(channel, since, limit).await
    }

    /// Next event for this session, or `None` once the gateway is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        loop {
            let event = self.events.recv().await?;
            if let SessionEvent::Message { message, cursor } = &event {
                if !self.channels.contains(&message.channel) {
                    trace!("Session {} skipping message for ch {}", self.id, message.channel);
                    continue;
                }
                if self.cursor.map_or(true, |c| *cursor > c) {
                    self.cursor = Some(*cursor);
                }
            }
            return Some(event);
        }
    }

    /// Execute one client request. Failures become [`ClientReply::Error`].
    pub async fn handle_request(&mut self, request: ClientRequest) -> ClientReply {
        let result = match request {
            ClientRequest::Send { channel, body, to } => self
                .send_request(SendRequest { channel, body, to })
                .await
                .map(|message| ClientReply::Sent { message }),
            ClientRequest::Subscribe { channels } => {
                let mut sorted = channels.clone();
                sorted.sort_unstable();
                sorted.dedup();
                self.subscribe(channels)
                    .await
                    .map(|_| ClientReply::Subscribed { channels: sorted })
            }
            ClientRequest::Announce => self.gateway.announce().await.map(|_| ClientReply::Announced),
            ClientRequest::ConfigSet { display_name } => self
                .gateway
                .set_display_name(&display_name)
                .await
                .map(|profile| ClientReply::ConfigUpdated { profile }),
            ClientRequest::History {
                channel,
                since,
                limit,
            } => self
                .history(channel, since, limit)
                .await
                .map(ClientReply::History),
            ClientRequest::Nodes => self
                .gateway
                .nodes()
                .await
                .map(|nodes| ClientReply::Nodes { nodes }),
        };
        result.unwrap_or_else(|e| ClientReply::Error {
            error: e.to_string(),
        })
    }

    /// JSON in, JSON out. Malformed or unknown requests produce an error reply.
    pub async fn handle_json(&mut self, raw: &str) -> String {
        let reply = match serde_json::from_str::<ClientRequest>(raw) {
            Ok(request) => self.handle_request(request).await,
            Err(e) => ClientReply::Error {
                error: format!("bad request: {}", e),
            },
        };
        serde_json::to_string(&reply)
            .unwrap_or_else(|_| r#"{"type":"error","error":"unserializable reply"}"#.to_string())
    }

    /// Detach and wait for the core to acknowledge. Messages this session queued keep
    /// going.
    pub async fn close(mut self) {
        self.closed = true;
        let _ = self.gateway.detach(self.id).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            self.gateway.detach_now(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Destination;
    use crate::storage::messages::DeliveryState;
    use chrono::Utc;

    fn message(channel: ChannelId) -> Message {
        Message {
            key: DedupKey::new(1, 2),
            channel,
            destination: Destination::Broadcast,
            body: "hi".to_string(),
            sent_at: Utc::now(),
            state: DeliveryState::Sent,
            outgoing: false,
        }
    }

    const CURSOR: Cursor = Cursor { ts: 0, seq: 0 };

    #[test]
    fn publish_respects_subscriptions() {
        let mut b = Broadcaster::new(8);
        let (a, mut rx_a) = b.attach();
        let (c, mut rx_c) = b.attach();
        b.subscribe(a, [0]).unwrap();
        b.subscribe(c, [1]).unwrap();

        b.publish(&message(0), CURSOR);
        assert!(matches!(rx_a.try_recv(), Ok(SessionEvent::Message { .. })));
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn slow_session_does_not_block_others() {
        let mut b = Broadcaster::new(1);
        let (slow, _rx_slow) = b.attach();
        let (fast, mut rx_fast) = b.attach();
        b.subscribe(slow, [0]).unwrap();
        b.subscribe(fast, [0]).unwrap();

        b.publish(&message(0), CURSOR);
        assert!(rx_fast.try_recv().is_ok());
        b.publish(&message(0), CURSOR);
        assert!(rx_fast.try_recv().is_ok());
        assert_eq!(b.len(), 2);
    }

    #[test]
    fn closed_session_is_removed() {
        let mut b = Broadcaster::new(4);
        let (id, rx) = b.attach();
        drop(rx);
        assert!(!b.send_to(id, SessionEvent::LinkStatus { status: LinkStatus::default() }));
        assert!(b.is_empty());
        assert!(b.subscribe(id, [0]).is_err());
    }

    #[test]
    fn request_json_shapes() {
        let req: ClientRequest =
            serde_json::from_str(r#"{"type":"config.set","display_name":"Base"}"#).unwrap();
        assert_eq!(
            req,
            ClientRequest::ConfigSet {
                display_name: "Base".to_string()
            }
        );
        let req: ClientRequest =
            serde_json::from_str(r#"{"type":"send","channel":0,"body":"hey"}"#).unwrap();
        assert!(matches!(req, ClientRequest::Send { to: None, .. }));
        assert!(serde_json::from_str::<ClientRequest>(r#"{"type":"reboot"}"#).is_err());

        let ev = SessionEvent::LinkStatus {
            status: LinkStatus::default(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "link_status");
        assert_eq!(json["status"]["connected"], false);
    }
}
