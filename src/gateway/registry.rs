//! Known nodes and channels.
//!
//! Nodes are kept in an arena with an id index; nothing is ever removed. Updates may
//! arrive out of order across mesh paths, so each group of fields carries the time it
//! was observed and is only replaced by an observation that is at least as new.
use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::RegistryError;
use crate::mesh::payload::{AnnouncedChannel, PositionPayload, TelemetryPayload};
use crate::mesh::{format_node_id, ChannelId, NodeId, SignalQuality};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub long_name: Option<String>,
    pub short_name: Option<String>,
    /// Never decreases.
    pub last_seen: DateTime<Utc>,
    pub signal: Option<SignalQuality>,
    pub hops_away: Option<u8>,
    pub position: Option<PositionPayload>,
    pub telemetry: Option<TelemetryPayload>,
    #[serde(default)]
    names_at: Option<DateTime<Utc>>,
    #[serde(default)]
    position_at: Option<DateTime<Utc>>,
    #[serde(default)]
    telemetry_at: Option<DateTime<Utc>>,
}

impl Node {
    fn new(id: NodeId, first_seen: DateTime<Utc>) -> Self {
        Self {
            id,
            long_name: None,
            short_name: None,
            last_seen: first_seen,
            signal: None,
            hops_away: None,
            position: None,
            telemetry: None,
            names_at: None,
            position_at: None,
            telemetry_at: None,
        }
    }

    /// Long name if announced, otherwise the `!xxxxxxxx` label.
    pub fn display_name(&self) -> String {
        match self.long_name.as_deref().map(str::trim) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => format_node_id(self.id),
        }
    }
}

/// One observation of a node. `observed_at` orders it against earlier ones.
#[derive(Debug, Clone)]
pub struct NodeUpdate {
    pub observed_at: DateTime<Utc>,
    pub names: Option<(String, String)>,
    pub signal: Option<SignalQuality>,
    pub hop_count: Option<u8>,
    pub position: Option<PositionPayload>,
    pub telemetry: Option<TelemetryPayload>,
}

impl NodeUpdate {
    pub fn seen(observed_at: DateTime<Utc>) -> Self {
        Self {
            observed_at,
            names: None,
            signal: None,
            hop_count: None,
            position: None,
            telemetry: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSource {
    Configured,
    Announced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub label: String,
    pub encrypted: bool,
    pub source: ChannelSource,
}

#[derive(Debug, Default)]
pub struct Registry {
    nodes: Vec<Node>,
    index: HashMap<NodeId, usize>,
    channels: BTreeMap<ChannelId, Channel>,
}

impl Registry {
    pub fn new(configured: impl IntoIterator<Item = Channel>) -> Self {
        let channels = configured
            .into_iter()
            .map(|mut c| {
                c.source = ChannelSource::Configured;
                (c.id, c)
            })
            .collect();
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            channels,
        }
    }

    /// Create or update a node. Each field group only moves to a newer observation.
    pub fn upsert_node(&mut self, id: NodeId, update: NodeUpdate) -> &Node {
        let at = update.observed_at;
        let idx = match self.index.get(&id) {
            Some(&idx) => idx,
            None => {
                self.nodes.push(Node::new(id, at));
                self.index.insert(id, self.nodes.len() - 1);
                self.nodes.len() - 1
            }
        };
        let node = &mut self.nodes[idx];

        // Link metrics describe the most recent contact only
        if at >= node.last_seen {
            if update.signal.is_some() {
                node.signal = update.signal;
            }
            if update.hop_count.is_some() {
                node.hops_away = update.hop_count;
            }
            node.last_seen = at;
        }
        if let Some((long_name, short_name)) = update.names {
            if node.names_at.map_or(true, |t| at >= t) {
                node.long_name = Some(long_name);
                node.short_name = Some(short_name);
                node.names_at = Some(at);
            }
        }
        if let Some(position) = update.position {
            if node.position_at.map_or(true, |t| at >= t) {
                node.position = Some(position);
                node.position_at = Some(at);
            }
        }
        if let Some(telemetry) = update.telemetry {
            if node.telemetry_at.map_or(true, |t| at >= t) {
                node.telemetry = Some(telemetry);
                node.telemetry_at = Some(at);
            }
        }
        node
    }

    pub fn get_node(&self, id: NodeId) -> Result<Node, RegistryError> {
        self.index
            .get(&id)
            .map(|&idx| self.nodes[idx].clone())
            .ok_or(RegistryError::NodeNotFound(id))
    }

    /// Snapshot of every known node.
    pub fn list_nodes(&self) -> Vec<Node> {
        self.nodes.clone()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn list_channels(&self) -> Vec<Channel> {
        self.channels.values().cloned().collect()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    /// Merge a node's channel announcement. Configured channels are never overridden.
    /// Returns true when the channel list changed.
    pub fn announce_channels(&mut self, announced: &[AnnouncedChannel]) -> bool {
        let mut changed = false;
        for a in announced {
            let candidate = Channel {
                id: a.id,
                label: a.label.clone(),
                encrypted: a.encrypted,
                source: ChannelSource::Announced,
            };
            match self.channels.get(&a.id) {
                Some(existing) if existing.source == ChannelSource::Configured => {}
                Some(existing) if *existing == candidate => {}
                _ => {
                    self.channels.insert(a.id, candidate);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Reload persisted nodes. For duplicate ids the most recently seen entry wins.
    pub fn restore(&mut self, nodes: Vec<Node>) {
        for node in nodes {
            match self.index.get(&node.id) {
                Some(&idx) if self.nodes[idx].last_seen >= node.last_seen => {}
                Some(&idx) => self.nodes[idx] = node,
                None => {
                    self.index.insert(node.id, self.nodes.len());
                    self.nodes.push(node);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn names(at: i64, long: &str) -> NodeUpdate {
        NodeUpdate {
            names: Some((long.to_string(), long[..2].to_string())),
            ..NodeUpdate::seen(t(at))
        }
    }

    #[test]
    fn first_update_creates_node() {
        let mut reg = Registry::default();
        assert_eq!(reg.get_node(5), Err(RegistryError::NodeNotFound(5)));
        reg.upsert_node(5, names(0, "Alpha"));
        let node = reg.get_node(5).unwrap();
        assert_eq!(node.display_name(), "Alpha");
        assert_eq!(node.last_seen, t(0));
        assert_eq!(reg.list_nodes().len(), 1);
    }

    #[test]
    fn older_observation_does_not_regress() {
        let mut reg = Registry::default();
        reg.upsert_node(
            1,
            NodeUpdate {
                hop_count: Some(1),
                ..names(10, "Newer")
            },
        );
        let node = reg.upsert_node(
            1,
            NodeUpdate {
                hop_count: Some(4),
                ..names(5, "Older")
            },
        );
        assert_eq!(node.last_seen, t(10));
        assert_eq!(node.long_name.as_deref(), Some("Newer"));
        assert_eq!(node.hops_away, Some(1));
    }

    #[test]
    fn field_groups_track_their_own_time() {
        let mut reg = Registry::default();
        let telemetry = TelemetryPayload {
            time: 0,
            battery_level: 50,
            voltage_mv: 3900,
            channel_utilization: 1,
            air_util_tx: 1,
            uptime_seconds: 10,
        };
        reg.upsert_node(2, NodeUpdate::seen(t(100)));
        // Telemetry older than last_seen but the first one known: still kept
        let node = reg.upsert_node(
            2,
            NodeUpdate {
                telemetry: Some(telemetry),
                ..NodeUpdate::seen(t(50))
            },
        );
        assert_eq!(node.telemetry, Some(telemetry));
        assert_eq!(node.last_seen, t(100));
    }

    #[test]
    fn configured_channels_win() {
        let mut reg = Registry::new([Channel {
            id: 0,
            label: "Primary".to_string(),
            encrypted: false,
            source: ChannelSource::Announced,
        }]);
        assert_eq!(reg.channel(0).unwrap().source, ChannelSource::Configured);
        let changed = reg.announce_channels(&[
            AnnouncedChannel {
                id: 0,
                label: "Hijack".to_string(),
                encrypted: true,
            },
            AnnouncedChannel {
                id: 2,
                label: "ops".to_string(),
                encrypted: true,
            },
        ]);
        assert!(changed);
        assert_eq!(reg.channel(0).unwrap().label, "Primary");
        assert_eq!(reg.list_channels().len(), 2);
        assert!(!reg.announce_channels(&[AnnouncedChannel {
            id: 2,
            label: "ops".to_string(),
            encrypted: true,
        }]));
    }
}
