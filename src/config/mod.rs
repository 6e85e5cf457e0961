//! # Configuration Management Module
//!
//! TOML configuration for the gateway: radio transport, frame layout, delivery and
//! reconnect timing, session buffers, persistence and logging.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshchat::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     Config::create_default("config.toml").await?;
//!     let config = Config::load("config.toml").await?;
//!     println!("Radio: {}", config.transport.port);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [gateway]
//! display_name = "Base Camp"
//! node_id = "!1a2b3c4d"
//!
//! [transport]
//! kind = "serial"
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//!
//! [delivery]
//! ack_timeout_ms = 30000
//! max_attempts = 3
//!
//! [[channels]]
//! id = 0
//! label = "Primary"
//! ```
//!
//! Every section except `[gateway]` may be omitted and falls back to its defaults.
//! CLI arguments (`--port`) take precedence over file values.

use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::gateway::outbox::OutboxSettings;
use crate::gateway::registry::{Channel, ChannelSource};
use crate::gateway::{GatewaySettings, Profile};
use crate::mesh::framer::{ChecksumKind, FrameLayout};
use crate::mesh::supervisor::{BackoffPolicy, SupervisorSettings};
use crate::mesh::transport::DeviceConnector;
use crate::mesh::ChannelId;
use crate::validation::{parse_node_id, validate_display_name};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub codec: CodecConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub sessions: SessionsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub display_name: String,
    /// Own node id as decimal, `0x`-hex or `!`-hex.
    pub node_id: String,
    #[serde(default = "default_hop_limit")]
    pub hop_limit: u8,
}

fn default_hop_limit() -> u8 {
    3
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Serial,
    Tcp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    pub kind: TransportKind,
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// `host:port` of a network-attached radio.
    #[serde(default)]
    pub address: String,
    /// Minimum gap between consecutive frame writes (ms).
    #[serde(default = "default_min_send_gap_ms")]
    pub min_send_gap_ms: u64,
    /// Exit at startup if the first connect fails instead of retrying in the background.
    #[serde(default)]
    pub require_device_at_startup: bool,
}

fn default_baud_rate() -> u32 {
    115200
}

fn default_min_send_gap_ms() -> u64 {
    250
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Serial,
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
            address: String::new(),
            min_send_gap_ms: default_min_send_gap_ms(),
            require_device_at_startup: false,
        }
    }
}

/// Frame layout of the radio firmware. Defaults describe protocol version 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub version: u8,
    /// Start-of-frame marker as hex, e.g. `"94c3"`. Empty disables the marker.
    pub magic: String,
    pub length_width: usize,
    pub node_id_width: usize,
    pub channel_width: usize,
    pub packet_id_width: usize,
    pub signal_fields: bool,
    pub checksum: ChecksumKind,
    pub max_frame_size: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        let v1 = FrameLayout::v1();
        Self {
            version: v1.version,
            magic: encode_hex(&v1.magic),
            length_width: v1.length_width,
            node_id_width: v1.node_id_width,
            channel_width: v1.channel_width,
            packet_id_width: v1.packet_id_width,
            signal_fields: v1.signal_fields,
            checksum: v1.checksum,
            max_frame_size: v1.max_frame_size,
        }
    }
}

impl CodecConfig {
    pub fn layout(&self) -> Result<FrameLayout> {
        let layout = FrameLayout {
            version: self.version,
            magic: decode_hex(&self.magic)?,
            length_width: self.length_width,
            node_id_width: self.node_id_width,
            channel_width: self.channel_width,
            packet_id_width: self.packet_id_width,
            signal_fields: self.signal_fields,
            checksum: self.checksum,
            max_frame_size: self.max_frame_size,
        };
        layout
            .validate()
            .map_err(|e| anyhow!("Invalid [codec] section: {}", e))?;
        Ok(layout)
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn decode_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = cleaned.trim_start_matches("0x");
    if !cleaned.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(anyhow!("magic '{}' is not valid hex", s));
    }
    if cleaned.len() % 2 != 0 {
        return Err(anyhow!("magic '{}' must have an even number of hex digits", s));
    }
    cleaned
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or_else(|| anyhow!("magic '{}' is not valid hex", s))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub ack_timeout_ms: u64,
    /// Total transmissions per message, including the first.
    pub max_attempts: u8,
    pub max_queue: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        let d = OutboxSettings::default();
        Self {
            ack_timeout_ms: d.ack_timeout.as_millis() as u64,
            max_attempts: d.max_attempts,
            max_queue: d.max_queue,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
    /// Drop the link after this long without traffic. 0 disables.
    pub liveness_timeout_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.2,
            liveness_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    /// Per-session event buffer. A session that falls this far behind loses events.
    pub queue_depth: usize,
    pub history_page: usize,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            queue_depth: 256,
            history_page: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
    pub persist: bool,
    /// 0 writes only at shutdown.
    pub flush_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
            persist: true,
            flush_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: ChannelId,
    pub label: String,
    #[serde(default)]
    pub encrypted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Check values that serde alone cannot.
    pub fn validate(&self) -> Result<()> {
        validate_display_name(&self.gateway.display_name)
            .map_err(|e| anyhow!("[gateway] display_name {}", e))?;
        self.node_id()?;
        let layout = self.codec.layout()?;
        if self.node_id()? >= layout.broadcast_id() {
            return Err(anyhow!(
                "[gateway] node_id does not fit the {}-byte node id field",
                layout.node_id_width
            ));
        }
        match self.transport.kind {
            TransportKind::Serial if self.transport.port.trim().is_empty() => {
                return Err(anyhow!("[transport] port is required for serial"));
            }
            TransportKind::Tcp if self.transport.address.trim().is_empty() => {
                return Err(anyhow!("[transport] address is required for tcp"));
            }
            _ => {}
        }
        if self.delivery.max_attempts == 0 {
            return Err(anyhow!("[delivery] max_attempts must be at least 1"));
        }
        if self.delivery.ack_timeout_ms == 0 {
            return Err(anyhow!("[delivery] ack_timeout_ms must be positive"));
        }
        if self.delivery.max_queue == 0 {
            return Err(anyhow!("[delivery] max_queue must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(anyhow!("[reconnect] jitter must be within 0.0..=1.0"));
        }
        if self.reconnect.base_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.base_delay_ms
        {
            return Err(anyhow!("[reconnect] need 0 < base_delay_ms <= max_delay_ms"));
        }
        if self.sessions.queue_depth == 0 || self.sessions.history_page == 0 {
            return Err(anyhow!("[sessions] queue_depth and history_page must be positive"));
        }
        let max_channel = if layout.channel_width == 1 { 0xFF } else { 0xFFFF };
        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if ch.id > max_channel {
                return Err(anyhow!("channel {} does not fit the channel field", ch.id));
            }
            if !seen.insert(ch.id) {
                return Err(anyhow!("channel {} is configured twice", ch.id));
            }
        }
        Ok(())
    }

    pub fn node_id(&self) -> Result<u64> {
        parse_node_id(&self.gateway.node_id).map_err(|e| anyhow!("[gateway] {}", e))
    }

    /// Connector for the configured radio. `port_override` (from `--port`) replaces the
    /// serial port or, when it looks like `host:port` or starts with `tcp://`, selects TCP.
    pub fn connector(&self, port_override: Option<String>) -> DeviceConnector {
        match port_override {
            Some(p) if p.starts_with("tcp://") => DeviceConnector::Tcp {
                address: p.trim_start_matches("tcp://").to_string(),
            },
            Some(p) if looks_like_socket_addr(&p) => DeviceConnector::Tcp { address: p },
            Some(p) => DeviceConnector::Serial {
                port: p,
                baud_rate: self.transport.baud_rate,
            },
            None => match self.transport.kind {
                TransportKind::Serial => DeviceConnector::Serial {
                    port: self.transport.port.clone(),
                    baud_rate: self.transport.baud_rate,
                },
                TransportKind::Tcp => DeviceConnector::Tcp {
                    address: self.transport.address.clone(),
                },
            },
        }
    }

    /// Resolve everything the gateway core needs.
    pub fn gateway_settings(&self) -> Result<GatewaySettings> {
        let display_name = validate_display_name(&self.gateway.display_name)
            .map_err(|e| anyhow!("[gateway] display_name {}", e))?;
        let liveness = match self.reconnect.liveness_timeout_secs {
            0 => None,
            s => Some(Duration::from_secs(s)),
        };
        Ok(GatewaySettings {
            profile: Profile {
                node_id: self.node_id()?,
                display_name,
            },
            hop_limit: self.gateway.hop_limit,
            channels: self
                .channels
                .iter()
                .map(|c| Channel {
                    id: c.id,
                    label: c.label.clone(),
                    encrypted: c.encrypted,
                    source: ChannelSource::Configured,
                })
                .collect(),
            layout: self.codec.layout()?,
            outbox: OutboxSettings {
                ack_timeout: Duration::from_millis(self.delivery.ack_timeout_ms),
                max_attempts: self.delivery.max_attempts,
                max_queue: self.delivery.max_queue,
            },
            link: SupervisorSettings {
                backoff: BackoffPolicy {
                    base: Duration::from_millis(self.reconnect.base_delay_ms),
                    max: Duration::from_millis(self.reconnect.max_delay_ms),
                    jitter: self.reconnect.jitter,
                },
                liveness_timeout: liveness,
                min_send_gap: Duration::from_millis(self.transport.min_send_gap_ms),
            },
            session_queue_depth: self.sessions.queue_depth,
            history_page: self.sessions.history_page,
            flush_interval: Duration::from_secs(self.storage.flush_interval_secs),
        })
    }
}

fn looks_like_socket_addr(s: &str) -> bool {
    match s.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && !host.contains('/') && port.parse::<u16>().is_ok(),
        None => false,
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            gateway: GatewayConfig {
                display_name: "meshchat gateway".to_string(),
                node_id: "!00000001".to_string(),
                hop_limit: default_hop_limit(),
            },
            transport: TransportConfig::default(),
            codec: CodecConfig::default(),
            delivery: DeliveryConfig::default(),
            reconnect: ReconnectConfig::default(),
            sessions: SessionsConfig::default(),
            storage: StorageConfig::default(),
            channels: vec![ChannelConfig {
                id: 0,
                label: "Primary".to_string(),
                encrypted: false,
            }],
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshchat.log".to_string()),
            },
        }
    }
}
