//! # Meshchat - Web Chat Gateway for Packet-Radio Mesh Networks
//!
//! Meshchat bridges a mesh radio attached over USB serial or TCP to any number of chat
//! clients. It decodes the radio's binary frames, keeps a model of the nodes and
//! channels it has heard, stores chat history with duplicate suppression, tracks the
//! delivery of outgoing messages, and fans updates out to connected sessions.
//!
//! ## Features
//!
//! - **Configurable Frame Codec**: Field widths, marker and checksum follow the radio
//!   firmware's protocol revision instead of being hard-coded.
//! - **Resilient Link**: Corrupt frames are skipped, dropped links reconnect with
//!   exponential backoff, and queued messages survive the outage in order.
//! - **Delivery Tracking**: Pending → Sent → Acked, with ack timeouts, retries and a
//!   `send_failed` notification to the originating session.
//! - **Session Fan-out**: Each client has its own bounded event queue and channel
//!   subscriptions; a slow client never stalls the radio.
//! - **Persistence**: Nodes, messages and the gateway profile are saved atomically to a
//!   locked data directory.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshchat::config::Config;
//! use meshchat::gateway::Gateway;
//! use meshchat::storage::JsonFileStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = JsonFileStore::open(&config.storage.data_dir)?;
//!     let gateway = Gateway::spawn(config.gateway_settings()?, config.connector(None), store)?;
//!
//!     let mut session = gateway.handle().attach().await?;
//!     session.subscribe([0]).await?;
//!     session.send(0, "hello from the gateway").await?;
//!
//!     gateway.shutdown().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`mesh`] - Transport adapters, frame codec, payloads and the link supervisor
//! - [`gateway`] - Core task: dispatcher, registry, outbox and session broadcaster
//! - [`storage`] - Message store and the persistence boundary
//! - [`config`] - Configuration loading and validation
//! - [`validation`] - Input validation for client-supplied text and ids
//! - [`metrics`] - Process-wide counters
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Sessions     │ ← Web clients (JSON events and requests)
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Gateway Core   │ ← Single writer for all state
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Link Supervisor│ ← Framing, reconnects, send pacing
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  Radio Device   │
//! └─────────────────┘
//! ```

pub mod config;
pub mod gateway;
pub mod logutil;
pub mod mesh;
pub mod metrics;
pub mod storage;
pub mod validation;
