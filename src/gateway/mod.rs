//! # Gateway Core
//!
//! The session-state engine between the radio link and web clients.
//!
//! All mutable state (node registry, message store, outbound queue, session table) is
//! owned by one core task. Everything else talks to it over channels: the link
//! supervisor sends [`LinkEvent`](crate::mesh::supervisor::LinkEvent)s, clients send
//! commands through a [`GatewayHandle`]. There are no locks around the model.
//!
//! ```text
//!                 ┌──────────── core task ────────────┐
//! LinkEvent ────▶ │ Dispatcher ─▶ Registry, Store      │ ──SessionEvent──▶ sessions
//! Command   ────▶ │ Outbox ─▶ OutboundFrame ─▶ link    │
//!                 └────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshchat::config::Config;
//! use meshchat::gateway::Gateway;
//! use meshchat::storage::NullStore;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let config = Config::load("config.toml").await?;
//! let gateway = Gateway::spawn(config.gateway_settings()?, config.connector(None), NullStore)?;
//! let mut session = gateway.handle().attach().await?;
//! session.subscribe([0]).await?;
//! session.send(0, "hello mesh").await?;
//! while let Some(event) = session.recv().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod errors;
pub mod outbox;
pub mod registry;
pub mod server;
pub mod session;

use serde::{Deserialize, Serialize};

use crate::mesh::NodeId;

pub use errors::{GatewayError, RegistryError};
pub use server::{Gateway, GatewayHandle, GatewaySettings, GatewayStatus, HistoryPage, SendRequest};
pub use session::{ClientReply, ClientRequest, Session, SessionEvent, SessionId};

/// This gateway's own identity on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub node_id: NodeId,
    pub display_name: String,
}

impl Profile {
    /// Up to four alphanumerics of the display name, uppercased; falls back to the last
    /// four hex digits of the node id.
    pub fn short_name(&self) -> String {
        let short: String = self
            .display_name
            .chars()
            .filter(|c| c.is_alphanumeric())
            .take(4)
            .collect::<String>()
            .to_uppercase();
        if short.is_empty() {
            format!("{:04x}", self.node_id & 0xFFFF)
        } else {
            short
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_from_display_name() {
        let p = Profile {
            node_id: 0xdeadbeef,
            display_name: "base camp".to_string(),
        };
        assert_eq!(p.short_name(), "BASE");
        let p = Profile {
            node_id: 0xdeadbeef,
            display_name: "--".to_string(),
        };
        assert_eq!(p.short_name(), "beef");
    }
}
