//! Cluster membership: discovery, greeting, gossip and reconnection.
//!
//! Built on the connection, switcher and listener primitives. Each node has
//! one [`NodeContext`] (its role, advertised address, roster and tuning)
//! which every handler, the discovery walk, the dialer and the reporters
//! share.
//!
//! # Architecture
//!
//! ```text
//!          controller                                docker
//! ┌──────────────────────────┐            ┌──────────────────────────┐
//! │ Listener ─▶ receive loop │◀── dial ───│ connect_and_greet        │
//! │   controller handlers    │            │   docker handlers        │
//! │   ControllerPeerLost     │── gossip ─▶│   DockerPeerLost         │
//! │                          │◀─ reports ─│ status / event reporters │
//! │ Roster (RwLock tables)   │            │ Reconnector ◀── queue    │
//! └──────────────────────────┘            └──────────────────────────┘
//! ```
//!
//! Outbound connection states on a docker node:
//! `Disconnected → Dialing → Greeting → Established → Disconnected → Backoff
//! → Dialing ...`. The reconnect queue drives the `Backoff → Dialing` edge.
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - Malformed payloads are logged and answered or ignored
//! - Engine and encoding failures never terminate a connection

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use beege_core::{validate_address, DomainError, Role};

mod dialer;
mod discovery;
mod handlers;
mod node;
mod reporter;
mod roster;

pub use dialer::{connect_and_greet, ReconnectPolicy, ReconnectQueue, Reconnector};
pub use discovery::{discover, request_roster, DiscoveryError, DiscoveryLimits, DiscoveryReport};
pub use handlers::{
    register_controller_handlers, register_docker_handlers, ControllerPeerLost, DockerPeerLost,
};
pub use node::{start_controller, start_docker, ControllerNode, DockerNode};
pub use reporter::{report_inventory, run_event_reporter, run_status_reporter};
pub use roster::Roster;

use crate::server::ServerError;
use crate::switcher::SwitcherError;

/// Timing and limits for membership tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipSettings {
    /// Upper bound on establishing a TCP connection
    pub dial_timeout: Duration,

    /// Upper bound on waiting for a join reply
    pub reply_timeout: Duration,

    pub discovery: DiscoveryLimits,

    pub reconnect: ReconnectPolicy,

    /// Period of `docker_status` and `heartbeat` reports
    pub status_interval: Duration,

    /// Switcher mailbox capacity
    pub mailbox_capacity: usize,
}

impl Default for MembershipSettings {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(5),
            discovery: DiscoveryLimits::default(),
            reconnect: ReconnectPolicy::default(),
            status_interval: Duration::from_secs(5),
            mailbox_capacity: crate::switcher::MAILBOX_CAPACITY,
        }
    }
}

/// Identity and shared state of this node.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub role: Role,

    /// Advertised cluster address
    pub address: String,

    pub roster: Arc<Roster>,

    pub settings: MembershipSettings,
}

impl NodeContext {
    /// Creates a context with an empty roster.
    ///
    /// # Errors
    ///
    /// `DomainError::InvalidAddress` if `address` is empty or contains
    /// whitespace.
    pub fn new(
        role: Role,
        address: impl Into<String>,
        settings: MembershipSettings,
    ) -> Result<Self, DomainError> {
        let address = address.into();
        validate_address(&address)?;
        Ok(Self {
            role,
            address,
            roster: Arc::new(Roster::new()),
            settings,
        })
    }

    pub fn is_self(&self, address: &str) -> bool {
        self.address == address
    }
}

/// Errors that prevent a node from starting.
#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Switcher error: {0}")]
    Switcher(#[from] SwitcherError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("Node role is {actual}, expected {expected}")]
    WrongRole { expected: Role, actual: Role },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = MembershipSettings::default();
        assert_eq!(settings.status_interval, Duration::from_secs(5));
        assert_eq!(settings.mailbox_capacity, 256);
        assert_eq!(settings.reconnect.backoff_ticks, 3);
        assert_eq!(settings.reconnect.max_attempts, None);
    }

    #[test]
    fn test_context_validates_address() {
        assert!(NodeContext::new(Role::Docker, "10.0.0.5:7000", MembershipSettings::default()).is_ok());
        assert!(NodeContext::new(Role::Docker, "", MembershipSettings::default()).is_err());
        assert!(NodeContext::new(Role::Docker, "a b", MembershipSettings::default()).is_err());
    }

    #[test]
    fn test_is_self() {
        let node =
            NodeContext::new(Role::Controller, "10.0.0.1:9001", MembershipSettings::default()).unwrap();
        assert!(node.is_self("10.0.0.1:9001"));
        assert!(!node.is_self("10.0.0.2:9001"));
    }
}
