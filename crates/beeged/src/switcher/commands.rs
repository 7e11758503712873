//! Switcher mailbox commands and errors.
//!
//! All types are designed for async message passing and follow the
//! panic-free policy.

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use beege_protocol::ProtocolError;

use crate::server::{Connection, ConnectionId};

// ============================================================================
// Switcher Commands
// ============================================================================

/// Events processed by the switcher actor, one at a time.
#[derive(Debug)]
pub enum SwitcherCommand {
    /// Add a connection to the live set.
    ///
    /// The reply is sent once the connection is visible to broadcasts.
    Register {
        conn: Arc<Connection>,
        respond_to: oneshot::Sender<()>,
    },

    /// Remove a connection from the live set.
    ///
    /// Fires the peer-lost callback if the connection was registered and
    /// carried a `src` label.
    Unregister { id: ConnectionId },

    /// Write an encoded frame to the live connections in `audience`.
    Broadcast { frame: Bytes, audience: Audience },

    /// Number of live connections.
    ConnectionCount { respond_to: oneshot::Sender<usize> },

    /// `src` labels of live connections.
    Peers {
        respond_to: oneshot::Sender<Vec<String>>,
    },
}

/// Which live connections a broadcast reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Every live connection.
    All,

    /// Only connections whose peer has announced its address. Sockets
    /// still in a request/reply exchange are skipped, so they never read a
    /// broadcast in place of their reply.
    Labelled,
}

/// Errors that can occur in switcher operations.
#[derive(Debug, Error)]
pub enum SwitcherError {
    #[error("Handler already registered for command: {0}")]
    DuplicateHandler(String),

    #[error("Invalid handler name: '{0}'")]
    InvalidCommandName(String),

    #[error("Switcher mailbox is full")]
    MailboxFull,

    #[error("Switcher channel closed")]
    ChannelClosed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SwitcherError::DuplicateHandler("heartbeat".to_string());
        assert!(err.to_string().contains("heartbeat"));

        let err = SwitcherError::InvalidCommandName("two words".to_string());
        assert!(err.to_string().contains("two words"));
    }
}
