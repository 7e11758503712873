//! Client interface for interacting with the SwitcherActor.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `SwitcherError::ChannelClosed`
//! - Queries degrade to an empty answer when the actor is gone

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use beege_protocol::encode_command;

use super::commands::{Audience, SwitcherCommand, SwitcherError};
use super::handlers::{Handler, HandlerTable};
use crate::server::{Connection, ConnectionId};

// ============================================================================
// Broadcaster
// ============================================================================

/// Send-only view of the switcher mailbox.
///
/// Available before the actor spawns, so handlers that gossip can capture
/// one while the handler table is still being built.
#[derive(Clone, Debug)]
pub struct Broadcaster {
    sender: mpsc::Sender<SwitcherCommand>,
}

impl Broadcaster {
    pub(crate) fn new(sender: mpsc::Sender<SwitcherCommand>) -> Self {
        Self { sender }
    }

    /// Queues an encoded frame for every live connection.
    ///
    /// Waits only while the mailbox is full.
    pub async fn broadcast(&self, frame: Bytes) -> Result<(), SwitcherError> {
        self.send_broadcast(frame, Audience::All).await
    }

    /// Queues an encoded frame for live connections whose peer has
    /// announced its address.
    pub async fn broadcast_to_peers(&self, frame: Bytes) -> Result<(), SwitcherError> {
        self.send_broadcast(frame, Audience::Labelled).await
    }

    async fn send_broadcast(&self, frame: Bytes, audience: Audience) -> Result<(), SwitcherError> {
        self.sender
            .send(SwitcherCommand::Broadcast { frame, audience })
            .await
            .map_err(|_| SwitcherError::ChannelClosed)
    }

    /// Queues an encoded frame without waiting.
    ///
    /// # Errors
    ///
    /// - `SwitcherError::MailboxFull` if the frame was dropped
    /// - `SwitcherError::ChannelClosed` if the actor has shut down
    pub fn try_broadcast(&self, frame: Bytes) -> Result<(), SwitcherError> {
        self.sender
            .try_send(SwitcherCommand::Broadcast {
                frame,
                audience: Audience::All,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => SwitcherError::MailboxFull,
                TrySendError::Closed(_) => SwitcherError::ChannelClosed,
            })
    }

    /// Encodes `"<payload> <name>"` and broadcasts it.
    pub async fn broadcast_command(&self, name: &str, payload: &[u8]) -> Result<(), SwitcherError> {
        let frame = encode_command(name, payload)?;
        self.broadcast(frame).await
    }

    /// Encodes `"<payload> <name>"` and broadcasts it to labelled peers.
    pub async fn broadcast_command_to_peers(
        &self,
        name: &str,
        payload: &[u8],
    ) -> Result<(), SwitcherError> {
        let frame = encode_command(name, payload)?;
        self.broadcast_to_peers(frame).await
    }
}

// ============================================================================
// Switcher Handle
// ============================================================================

/// Handle for interacting with the switcher actor.
///
/// Cheap to clone and shared by the listener, every receive loop, the
/// dialer and the reporters.
#[derive(Clone, Debug)]
pub struct SwitcherHandle {
    broadcaster: Broadcaster,

    /// Frozen handler table
    handlers: Arc<HandlerTable>,
}

impl SwitcherHandle {
    pub(crate) fn new(broadcaster: Broadcaster, handlers: Arc<HandlerTable>) -> Self {
        Self {
            broadcaster,
            handlers,
        }
    }

    /// Adds a connection to the live set and waits until the actor has
    /// applied it.
    pub async fn register(&self, conn: Arc<Connection>) -> Result<(), SwitcherError> {
        let (tx, rx) = oneshot::channel();

        self.broadcaster
            .sender
            .send(SwitcherCommand::Register {
                conn,
                respond_to: tx,
            })
            .await
            .map_err(|_| SwitcherError::ChannelClosed)?;

        rx.await.map_err(|_| SwitcherError::ChannelClosed)
    }

    /// Removes a connection from the live set (fire-and-forget).
    pub async fn unregister(&self, id: ConnectionId) -> Result<(), SwitcherError> {
        self.broadcaster
            .sender
            .send(SwitcherCommand::Unregister { id })
            .await
            .map_err(|_| SwitcherError::ChannelClosed)
    }

    pub async fn broadcast(&self, frame: Bytes) -> Result<(), SwitcherError> {
        self.broadcaster.broadcast(frame).await
    }

    pub fn try_broadcast(&self, frame: Bytes) -> Result<(), SwitcherError> {
        self.broadcaster.try_broadcast(frame)
    }

    pub async fn broadcast_command(&self, name: &str, payload: &[u8]) -> Result<(), SwitcherError> {
        self.broadcaster.broadcast_command(name, payload).await
    }

    /// Number of live connections, or 0 if the actor is gone.
    pub async fn connection_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();

        if self
            .broadcaster
            .sender
            .send(SwitcherCommand::ConnectionCount { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }

        rx.await.unwrap_or(0)
    }

    /// Sorted `src` labels of live connections.
    pub async fn peers(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();

        if self
            .broadcaster
            .sender
            .send(SwitcherCommand::Peers { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    /// True if a live connection is labelled with `address`.
    pub async fn is_connected(&self, address: &str) -> bool {
        self.peers().await.iter().any(|peer| peer == address)
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name)
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }
}
