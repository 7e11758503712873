//! Switcher actor - owns the live connection set.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Per-connection write failures are logged and never abort a fan-out
//! - Reply send failures (caller gone) are ignored

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::commands::{Audience, SwitcherCommand};
use super::handlers::PeerLost;
use crate::server::{Connection, ConnectionId};

// ============================================================================
// Switcher Actor
// ============================================================================

/// The switcher actor.
///
/// Receives register/unregister/broadcast/query events over its mailbox and
/// processes them strictly one at a time, so a broadcast never observes a
/// half-applied registration.
pub struct SwitcherActor {
    receiver: mpsc::Receiver<SwitcherCommand>,

    /// Live connections keyed by connection ID, with their join time
    connections: HashMap<ConnectionId, (Arc<Connection>, Instant)>,

    peer_lost: Arc<dyn PeerLost>,
}

impl SwitcherActor {
    pub fn new(receiver: mpsc::Receiver<SwitcherCommand>, peer_lost: Arc<dyn PeerLost>) -> Self {
        Self {
            receiver,
            connections: HashMap::new(),
            peer_lost,
        }
    }

    /// Runs the actor event loop until every sender is dropped.
    pub async fn run(mut self) {
        info!("Switcher actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
        }

        info!(
            connections = self.connections.len(),
            "Switcher actor stopped"
        );
    }

    async fn handle_command(&mut self, cmd: SwitcherCommand) {
        match cmd {
            SwitcherCommand::Register { conn, respond_to } => {
                self.handle_register(conn);
                let _ = respond_to.send(());
            }
            SwitcherCommand::Unregister { id } => {
                self.handle_unregister(id).await;
            }
            SwitcherCommand::Broadcast { frame, audience } => {
                self.fan_out(&frame, audience).await;
            }
            SwitcherCommand::ConnectionCount { respond_to } => {
                let _ = respond_to.send(self.connections.len());
            }
            SwitcherCommand::Peers { respond_to } => {
                let _ = respond_to.send(self.peers());
            }
        }
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    fn handle_register(&mut self, conn: Arc<Connection>) {
        debug!(
            connection = conn.id(),
            peer = ?conn.peer_addr(),
            src = ?conn.src(),
            "Connection registered"
        );
        self.connections.insert(conn.id(), (conn, Instant::now()));
    }

    /// Removes a connection and fires the peer-lost callback exactly once
    /// for a labelled peer. Unknown IDs are ignored.
    async fn handle_unregister(&mut self, id: ConnectionId) {
        let Some((conn, joined_at)) = self.connections.remove(&id) else {
            debug!(connection = id, "Unregister for unknown connection");
            return;
        };

        debug!(
            connection = id,
            src = ?conn.src(),
            connected_secs = joined_at.elapsed().as_secs(),
            remaining = self.connections.len(),
            "Connection unregistered"
        );

        let Some(address) = conn.src() else {
            return;
        };

        info!(address = %address, "Peer lost");
        if let Some(frame) = self.peer_lost.on_peer_lost(address).await {
            self.fan_out(&frame, Audience::All).await;
        }
    }

    /// Writes `frame` to every live connection in `audience`, in turn.
    ///
    /// A failed write closes that connection (see [`Connection::send_frame`]);
    /// its receive loop then unregisters it.
    async fn fan_out(&self, frame: &Bytes, audience: Audience) {
        let mut delivered = 0usize;

        for (conn, _) in self.connections.values() {
            if conn.is_closed() {
                continue;
            }
            if audience == Audience::Labelled && conn.src().is_none() {
                continue;
            }

            match conn.send_frame(frame).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(
                        connection = conn.id(),
                        src = ?conn.src(),
                        error = %e,
                        "Broadcast write failed"
                    );
                }
            }
        }

        debug!(
            delivered,
            ?audience,
            connections = self.connections.len(),
            "Broadcast complete"
        );
    }

    fn peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .connections
            .values()
            .filter_map(|(conn, _)| conn.src().map(str::to_string))
            .collect();
        peers.sort_unstable();
        peers
    }
}
