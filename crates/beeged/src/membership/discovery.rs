//! Bootstrap discovery of the controller set.
//!
//! Starting from a join point, each controller is asked for its controller
//! roster with a role-tagged join request. Addresses not yet known are
//! recorded and asked in turn, until no new controllers turn up.
//!
//! ```text
//! joiner ── "<self> docker_join_cluster" ──▶ controller A
//!        ◀── "{B:ts, C:ts} 0 docker_join" ──
//!        ── ... ──▶ B, C (if unknown)
//! ```
//!
//! The traversal carries a visited set, so each address is dialed at most
//! once per run, and is bounded by a depth limit and a peer limit so a
//! misbehaving controller cannot make it fan out without end. A failed
//! branch (dial error, timeout, FAILURE reply, undecodable roster) is
//! recorded in the report and the traversal carries on with the rest.

use std::collections::HashSet;

use bytes::Bytes;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use beege_core::{validate_address, PeerTable, Role};
use beege_protocol::commands::{join_command, join_reply};
use beege_protocol::{decode_command, decode_roster, split_result, PayloadError};

use super::NodeContext;
use crate::server::{Connection, ConnectionError, FrameReader};

/// Bounds on a single discovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryLimits {
    /// Longest chain of referrals followed from the join point
    pub max_depth: usize,

    /// Most controllers dialed in one run
    pub max_peers: usize,
}

impl Default for DiscoveryLimits {
    fn default() -> Self {
        Self {
            max_depth: 16,
            max_peers: 1024,
        }
    }
}

/// Outcome of a discovery run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Controllers dialed, in order
    pub dialed: Vec<String>,

    /// Controllers newly recorded in the roster
    pub discovered: Vec<String>,

    /// Controllers whose branch was aborted
    pub failed: Vec<String>,
}

/// Errors that abort one discovery branch.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("No join reply from {address} within the timeout")]
    ReplyTimeout { address: String },

    #[error("Join rejected by {address}")]
    Rejected { address: String },

    #[error("Invalid roster payload: {0}")]
    Payload(#[from] PayloadError),
}

/// Discovers the controller set reachable from `join_address`.
///
/// The join point is always dialed, even when already known. Every newly
/// learned controller is inserted into `node.roster` before it is dialed.
pub async fn discover(node: &NodeContext, join_address: &str) -> DiscoveryReport {
    let limits = node.settings.discovery;
    let mut report = DiscoveryReport::default();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(node.address.clone());

    let mut pending: Vec<(String, usize)> = vec![(join_address.to_string(), 0)];

    while let Some((address, depth)) = pending.pop() {
        if !visited.insert(address.clone()) {
            continue;
        }
        if report.dialed.len() >= limits.max_peers {
            warn!(
                max_peers = limits.max_peers,
                "Discovery peer limit reached, stopping"
            );
            break;
        }

        report.dialed.push(address.clone());
        let roster = match request_roster(node, &address).await {
            Ok(roster) => roster,
            Err(e) => {
                warn!(address = %address, error = %e, "Discovery branch failed");
                report.failed.push(address);
                continue;
            }
        };

        debug!(address = %address, controllers = roster.len(), "Received controller roster");

        let mut fresh = Vec::new();
        for peer in roster.addresses() {
            if validate_address(peer).is_err() {
                warn!(address = %address, peer = %peer, "Ignoring invalid address in roster");
                continue;
            }
            if node.roster.insert_if_absent(Role::Controller, peer).await {
                report.discovered.push(peer.to_string());
                fresh.push(peer.to_string());
            }
        }

        if depth + 1 > limits.max_depth {
            if !fresh.is_empty() {
                warn!(
                    address = %address,
                    max_depth = limits.max_depth,
                    skipped = fresh.len(),
                    "Discovery depth limit reached"
                );
            }
            continue;
        }
        // Reverse so the stack pops in address order
        pending.extend(fresh.into_iter().rev().map(|peer| (peer, depth + 1)));
    }

    info!(
        join = %join_address,
        dialed = report.dialed.len(),
        discovered = report.discovered.len(),
        failed = report.failed.len(),
        "Discovery complete"
    );
    report
}

/// Sends this node's join request to `address` and decodes the roster reply.
pub async fn request_roster(node: &NodeContext, address: &str) -> Result<PeerTable, DiscoveryError> {
    let (conn, mut reader) = Connection::connect(address, node.settings.dial_timeout).await?;

    let result = exchange_join(node, address, &conn, &mut reader).await;

    if let Err(e) = conn.close().await {
        debug!(address = %address, error = %e, "Close after join failed");
    }
    result
}

/// Sends the join request, then waits for the matching reply.
///
/// Frames with any other name (a broadcast that raced the request, or an
/// undecodable frame) are skipped; the reply timeout covers the whole wait.
async fn exchange_join(
    node: &NodeContext,
    address: &str,
    conn: &Connection,
    reader: &mut FrameReader,
) -> Result<PeerTable, DiscoveryError> {
    conn.send_command(join_command(node.role), node.address.as_bytes())
        .await?;

    let expected = join_reply(node.role);
    let wait_for_reply = async {
        loop {
            let body = reader.read_frame().await?.ok_or(ConnectionError::Eof)?;
            match decode_command(&body) {
                Ok(frame) if frame.name == expected => {
                    return Ok::<Bytes, ConnectionError>(frame.payload);
                }
                Ok(frame) => debug!(
                    address = %address,
                    command = %frame.name,
                    "Skipping frame while awaiting join reply"
                ),
                Err(e) => debug!(
                    address = %address,
                    error = %e,
                    "Skipping undecodable frame while awaiting join reply"
                ),
            }
        }
    };

    let payload = timeout(node.settings.reply_timeout, wait_for_reply)
        .await
        .map_err(|_| DiscoveryError::ReplyTimeout {
            address: address.to_string(),
        })??;

    let (code, roster) = split_result(&payload).map_err(ConnectionError::from)?;
    if !code.is_success() {
        return Err(DiscoveryError::Rejected {
            address: address.to_string(),
        });
    }

    Ok(decode_roster(&roster)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::membership::{MembershipSettings, Roster};

    #[test]
    fn test_default_limits() {
        let limits = DiscoveryLimits::default();
        assert_eq!(limits.max_depth, 16);
        assert_eq!(limits.max_peers, 1024);
    }

    #[tokio::test]
    async fn test_unreachable_join_point_is_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let node = NodeContext {
            role: Role::Docker,
            address: "127.0.0.1:1".to_string(),
            roster: Arc::new(Roster::new()),
            settings: MembershipSettings::default(),
        };

        let report = discover(&node, &dead).await;
        assert_eq!(report.dialed, vec![dead.clone()]);
        assert_eq!(report.failed, vec![dead]);
        assert!(report.discovered.is_empty());
    }

    #[tokio::test]
    async fn test_join_reply_found_behind_other_frames() {
        use beege_protocol::commands::{CONTROLLER_JOIN_CLUSTER, DOCKER_JOIN};
        use beege_protocol::{encode_command, encode_frame, encode_result, encode_roster, ResultCode};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (conn, mut reader) = Connection::new(stream);
            let request = reader.read_command().await.unwrap().unwrap();
            assert_eq!(request.name, "docker_join_cluster");

            // A broadcast and a garbage frame land ahead of the reply
            let gossip = encode_command(CONTROLLER_JOIN_CLUSTER, b"127.0.0.1:5555").unwrap();
            conn.send_frame(&gossip).await.unwrap();
            conn.send_frame(&encode_frame(b"garbage").unwrap()).await.unwrap();

            let mut roster = PeerTable::new();
            roster.touch("127.0.0.1:5555", 1);
            let reply = encode_result(DOCKER_JOIN, ResultCode::Success, &encode_roster(&roster).unwrap())
                .unwrap();
            conn.send_frame(&reply).await.unwrap();
            conn.close().await.unwrap();
        });

        let node = NodeContext {
            role: Role::Docker,
            address: "127.0.0.1:1".to_string(),
            roster: Arc::new(Roster::new()),
            settings: MembershipSettings::default(),
        };

        let roster = request_roster(&node, &address).await.unwrap();
        assert!(roster.contains("127.0.0.1:5555"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_own_address_is_never_dialed() {
        let node = NodeContext {
            role: Role::Controller,
            address: "127.0.0.1:1".to_string(),
            roster: Arc::new(Roster::new()),
            settings: MembershipSettings::default(),
        };

        let report = discover(&node, "127.0.0.1:1").await;
        assert!(report.dialed.is_empty());
    }
}
