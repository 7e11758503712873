//! Per-role command handlers and peer-lost callbacks.
//!
//! Controller handlers accept greetings and joins and relay reports.
//! Docker handlers complete the greeting and react to new controllers.
//! Every address-carrying payload is validated before it reaches the
//! roster.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use beege_core::{validate_address, Role};
use beege_protocol::commands::{
    CONTROLLER_JOIN, CONTROLLER_JOIN_CLUSTER, CONTROLLER_JOIN_TO_DOCKER, CONTROLLER_OFFLINE,
    DOCKER_CONTAINERS, DOCKER_EVENT, DOCKER_GREETINGS, DOCKER_GREETINGS_REPLY, DOCKER_IMAGES,
    DOCKER_JOIN, DOCKER_JOIN_CLUSTER, DOCKER_STATUS, HEARTBEAT,
};
use beege_protocol::{encode_command, encode_roster, split_result, HostStatus, ResultCode};

use super::dialer::ReconnectQueue;
use super::reporter::report_inventory;
use super::{NodeContext, Roster};
use crate::engine::DockerEngine;
use crate::server::Connection;
use crate::switcher::{Broadcaster, Handler, PeerLost, SwitcherBuilder, SwitcherError};

/// Binds a handler method to shared state.
fn route<S, F, Fut>(state: &Arc<S>, f: F) -> impl Handler
where
    S: Send + Sync + 'static,
    F: Fn(Arc<S>, Arc<Connection>, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let state = Arc::clone(state);
    move |conn: Arc<Connection>, payload: Bytes| f(Arc::clone(&state), conn, payload)
}

/// Parses an address payload.
fn peer_address(payload: &[u8]) -> Option<&str> {
    let text = std::str::from_utf8(payload).ok()?.trim();
    validate_address(text).ok()
}

/// `heartbeat`: refreshes the sender in whichever table holds it. No reply.
async fn heartbeat(roster: Arc<Roster>, _conn: Arc<Connection>, payload: Bytes) {
    let Some(address) = peer_address(&payload) else {
        warn!(payload_len = payload.len(), "Ignoring heartbeat with invalid address");
        return;
    };

    match roster.refresh(address).await {
        Some(role) => debug!(address = %address, role = %role, "Heartbeat"),
        None => debug!(address = %address, "Heartbeat from unknown peer"),
    }
}

// ============================================================================
// Controller
// ============================================================================

struct ControllerHandlers {
    node: NodeContext,
    broadcaster: Broadcaster,
}

/// Registers the controller handler set.
pub fn register_controller_handlers(
    builder: &mut SwitcherBuilder,
    node: &NodeContext,
) -> Result<(), SwitcherError> {
    let state = Arc::new(ControllerHandlers {
        node: node.clone(),
        broadcaster: builder.broadcaster(),
    });

    builder.register(HEARTBEAT, route(&node.roster, heartbeat))?;
    builder.register(DOCKER_GREETINGS, route(&state, ControllerHandlers::docker_greetings))?;
    builder.register(DOCKER_JOIN_CLUSTER, route(&state, ControllerHandlers::docker_join))?;
    builder.register(
        CONTROLLER_JOIN_CLUSTER,
        route(&state, ControllerHandlers::controller_join),
    )?;
    builder.register(
        CONTROLLER_OFFLINE,
        route(&state, ControllerHandlers::controller_offline),
    )?;
    builder.register(DOCKER_STATUS, route(&state, ControllerHandlers::docker_status))?;
    for report in [DOCKER_EVENT, DOCKER_IMAGES, DOCKER_CONTAINERS] {
        builder.register(
            report,
            route(&state, move |state, conn, payload| {
                state.docker_report(report, conn, payload)
            }),
        )?;
    }
    Ok(())
}

impl ControllerHandlers {
    /// `docker_greetings`: labels the connection, records the docker and
    /// replies with an empty SUCCESS result.
    ///
    /// A connection keeps the first address it greets with. A later
    /// greeting carrying a different address is refused and leaves the
    /// roster untouched, since only the label is removed on disconnect.
    async fn docker_greetings(self: Arc<Self>, conn: Arc<Connection>, payload: Bytes) {
        let Some(address) = peer_address(&payload) else {
            warn!(connection = conn.id(), "Greeting with invalid address");
            reply(&conn, DOCKER_GREETINGS_REPLY, ResultCode::Failure, b"invalid address").await;
            return;
        };

        if !conn.set_src(address) && conn.src() != Some(address) {
            warn!(
                connection = conn.id(),
                src = ?conn.src(),
                address = %address,
                "Greeting conflicts with connection label"
            );
            reply(&conn, DOCKER_GREETINGS_REPLY, ResultCode::Failure, b"address mismatch").await;
            return;
        }

        let new = self.node.roster.touch(Role::Docker, address).await;
        info!(address = %address, new, "Docker online");

        reply(&conn, DOCKER_GREETINGS_REPLY, ResultCode::Success, b"").await;
    }

    /// `docker_join_cluster`: records the docker and replies with the
    /// controller roster.
    async fn docker_join(self: Arc<Self>, conn: Arc<Connection>, payload: Bytes) {
        let Some(address) = peer_address(&payload) else {
            warn!(connection = conn.id(), "Docker join with invalid address");
            reply(&conn, DOCKER_JOIN, ResultCode::Failure, b"").await;
            return;
        };

        self.node.roster.touch(Role::Docker, address).await;
        info!(address = %address, "Docker joined");

        self.reply_with_controllers(&conn, DOCKER_JOIN).await;
    }

    /// `controller_join_cluster`: records the controller, replies with the
    /// controller roster, closes the connection, then tells every attached
    /// docker about the newcomer.
    ///
    /// The announcement only reaches labelled connections, i.e. greeted
    /// docker leaves. Join sockets never carry a label, so neither this
    /// joiner nor any other join in flight reads it in place of a reply.
    async fn controller_join(self: Arc<Self>, conn: Arc<Connection>, payload: Bytes) {
        let Some(address) = peer_address(&payload) else {
            warn!(connection = conn.id(), "Controller join with invalid address");
            reply(&conn, CONTROLLER_JOIN, ResultCode::Failure, b"").await;
            return;
        };

        if self.node.is_self(address) {
            debug!("Join request carrying own address");
            self.reply_with_controllers(&conn, CONTROLLER_JOIN).await;
            return;
        }

        self.node.roster.touch(Role::Controller, address).await;
        self.reply_with_controllers(&conn, CONTROLLER_JOIN).await;

        if let Err(e) = conn.close().await {
            debug!(address = %address, error = %e, "Close after controller join failed");
        }

        info!(address = %address, "Controller joined, notifying dockers");
        if let Err(e) = self
            .broadcaster
            .broadcast_command_to_peers(CONTROLLER_JOIN_CLUSTER, address.as_bytes())
            .await
        {
            warn!(address = %address, error = %e, "Failed to broadcast controller join");
        }
    }

    /// `controller_offline`: forgets a controller a docker lost. The own
    /// address is never removed.
    async fn controller_offline(self: Arc<Self>, _conn: Arc<Connection>, payload: Bytes) {
        let Some(address) = peer_address(&payload) else {
            warn!("controller_offline with invalid address");
            return;
        };

        if self.node.is_self(address) {
            debug!("Ignoring controller_offline for own address");
            return;
        }

        if self.node.roster.remove(Role::Controller, address).await.is_some() {
            info!(address = %address, "Controller offline");
        }
    }

    async fn docker_status(self: Arc<Self>, conn: Arc<Connection>, payload: Bytes) {
        self.refresh_sender(&conn).await;

        match HostStatus::from_payload(&payload) {
            Ok(status) => info!(
                src = ?conn.src(),
                cpu_percent = format!("{:.1}", status.cpu_percent),
                memory_used = status.memory_used,
                memory_total = status.memory_total,
                load_one = status.load_one,
                "Docker status"
            ),
            Err(e) => warn!(src = ?conn.src(), error = %e, "Undecodable docker status"),
        }
    }

    /// `docker_event`, `docker_images`, `docker_containers`.
    async fn docker_report(
        self: Arc<Self>,
        report: &'static str,
        conn: Arc<Connection>,
        payload: Bytes,
    ) {
        self.refresh_sender(&conn).await;
        info!(src = ?conn.src(), report, bytes = payload.len(), "Docker report");
        debug!(
            src = ?conn.src(),
            report,
            body = %String::from_utf8_lossy(&payload),
            "Docker report body"
        );
    }

    async fn refresh_sender(&self, conn: &Connection) {
        if let Some(src) = conn.src() {
            self.node.roster.refresh(src).await;
        }
    }

    async fn reply_with_controllers(&self, conn: &Connection, name: &str) {
        let controllers = self.node.roster.snapshot(Role::Controller).await;
        match encode_roster(&controllers) {
            Ok(payload) => reply(conn, name, ResultCode::Success, &payload).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode controller roster");
                reply(conn, name, ResultCode::Failure, b"").await;
            }
        }
    }
}

/// Removes a lost docker from the roster.
pub struct ControllerPeerLost {
    roster: Arc<Roster>,
}

impl ControllerPeerLost {
    pub fn new(roster: Arc<Roster>) -> Self {
        Self { roster }
    }
}

#[async_trait]
impl PeerLost for ControllerPeerLost {
    async fn on_peer_lost(&self, address: &str) -> Option<Bytes> {
        if self.roster.remove(Role::Docker, address).await.is_some() {
            info!(address = %address, "Docker offline");
        }
        None
    }
}

// ============================================================================
// Docker
// ============================================================================

struct DockerHandlers {
    node: NodeContext,
    engine: Arc<dyn DockerEngine>,
    reconnect: ReconnectQueue,
}

/// Registers the docker handler set.
pub fn register_docker_handlers(
    builder: &mut SwitcherBuilder,
    node: &NodeContext,
    engine: Arc<dyn DockerEngine>,
    reconnect: ReconnectQueue,
) -> Result<(), SwitcherError> {
    let state = Arc::new(DockerHandlers {
        node: node.clone(),
        engine,
        reconnect,
    });

    builder.register(HEARTBEAT, route(&node.roster, heartbeat))?;
    builder.register(
        DOCKER_GREETINGS_REPLY,
        route(&state, DockerHandlers::greetings_reply),
    )?;
    builder.register(
        CONTROLLER_JOIN_CLUSTER,
        route(&state, DockerHandlers::new_controller),
    )?;
    builder.register(
        CONTROLLER_JOIN_TO_DOCKER,
        route(&state, DockerHandlers::new_controller),
    )?;
    Ok(())
}

impl DockerHandlers {
    /// `docker_greetings_reply`: on SUCCESS refreshes the controller and
    /// sends the inventory report on this connection.
    async fn greetings_reply(self: Arc<Self>, conn: Arc<Connection>, payload: Bytes) {
        let code = match split_result(&payload) {
            Ok((code, _)) => code,
            Err(e) => {
                warn!(src = ?conn.src(), error = %e, "Malformed greeting reply");
                return;
            }
        };

        if !code.is_success() {
            warn!(src = ?conn.src(), "Greeting rejected by controller");
            return;
        }

        if let Some(controller) = conn.src() {
            self.node.roster.touch(Role::Controller, controller).await;
            info!(address = %controller, "Greeting accepted");
        }

        report_inventory(&conn, self.engine.as_ref()).await;
    }

    /// `controller_join_cluster` / `controller_join_to_docker`: records the
    /// new controller and queues a connection to it.
    async fn new_controller(self: Arc<Self>, _conn: Arc<Connection>, payload: Bytes) {
        let Some(address) = peer_address(&payload) else {
            warn!("New controller notice with invalid address");
            return;
        };

        if self.node.is_self(address) {
            return;
        }

        self.node.roster.touch(Role::Controller, address).await;
        info!(address = %address, "New controller announced");
        self.reconnect.post(address);
    }
}

/// Keeps the lost controller's record so reconnection proceeds, and gossips
/// `"<address> controller_offline"` to the remaining controllers.
#[derive(Debug, Default, Clone, Copy)]
pub struct DockerPeerLost;

#[async_trait]
impl PeerLost for DockerPeerLost {
    async fn on_peer_lost(&self, address: &str) -> Option<Bytes> {
        info!(address = %address, "Controller connection lost");
        match encode_command(CONTROLLER_OFFLINE, address.as_bytes()) {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!(address = %address, error = %e, "Failed to encode controller_offline");
                None
            }
        }
    }
}

async fn reply(conn: &Connection, name: &str, code: ResultCode, payload: &[u8]) {
    if let Err(e) = conn.send_result(name, code, payload).await {
        warn!(connection = conn.id(), reply = %name, error = %e, "Failed to send reply");
    }
}
