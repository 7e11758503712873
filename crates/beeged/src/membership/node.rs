//! Node startup for both roles.
//!
//! A controller binds its listener, serves inbound connections and, if it
//! was given a join point, discovers the existing controllers. A docker
//! node discovers the controller set, connects to every controller and then
//! keeps those connections alive while it reports to them.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::info;

use beege_core::Role;

use super::dialer::{connect_and_greet, ReconnectQueue, Reconnector};
use super::discovery::{discover, DiscoveryReport};
use super::handlers::{
    register_controller_handlers, register_docker_handlers, ControllerPeerLost, DockerPeerLost,
};
use super::reporter::{run_event_reporter, run_status_reporter};
use super::{MembershipError, NodeContext};
use crate::engine::DockerEngine;
use crate::monitor::StatusSampler;
use crate::server::Listener;
use crate::switcher::{SwitcherBuilder, SwitcherHandle};

/// A running controller.
#[derive(Debug, Clone)]
pub struct ControllerNode {
    pub node: NodeContext,
    pub switcher: SwitcherHandle,
    pub local_addr: SocketAddr,
    /// Result of the bootstrap discovery, if a join point was given
    pub discovery: Option<DiscoveryReport>,
}

/// A running docker node.
#[derive(Debug, Clone)]
pub struct DockerNode {
    pub node: NodeContext,
    pub switcher: SwitcherHandle,
    pub reconnect: ReconnectQueue,
    pub discovery: DiscoveryReport,
    /// Controllers whose connection was registered during startup
    pub connected: usize,
}

fn expect_role(node: &NodeContext, expected: Role) -> Result<(), MembershipError> {
    if node.role != expected {
        return Err(MembershipError::WrongRole {
            expected,
            actual: node.role,
        });
    }
    Ok(())
}

/// Starts a controller on an already bound listener.
///
/// Returns once the listener is serving and discovery (if any) has
/// finished. Every spawned task stops when `cancel` fires.
pub async fn start_controller(
    node: NodeContext,
    join_address: Option<String>,
    listener: Listener,
    cancel: CancellationToken,
) -> Result<ControllerNode, MembershipError> {
    expect_role(&node, Role::Controller)?;

    node.roster.touch(Role::Controller, &node.address).await;
    if let Some(join) = &join_address {
        if !node.is_self(join) {
            node.roster.touch(Role::Controller, join).await;
        }
    }

    let mut builder = SwitcherBuilder::new(node.settings.mailbox_capacity);
    register_controller_handlers(&mut builder, &node)?;
    let switcher = builder.spawn(Arc::new(ControllerPeerLost::new(Arc::clone(&node.roster))));

    let local_addr = listener.local_addr();
    tokio::spawn(listener.run(switcher.clone(), cancel.clone()));

    info!(
        address = %node.address,
        local_addr = %local_addr,
        join = ?join_address,
        "Controller started"
    );

    let discovery = match &join_address {
        Some(join) => Some(discover(&node, join).await),
        None => None,
    };

    Ok(ControllerNode {
        node,
        switcher,
        local_addr,
        discovery,
    })
}

/// Starts a docker node joining the cluster through `join_address`.
///
/// Returns once every discovered controller has been dialed once. Dial
/// failures are retried in the background by the reconnector.
pub async fn start_docker(
    node: NodeContext,
    join_address: String,
    engine: Arc<dyn DockerEngine>,
    cancel: CancellationToken,
) -> Result<DockerNode, MembershipError> {
    expect_role(&node, Role::Docker)?;
    beege_core::validate_address(&join_address)?;

    node.roster.touch(Role::Docker, &node.address).await;
    node.roster.touch(Role::Controller, &join_address).await;

    let (reconnect, reconnect_rx) = ReconnectQueue::new();

    let mut builder = SwitcherBuilder::new(node.settings.mailbox_capacity);
    register_docker_handlers(&mut builder, &node, Arc::clone(&engine), reconnect.clone())?;
    let switcher = builder.spawn(Arc::new(DockerPeerLost));

    let discovery = discover(&node, &join_address).await;

    let controllers = node.roster.addresses(Role::Controller).await;
    let mut acks = Vec::with_capacity(controllers.len());
    for address in controllers {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(connect_and_greet(
            node.clone(),
            switcher.clone(),
            address,
            tx,
            reconnect.clone(),
            cancel.clone(),
        ));
        acks.push(rx);
    }

    let connected = join_all(acks)
        .await
        .into_iter()
        .filter(|ack| matches!(ack, Ok(true)))
        .count();

    tokio::spawn(
        Reconnector::new(node.clone(), switcher.clone(), reconnect.clone(), reconnect_rx)
            .run(cancel.clone()),
    );
    tokio::spawn(run_status_reporter(
        node.clone(),
        switcher.clone(),
        StatusSampler::new(),
        cancel.clone(),
    ));
    tokio::spawn(run_event_reporter(engine, switcher.clone(), cancel));

    info!(
        address = %node.address,
        join = %join_address,
        controllers = connected,
        "Docker node started"
    );

    Ok(DockerNode {
        node,
        switcher,
        reconnect,
        discovery,
        connected,
    })
}
