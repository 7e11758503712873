//! Docker-side reporting to controllers.
//!
//! - Inventory: image and container lists, sent on one connection right
//!   after its greeting is accepted
//! - Status: host metrics plus a heartbeat, broadcast on a fixed tick
//! - Events: every engine event, broadcast as it arrives
//!
//! Engine, sampling and encoding failures are logged and skipped. They
//! never end a connection or a reporter.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beege_protocol::commands::{DOCKER_CONTAINERS, DOCKER_EVENT, DOCKER_IMAGES, DOCKER_STATUS, HEARTBEAT};

use super::NodeContext;
use crate::engine::DockerEngine;
use crate::monitor::StatusSampler;
use crate::server::Connection;
use crate::switcher::SwitcherHandle;

/// Buffered engine events between the engine stream and the broadcaster.
const EVENT_BUFFER: usize = 64;

/// Sends `docker_images` and `docker_containers` on `conn`.
pub async fn report_inventory(conn: &Connection, engine: &dyn DockerEngine) {
    debug!(src = ?conn.src(), "Reporting inventory");

    match engine.images().await {
        Ok(images) => {
            if let Err(e) = conn.send_command(DOCKER_IMAGES, &images).await {
                warn!(src = ?conn.src(), error = %e, "Failed to send image list");
            }
        }
        Err(e) => warn!(error = %e, "Failed to list images"),
    }

    match engine.containers().await {
        Ok(containers) => {
            if let Err(e) = conn.send_command(DOCKER_CONTAINERS, &containers).await {
                warn!(src = ?conn.src(), error = %e, "Failed to send container list");
            }
        }
        Err(e) => warn!(error = %e, "Failed to list containers"),
    }
}

/// Broadcasts `docker_status` and `heartbeat` every status interval until
/// cancelled.
pub async fn run_status_reporter(
    node: NodeContext,
    switcher: SwitcherHandle,
    mut sampler: StatusSampler,
    cancel: CancellationToken,
) {
    let mut tick = interval(node.settings.status_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately
    tick.tick().await;

    info!(
        interval_secs = node.settings.status_interval.as_secs(),
        "Status reporter started"
    );

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Status reporter shutting down");
                break;
            }

            _ = tick.tick() => {
                let status = sampler.sample();
                match status.to_payload() {
                    Ok(payload) => {
                        if let Err(e) = switcher.broadcast_command(DOCKER_STATUS, &payload).await {
                            warn!(error = %e, "Failed to broadcast status");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode status"),
                }

                if let Err(e) = switcher
                    .broadcast_command(HEARTBEAT, node.address.as_bytes())
                    .await
                {
                    warn!(error = %e, "Failed to broadcast heartbeat");
                }
            }
        }
    }
}

/// Broadcasts every engine event as `docker_event` until the engine stream
/// ends or the token is cancelled.
pub async fn run_event_reporter(
    engine: Arc<dyn DockerEngine>,
    switcher: SwitcherHandle,
    cancel: CancellationToken,
) {
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);

    let stream = tokio::spawn(async move {
        if let Err(e) = engine.events(tx).await {
            warn!(error = %e, "Docker event stream failed");
        }
    });

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                info!("Event reporter shutting down");
                break;
            }

            event = rx.recv() => {
                let Some(event) = event else {
                    info!("Event reporter finished");
                    break;
                };
                if let Err(e) = switcher.broadcast_command(DOCKER_EVENT, &event).await {
                    warn!(error = %e, "Failed to broadcast docker event");
                }
            }
        }
    }

    stream.abort();
}
