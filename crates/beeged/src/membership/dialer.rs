//! Outbound controller connections and the reconnect loop.
//!
//! A docker node keeps one connection to every known controller. Each
//! connection is dialed by [`connect_and_greet`], which registers it with
//! the switcher, greets the controller and then runs the receive loop.
//! When the loop ends (or the dial fails) the controller's address is
//! posted to the [`ReconnectQueue`]; the [`Reconnector`] drains the queue,
//! waits out the backoff and dials again.
//!
//! ```text
//!  new controller notice ─┐
//!  connection lost ───────┼─▶ ReconnectQueue ─▶ Reconnector
//!  dial failed ───────────┘                        │ backoff
//!                                                  ▼
//!                                          connect_and_greet
//! ```
//!
//! Addresses that are no longer controller members, or already have a live
//! connection, are dropped by the reconnector. With a `max_attempts` limit
//! the controller is evicted after that many consecutive failed dials.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use beege_core::Role;
use beege_protocol::commands::DOCKER_GREETINGS;

use super::NodeContext;
use crate::server::{Connection, ConnectionHandler, Origin};
use crate::switcher::SwitcherHandle;

/// Backoff and retry bounds for controller reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Ticks waited before each dial
    pub backoff_ticks: u32,

    /// Length of one backoff tick
    pub tick: Duration,

    /// Consecutive failed dials before the controller is evicted.
    /// `None` retries for as long as the controller stays a member.
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> Duration {
        self.tick.saturating_mul(self.backoff_ticks)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff_ticks: 3,
            tick: Duration::from_secs(1),
            max_attempts: None,
        }
    }
}

/// Producer side of the reconnect queue.
#[derive(Debug, Clone)]
pub struct ReconnectQueue {
    sender: mpsc::UnboundedSender<String>,
}

impl ReconnectQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Asks the reconnector to (re)connect to `address`.
    pub fn post(&self, address: &str) {
        if self.sender.send(address.to_string()).is_err() {
            debug!(address = %address, "Reconnect queue closed, dropping request");
        }
    }
}

/// Dials `address`, registers and greets, then serves the connection until
/// it ends.
///
/// `registered` receives `true` once the connection is in the switcher's
/// live set, or `false` if the dial failed. On a failed dial and on
/// connection loss the address is posted to `reconnect`, unless `cancel`
/// has fired.
pub async fn connect_and_greet(
    node: NodeContext,
    switcher: SwitcherHandle,
    address: String,
    registered: oneshot::Sender<bool>,
    reconnect: ReconnectQueue,
    cancel: CancellationToken,
) {
    let (conn, reader) = match Connection::connect(&address, node.settings.dial_timeout).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(address = %address, error = %e, "Failed to connect to controller");
            let _ = registered.send(false);
            if !cancel.is_cancelled() {
                reconnect.post(&address);
            }
            return;
        }
    };

    conn.set_src(&address);

    if let Err(e) = switcher.register(Arc::clone(&conn)).await {
        warn!(address = %address, error = %e, "Failed to register controller connection");
        let _ = registered.send(false);
        let _ = conn.close().await;
        return;
    }
    let _ = registered.send(true);

    info!(address = %address, connection = conn.id(), "Connected to controller");

    if let Err(e) = conn
        .send_command(DOCKER_GREETINGS, node.address.as_bytes())
        .await
    {
        warn!(address = %address, error = %e, "Failed to send greeting");
    }

    ConnectionHandler::new(conn, reader, switcher, Origin::Outbound)
        .run(cancel.clone())
        .await;

    if !cancel.is_cancelled() {
        reconnect.post(&address);
    }
}

/// Drains the reconnect queue, one address at a time.
pub struct Reconnector {
    node: NodeContext,
    switcher: SwitcherHandle,
    queue: ReconnectQueue,
    receiver: mpsc::UnboundedReceiver<String>,
    /// Consecutive failed dials per address
    attempts: HashMap<String, u32>,
}

impl Reconnector {
    pub fn new(
        node: NodeContext,
        switcher: SwitcherHandle,
        queue: ReconnectQueue,
        receiver: mpsc::UnboundedReceiver<String>,
    ) -> Self {
        Self {
            node,
            switcher,
            queue,
            receiver,
            attempts: HashMap::new(),
        }
    }

    /// Runs until the queue closes or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            backoff_ms = self.node.settings.reconnect.backoff().as_millis() as u64,
            "Reconnector started"
        );

        loop {
            let address = tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("Reconnector shutting down");
                    break;
                }

                next = self.receiver.recv() => match next {
                    Some(address) => address,
                    None => break,
                },
            };

            if !self.should_dial(&address).await {
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Reconnector shutting down");
                    break;
                }
                _ = sleep(self.node.settings.reconnect.backoff()) => {}
            }

            // The controller may have gone or been reached while we waited
            if !self.should_dial(&address).await {
                continue;
            }

            self.dial(address, &cancel).await;
        }
    }

    async fn should_dial(&mut self, address: &str) -> bool {
        if !self.node.roster.contains(Role::Controller, address).await {
            debug!(address = %address, "Not a controller member, skipping reconnect");
            self.attempts.remove(address);
            return false;
        }
        if self.switcher.is_connected(address).await {
            debug!(address = %address, "Already connected, skipping reconnect");
            return false;
        }
        true
    }

    async fn dial(&mut self, address: String, cancel: &CancellationToken) {
        debug!(address = %address, "Reconnecting to controller");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(connect_and_greet(
            self.node.clone(),
            self.switcher.clone(),
            address.clone(),
            tx,
            self.queue.clone(),
            cancel.clone(),
        ));

        if rx.await.unwrap_or(false) {
            self.attempts.remove(&address);
            return;
        }

        let failed = self.attempts.entry(address.clone()).or_insert(0);
        *failed += 1;

        if let Some(max) = self.node.settings.reconnect.max_attempts {
            if *failed >= max {
                warn!(address = %address, attempts = *failed, "Giving up on controller");
                self.attempts.remove(&address);
                self.node.roster.remove(Role::Controller, &address).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::membership::MembershipSettings;
    use crate::switcher::{spawn_switcher, HandlerTable, IgnorePeerLost};

    fn fast_node() -> NodeContext {
        let mut settings = MembershipSettings::default();
        settings.dial_timeout = Duration::from_millis(500);
        settings.reconnect.tick = Duration::from_millis(1);
        NodeContext::new(Role::Docker, "127.0.0.1:1", settings).unwrap()
    }

    async fn dead_address() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        address
    }

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(), Duration::from_secs(3));
        assert_eq!(policy.max_attempts, None);
    }

    #[tokio::test]
    async fn test_queue_delivers_in_order() {
        let (queue, mut rx) = ReconnectQueue::new();
        queue.post("10.0.0.1:9001");
        queue.clone().post("10.0.0.2:9001");

        assert_eq!(rx.recv().await.as_deref(), Some("10.0.0.1:9001"));
        assert_eq!(rx.recv().await.as_deref(), Some("10.0.0.2:9001"));
    }

    #[tokio::test]
    async fn test_failed_dial_acks_false_and_requeues() {
        let node = fast_node();
        let switcher = spawn_switcher(HandlerTable::new(), Arc::new(IgnorePeerLost), 16);
        let (queue, mut rx) = ReconnectQueue::new();
        let address = dead_address().await;

        let (tx, ack) = oneshot::channel();
        connect_and_greet(node, switcher, address.clone(), tx, queue, CancellationToken::new()).await;

        assert!(!ack.await.unwrap());
        assert_eq!(rx.recv().await, Some(address));
    }

    #[tokio::test]
    async fn test_reconnector_evicts_after_max_attempts() {
        let mut node = fast_node();
        node.settings.reconnect.max_attempts = Some(2);
        let address = dead_address().await;
        node.roster.touch(Role::Controller, &address).await;

        let switcher = spawn_switcher(HandlerTable::new(), Arc::new(IgnorePeerLost), 16);
        let (queue, rx) = ReconnectQueue::new();
        let cancel = CancellationToken::new();
        tokio::spawn(
            Reconnector::new(node.clone(), switcher, queue.clone(), rx).run(cancel.clone()),
        );

        queue.post(&address);

        let roster = Arc::clone(&node.roster);
        let evicted = tokio::time::timeout(Duration::from_secs(5), async move {
            while roster.contains(Role::Controller, &address).await {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        assert!(evicted.is_ok());
        cancel.cancel();
    }
}
