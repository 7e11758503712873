//! Connection hub using the Actor pattern.
//!
//! The switcher is the single owner of the live connection set. Receive
//! loops register and unregister their connections through it, and every
//! broadcast is fanned out by it, so membership of the set and the set of
//! broadcast recipients can never disagree.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │  Receive loops  │────▶│  SwitcherActor  │────▶│ Live connections│
//! │ Handlers/Reports│     │ (mailbox owner) │     │ (send_frame)    │
//! └─────────────────┘     └────────┬────────┘     └─────────────────┘
//!         │                        │
//!         │  SwitcherCommand       │  on unregister of a labelled peer
//!         │  (mpsc, bounded)       ▼
//!         ▼                ┌─────────────────┐
//!    Register/Unregister   │    PeerLost     │──▶ optional gossip frame
//!    Broadcast/queries     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::mpsc;

mod actor;
mod commands;
mod handle;
mod handlers;

pub use actor::SwitcherActor;
pub use commands::{Audience, SwitcherCommand, SwitcherError};
pub use handle::{Broadcaster, SwitcherHandle};
pub use handlers::{Handler, HandlerTable, IgnorePeerLost, PeerLost};

/// Default mailbox capacity.
pub const MAILBOX_CAPACITY: usize = 256;

/// Builds the handler table against a mailbox that already exists.
///
/// Handlers that gossip need a [`Broadcaster`] before the actor is
/// running; the builder hands one out, then freezes the table in
/// [`SwitcherBuilder::spawn`].
pub struct SwitcherBuilder {
    sender: mpsc::Sender<SwitcherCommand>,
    receiver: mpsc::Receiver<SwitcherCommand>,
    handlers: HandlerTable,
}

impl SwitcherBuilder {
    /// Creates the mailbox. A capacity of 0 is raised to 1.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver,
            handlers: HandlerTable::new(),
        }
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster::new(self.sender.clone())
    }

    /// Registers a handler. See [`HandlerTable::register`].
    pub fn register(&mut self, name: &str, handler: impl Handler) -> Result<(), SwitcherError> {
        self.handlers.register(name, handler)
    }

    pub fn handlers_mut(&mut self) -> &mut HandlerTable {
        &mut self.handlers
    }

    /// Freezes the handler table and spawns the actor.
    pub fn spawn(self, peer_lost: Arc<dyn PeerLost>) -> SwitcherHandle {
        let actor = SwitcherActor::new(self.receiver, peer_lost);
        tokio::spawn(actor.run());

        SwitcherHandle::new(Broadcaster::new(self.sender), Arc::new(self.handlers))
    }
}

/// Spawns a switcher over an already built handler table.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use beeged::switcher::{spawn_switcher, HandlerTable, IgnorePeerLost, MAILBOX_CAPACITY};
///
/// #[tokio::main]
/// async fn main() {
///     let switcher = spawn_switcher(HandlerTable::new(), Arc::new(IgnorePeerLost), MAILBOX_CAPACITY);
///     assert_eq!(switcher.connection_count().await, 0);
/// }
/// ```
pub fn spawn_switcher(
    handlers: HandlerTable,
    peer_lost: Arc<dyn PeerLost>,
    capacity: usize,
) -> SwitcherHandle {
    let mut builder = SwitcherBuilder::new(capacity);
    *builder.handlers_mut() = handlers;
    builder.spawn(peer_lost)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};

    use crate::server::{Connection, FrameReader};

    /// Records every peer-lost address.
    #[derive(Default)]
    struct RecordingPeerLost {
        lost: std::sync::Mutex<Vec<String>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl PeerLost for RecordingPeerLost {
        async fn on_peer_lost(&self, address: &str) -> Option<Bytes> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut lost) = self.lost.lock() {
                lost.push(address.to_string());
            }
            None
        }
    }

    /// Returns a client connection plus the raw server socket, which the
    /// caller keeps alive for the duration of the test.
    async fn connection_pair() -> (Arc<Connection>, FrameReader, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (conn, reader) = Connection::new(client);
        (conn, reader, server)
    }

    async fn next_name(reader: &mut FrameReader) -> String {
        tokio::time::timeout(Duration::from_secs(5), reader.read_command())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .name
    }

    fn create_test_handle() -> (SwitcherHandle, Arc<RecordingPeerLost>) {
        let peer_lost = Arc::new(RecordingPeerLost::default());
        let handle = spawn_switcher(HandlerTable::new(), peer_lost.clone(), MAILBOX_CAPACITY);
        (handle, peer_lost)
    }

    #[tokio::test]
    async fn test_register_and_count() {
        let (switcher, _) = create_test_handle();
        let (conn, _reader, _peer) = connection_pair().await;

        switcher.register(conn.clone()).await.unwrap();
        assert_eq!(switcher.connection_count().await, 1);

        switcher.unregister(conn.id()).await.unwrap();
        assert_eq!(switcher.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_without_src_fires_nothing() {
        let (switcher, peer_lost) = create_test_handle();
        let (conn, _reader, _peer) = connection_pair().await;

        switcher.register(conn.clone()).await.unwrap();
        switcher.unregister(conn.id()).await.unwrap();
        // Queries are processed after the unregister
        switcher.connection_count().await;

        assert_eq!(peer_lost.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unregister_with_src_fires_once() {
        let (switcher, peer_lost) = create_test_handle();
        let (conn, _reader, _peer) = connection_pair().await;
        conn.set_src("10.0.0.5:7000");

        switcher.register(conn.clone()).await.unwrap();
        assert!(switcher.is_connected("10.0.0.5:7000").await);

        switcher.unregister(conn.id()).await.unwrap();
        switcher.unregister(conn.id()).await.unwrap();
        switcher.connection_count().await;

        assert_eq!(peer_lost.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *peer_lost.lost.lock().unwrap(),
            vec!["10.0.0.5:7000".to_string()]
        );
        assert!(!switcher.is_connected("10.0.0.5:7000").await);
    }

    #[tokio::test]
    async fn test_try_broadcast_reports_full_mailbox() {
        // Never spawned: nothing drains the mailbox
        let builder = SwitcherBuilder::new(1);
        let broadcaster = builder.broadcaster();

        broadcaster.try_broadcast(Bytes::from_static(b"x")).unwrap();
        assert!(matches!(
            broadcaster.try_broadcast(Bytes::from_static(b"y")),
            Err(SwitcherError::MailboxFull)
        ));
    }

    #[tokio::test]
    async fn test_closed_mailbox() {
        let builder = SwitcherBuilder::new(4);
        let broadcaster = builder.broadcaster();
        drop(builder);

        assert!(matches!(
            broadcaster.broadcast(Bytes::from_static(b"x")).await,
            Err(SwitcherError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (switcher, _) = create_test_handle();
        let (server_conn, _server_reader) = Connection::new(server);
        let (_client_conn, mut client_reader) = Connection::new(client);

        switcher.register(server_conn).await.unwrap();
        switcher
            .broadcast_command("heartbeat", b"10.0.0.1:9001")
            .await
            .unwrap();

        let cmd = tokio::time::timeout(Duration::from_secs(5), client_reader.read_command())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(cmd.name, "heartbeat");
        assert_eq!(&cmd.payload[..], b"10.0.0.1:9001");
    }

    #[tokio::test]
    async fn test_broadcast_to_peers_skips_unlabelled() {
        let (switcher, _) = create_test_handle();

        // Server-side connections registered with the switcher; the
        // returned readers belong to the client ends
        let (_labelled_client, mut labelled_reader, labelled_server) = connection_pair().await;
        let (labelled, _) = Connection::new(labelled_server);
        labelled.set_src("10.0.0.5:7000");
        let (_anonymous_client, mut anonymous_reader, anonymous_server) = connection_pair().await;
        let (anonymous, _) = Connection::new(anonymous_server);

        switcher.register(labelled).await.unwrap();
        switcher.register(anonymous).await.unwrap();

        switcher
            .broadcaster()
            .broadcast_command_to_peers("controller_join_cluster", b"10.0.0.2:9001")
            .await
            .unwrap();
        switcher
            .broadcast_command("heartbeat", b"10.0.0.1:9001")
            .await
            .unwrap();

        assert_eq!(next_name(&mut labelled_reader).await, "controller_join_cluster");
        assert_eq!(next_name(&mut labelled_reader).await, "heartbeat");
        // Only the unscoped broadcast reaches the unlabelled socket
        assert_eq!(next_name(&mut anonymous_reader).await, "heartbeat");
    }

    #[tokio::test]
    async fn test_handler_lookup_through_handle() {
        let mut builder = SwitcherBuilder::new(MAILBOX_CAPACITY);
        builder
            .register("heartbeat", |_conn: Arc<Connection>, _payload: Bytes| async {})
            .unwrap();
        let switcher = builder.spawn(Arc::new(IgnorePeerLost));

        assert!(switcher.handler("heartbeat").is_some());
        assert!(switcher.handler("docker_status").is_none());
        assert_eq!(switcher.handlers().len(), 1);
    }
}
