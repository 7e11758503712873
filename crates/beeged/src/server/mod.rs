//! TCP listener and per-connection receive loops.
//!
//! The server:
//! - Accepts inbound cluster connections until cancelled
//! - Wraps each socket in a [`Connection`] and registers it with the switcher
//! - Runs one receive loop per connection, dispatching frames to handlers
//! - Unregisters the connection exactly once when its loop ends
//!
//! Dialed connections (docker → controller) reuse the same loop with
//! [`Origin::Outbound`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │    Listener     │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  register/unregister  ┌─────────────────┐
//! │ConnectionHandler│──────────────────────▶│ SwitcherHandle  │
//! │ (per connection)│                       └─────────────────┘
//! └───────┬─────────┘
//!         │ handler(name).call(conn, payload)
//!         ▼
//! ┌─────────────────┐
//! │ Membership      │
//! │ handlers        │
//! └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and end only the affected loop

mod connection;

pub use connection::{Connection, ConnectionError, ConnectionId, FrameReader, WRITE_TIMEOUT};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use beege_protocol::commands::UNKNOWN_COMMAND_MESSAGE;
use beege_protocol::{Command, ResultCode};

use crate::switcher::SwitcherHandle;

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Accepted by the listener. Unknown commands get a FAILURE reply.
    Inbound,

    /// Dialed by this node. Unknown commands are only logged, so two peers
    /// can never bounce FAILURE replies back and forth.
    Outbound,
}

/// Accepts inbound cluster connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds the cluster address.
    ///
    /// # Errors
    ///
    /// `ServerError::Bind` if the address cannot be bound. This is the one
    /// fatal error at startup.
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServerError::Bind {
                address: address.to_string(),
                error: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            address: address.to_string(),
            error: e.to_string(),
        })?;

        info!(address = %local_addr, "Cluster listener bound");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until the cancellation token fires.
    pub async fn run(self, switcher: SwitcherHandle, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Listener shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "Accepted cluster connection");
                            tokio::spawn(serve_inbound(stream, switcher.clone(), cancel.clone()));
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            // Continue accepting other connections
                        }
                    }
                }
            }
        }
    }
}

/// Registers an accepted socket and runs its receive loop.
pub async fn serve_inbound(stream: TcpStream, switcher: SwitcherHandle, cancel: CancellationToken) {
    let (conn, reader) = Connection::new(stream);

    if let Err(e) = switcher.register(Arc::clone(&conn)).await {
        warn!(connection = conn.id(), error = %e, "Failed to register connection");
        let _ = conn.close().await;
        return;
    }

    ConnectionHandler::new(conn, reader, switcher, Origin::Inbound)
        .run(cancel)
        .await;
}

// ============================================================================
// Connection Handler
// ============================================================================

/// Receive loop for one registered connection.
pub struct ConnectionHandler {
    conn: Arc<Connection>,
    reader: FrameReader,
    switcher: SwitcherHandle,
    origin: Origin,
}

impl ConnectionHandler {
    pub fn new(
        conn: Arc<Connection>,
        reader: FrameReader,
        switcher: SwitcherHandle,
        origin: Origin,
    ) -> Self {
        Self {
            conn,
            reader,
            switcher,
            origin,
        }
    }

    /// Reads and dispatches frames until the peer goes away, a transport
    /// error occurs, the connection is closed (by a handler or a failed
    /// write from any task), or `cancel` fires. Then unregisters the
    /// connection.
    pub async fn run(mut self, cancel: CancellationToken) {
        let id = self.conn.id();
        let conn = Arc::clone(&self.conn);

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(connection = id, "Receive loop cancelled");
                    break;
                }
                _ = conn.closed() => {
                    debug!(connection = id, src = ?conn.src(), "Connection closed");
                    break;
                }
                next = self.reader.read_command() => next,
            };

            match next {
                Ok(Some(cmd)) => {
                    self.dispatch(cmd).await;
                    if self.conn.is_closed() {
                        debug!(connection = id, "Connection closed by handler");
                        break;
                    }
                }
                Ok(None) => {
                    debug!(connection = id, src = ?self.conn.src(), "Peer sent EOF");
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    warn!(connection = id, error = %e, "Skipping malformed frame");
                }
                Err(e) => {
                    debug!(connection = id, error = %e, "Connection read failed");
                    break;
                }
            }
        }

        if let Err(e) = self.switcher.unregister(id).await {
            debug!(connection = id, error = %e, "Unregister failed");
        }
        if let Err(e) = self.conn.close().await {
            debug!(connection = id, error = %e, "Close failed");
        }

        info!(connection = id, src = ?self.conn.src(), "Connection ended");
    }

    async fn dispatch(&self, cmd: Command) {
        debug!(
            connection = self.conn.id(),
            command = %cmd.name,
            payload_len = cmd.payload.len(),
            "Received command"
        );

        if let Some(handler) = self.switcher.handler(&cmd.name) {
            handler.call(Arc::clone(&self.conn), cmd.payload).await;
            return;
        }

        match self.origin {
            Origin::Inbound => {
                debug!(command = %cmd.name, "Unknown command, replying FAILURE");
                if let Err(e) = self
                    .conn
                    .send_result(&cmd.name, ResultCode::Failure, UNKNOWN_COMMAND_MESSAGE.as_bytes())
                    .await
                {
                    warn!(command = %cmd.name, error = %e, "Failed to send FAILURE reply");
                }
            }
            Origin::Outbound => {
                warn!(command = %cmd.name, src = ?self.conn.src(), "Command does not exist");
            }
        }
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {error}")]
    Bind { address: String, error: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::Bind {
            address: "10.0.0.1:9001".to_string(),
            error: "address in use".to_string(),
        };
        assert!(err.to_string().contains("10.0.0.1:9001"));
        assert!(err.to_string().contains("address in use"));
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(listener.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn test_failed_broadcast_write_ends_receive_loop() {
        use std::time::Duration;
        use tokio::time::timeout;

        use crate::switcher::{spawn_switcher, HandlerTable, IgnorePeerLost, MAILBOX_CAPACITY};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        // Never reads and never writes, so the receive loop stays blocked
        // in its read while broadcasts fill the socket
        let _stalled = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();

        let (conn, reader) = Connection::with_write_timeout(server, Duration::from_millis(100));
        let switcher = spawn_switcher(HandlerTable::new(), Arc::new(IgnorePeerLost), MAILBOX_CAPACITY);
        switcher.register(Arc::clone(&conn)).await.unwrap();

        let cancel = CancellationToken::new();
        let handler = tokio::spawn(
            ConnectionHandler::new(Arc::clone(&conn), reader, switcher.clone(), Origin::Inbound)
                .run(cancel.clone()),
        );

        let frame = beege_protocol::encode_frame(&[b'x'; 60_000]).unwrap();
        timeout(Duration::from_secs(10), async {
            while switcher.connection_count().await > 0 {
                switcher.broadcast(frame.clone()).await.unwrap();
            }
        })
        .await
        .expect("connection was never unregistered");

        assert!(conn.is_closed());
        timeout(Duration::from_secs(5), handler).await.unwrap().unwrap();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let first = Listener::bind("127.0.0.1:0").await.unwrap();
        let taken = first.local_addr().to_string();
        assert!(matches!(
            Listener::bind(&taken).await,
            Err(ServerError::Bind { .. })
        ));
    }
}
