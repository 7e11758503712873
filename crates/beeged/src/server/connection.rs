//! A single peer connection.
//!
//! A `Connection` owns the write half of one TCP socket and is shared as
//! `Arc<Connection>` between the Switcher (which fans broadcasts out to it)
//! and the connection's own receive loop (which replies to requests). The
//! read half lives in a separate [`FrameReader`] owned by the receive loop,
//! so reads never contend with writes.
//!
//! Every send assembles one complete frame and writes it with a single
//! `write_all` under the write lock. Concurrent senders therefore never
//! interleave bytes of different frames.
//!
//! A write that fails or times out may have left part of a frame on the
//! socket, after which the peer can no longer find frame boundaries. The
//! connection is closed on the spot: later sends return
//! [`ConnectionError::Closed`] and [`Connection::closed`] resolves, which
//! ends the receive loop even while it is blocked in a read.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Write failures and timeouts close the connection and are returned,
//!   never retried here

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use beege_protocol::{
    decode_command, decode_result, encode_command, encode_result, Command, CommandResult,
    FrameCodec, ProtocolError, ResultCode,
};

/// Write timeout (10 seconds). Covers both lock acquisition and the write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Process-unique connection identifier.
pub type ConnectionId = u64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One peer connection (write side).
pub struct Connection {
    id: ConnectionId,

    /// Remote socket address as seen by this node
    peer_addr: Option<SocketAddr>,

    /// Advertised cluster address of the peer, once known
    src: OnceLock<String>,

    writer: Mutex<OwnedWriteHalf>,

    /// Bounds lock acquisition plus the write of one frame
    write_timeout: Duration,

    closed: AtomicBool,

    /// Fired once, when the connection is closed for any reason
    shutdown: CancellationToken,
}

impl Connection {
    /// Wraps a connected socket, splitting it into the shared write side and
    /// the reader owned by the receive loop.
    pub fn new(stream: TcpStream) -> (Arc<Self>, FrameReader) {
        Self::with_write_timeout(stream, WRITE_TIMEOUT)
    }

    /// Like [`Connection::new`], with a custom write timeout.
    pub fn with_write_timeout(
        stream: TcpStream,
        write_timeout: Duration,
    ) -> (Arc<Self>, FrameReader) {
        let peer_addr = stream.peer_addr().ok();
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            src: OnceLock::new(),
            writer: Mutex::new(writer),
            write_timeout,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        (conn, FrameReader::new(reader))
    }

    /// Dials `address`, giving up after `dial_timeout`.
    pub async fn connect(
        address: &str,
        dial_timeout: Duration,
    ) -> Result<(Arc<Self>, FrameReader), ConnectionError> {
        match timeout(dial_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => Ok(Self::new(stream)),
            Ok(Err(e)) => Err(ConnectionError::Io(e)),
            Err(_) => Err(ConnectionError::ConnectTimeout {
                address: address.to_string(),
            }),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// The peer's advertised cluster address, if it has been learned.
    pub fn src(&self) -> Option<&str> {
        self.src.get().map(String::as_str)
    }

    /// Records the peer's advertised address.
    ///
    /// The first call wins; returns `false` if a label was already set.
    pub fn set_src(&self, address: &str) -> bool {
        self.src.set(address.to_string()).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been closed, by [`Connection::close`]
    /// or by a failed write.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Sends `"<payload> <name>"`.
    pub async fn send_command(&self, name: &str, payload: &[u8]) -> Result<(), ConnectionError> {
        let frame = encode_command(name, payload)?;
        self.send_frame(&frame).await
    }

    /// Sends `"<payload> <code> <name>"`.
    pub async fn send_result(
        &self,
        name: &str,
        code: ResultCode,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        let frame = encode_result(name, code, payload)?;
        self.send_frame(&frame).await
    }

    /// Writes one already-encoded frame.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Closed` if the connection was already closed
    /// - `ConnectionError::Io` / `ConnectionError::WriteTimeout` if the
    ///   write failed; the connection is closed before returning
    pub async fn send_frame(&self, frame: &[u8]) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }

        let write = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(frame).await?;
            writer.flush().await
        };

        let error = match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => ConnectionError::Io(e),
            Err(_) => ConnectionError::WriteTimeout,
        };

        self.abort(&error).await;
        Err(error)
    }

    /// Closes the connection after a failed write, without flushing.
    async fn abort(&self, error: &ConnectionError) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!(
            connection = self.id,
            src = ?self.src(),
            error = %error,
            "Write failed, closing connection"
        );
        self.shutdown.cancel();

        // Another sender may still hold the lock until its own timeout; the
        // socket is shut down when the last handle drops in that case.
        if let Ok(mut writer) = self.writer.try_lock() {
            if let Err(e) = writer.shutdown().await {
                debug!(connection = self.id, error = %e, "Shutdown after write failure failed");
            }
        }
    }

    /// Marks the connection closed, then flushes and shuts down the write
    /// half.
    ///
    /// Once this returns, every frame sent before it has been handed to the
    /// kernel and the peer will observe EOF after reading them. Closing an
    /// already closed connection is a no-op.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.cancel();

        let shutdown = async {
            let mut writer = self.writer.lock().await;
            writer.flush().await?;
            writer.shutdown().await
        };

        match timeout(self.write_timeout, shutdown).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ConnectionError::Io(e)),
            Err(_) => Err(ConnectionError::WriteTimeout),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("src", &self.src())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ============================================================================
// Frame Reader
// ============================================================================

/// Read side of a connection.
pub struct FrameReader {
    inner: FramedRead<OwnedReadHalf, FrameCodec>,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            inner: FramedRead::new(reader, FrameCodec),
        }
    }

    /// Reads the next raw frame body. Returns `None` on a clean EOF.
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, ConnectionError> {
        match self.inner.next().await {
            Some(Ok(body)) => Ok(Some(body)),
            Some(Err(ProtocolError::Io(e))) => Err(ConnectionError::Io(e)),
            Some(Err(e)) => Err(ConnectionError::Protocol(e)),
            None => Ok(None),
        }
    }

    /// Reads and decodes the next command. Returns `None` on a clean EOF.
    ///
    /// A frame that arrives intact but cannot be decoded yields a
    /// recoverable error (see [`ConnectionError::is_recoverable`]); the
    /// stream stays usable.
    pub async fn read_command(&mut self) -> Result<Option<Command>, ConnectionError> {
        match self.read_frame().await? {
            Some(body) => Ok(Some(decode_command(&body)?)),
            None => Ok(None),
        }
    }

    /// Reads and decodes the next result frame. EOF is an error here: the
    /// caller is waiting for a reply.
    pub async fn read_result(&mut self) -> Result<CommandResult, ConnectionError> {
        let body = self.read_frame().await?.ok_or(ConnectionError::Eof)?;
        Ok(decode_result(&body)?)
    }
}

/// Errors that can occur on a peer connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    Eof,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Timed out connecting to {address}")]
    ConnectTimeout { address: String },

    #[error("Connection already closed")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// True for errors confined to a single frame: the frame boundary was
    /// intact, so the receive loop can skip it and keep reading.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Protocol(
                ProtocolError::MalformedFrame(_)
                    | ProtocolError::InvalidResultCode(_)
                    | ProtocolError::InvalidCommandName(_)
            )
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Returns a connected (client, server) socket pair on loopback.
    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_command_crosses_the_socket() {
        let (client, server) = socket_pair().await;
        let (client_conn, _client_reader) = Connection::new(client);
        let (_server_conn, mut server_reader) = Connection::new(server);

        client_conn
            .send_command("heartbeat", b"10.0.0.5:7000")
            .await
            .unwrap();

        let cmd = server_reader.read_command().await.unwrap().unwrap();
        assert_eq!(cmd.name, "heartbeat");
        assert_eq!(&cmd.payload[..], b"10.0.0.5:7000");
    }

    #[tokio::test]
    async fn test_result_crosses_the_socket() {
        let (client, server) = socket_pair().await;
        let (client_conn, _client_reader) = Connection::new(client);
        let (_server_conn, mut server_reader) = Connection::new(server);

        client_conn
            .send_result("docker_join", ResultCode::Success, br#"{"a:1":1}"#)
            .await
            .unwrap();

        let result = server_reader.read_result().await.unwrap();
        assert_eq!(result.name, "docker_join");
        assert!(result.code.is_success());
        assert_eq!(&result.payload[..], br#"{"a:1":1}"#);
    }

    #[tokio::test]
    async fn test_close_flushes_then_peer_sees_eof() {
        let (client, server) = socket_pair().await;
        let (client_conn, _client_reader) = Connection::new(client);
        let (_server_conn, mut server_reader) = Connection::new(server);

        client_conn.send_command("a", b"1").await.unwrap();
        client_conn.close().await.unwrap();
        assert!(client_conn.is_closed());

        assert_eq!(server_reader.read_command().await.unwrap().unwrap().name, "a");
        assert!(server_reader.read_command().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (client, _server) = socket_pair().await;
        let (conn, _reader) = Connection::new(client);

        conn.close().await.unwrap();
        assert!(matches!(
            conn.send_command("a", b"1").await,
            Err(ConnectionError::Closed)
        ));
        // Second close is a no-op
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_resolves_closed() {
        let (client, _server) = socket_pair().await;
        let (conn, _reader) = Connection::new(client);

        conn.close().await.unwrap();
        timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_timeout_closes_connection() {
        let (client, server) = socket_pair().await;
        let (conn, _reader) = Connection::with_write_timeout(client, Duration::from_millis(100));

        // The peer does not read until the writer gives up
        let frame = beege_protocol::encode_frame(&[b'x'; 60_000]).unwrap();
        let mut failure = None;
        for _ in 0..10_000 {
            if let Err(e) = conn.send_frame(&frame).await {
                failure = Some(e);
                break;
            }
        }

        assert!(matches!(failure, Some(ConnectionError::WriteTimeout)));
        assert!(conn.is_closed());
        timeout(Duration::from_secs(1), conn.closed()).await.unwrap();
        assert!(matches!(
            conn.send_command("heartbeat", b"10.0.0.1:9001").await,
            Err(ConnectionError::Closed)
        ));

        // The peer drains whole frames, then the stream ends; nothing sent
        // after the failure is spliced onto the cut frame
        let (_server_conn, mut server_reader) = Connection::new(server);
        loop {
            match timeout(Duration::from_secs(5), server_reader.read_frame())
                .await
                .unwrap()
            {
                Ok(Some(body)) => assert!(body.iter().all(|b| *b == b'x')),
                Ok(None) => break,
                Err(e) => {
                    assert!(matches!(
                        e,
                        ConnectionError::Protocol(ProtocolError::TruncatedFrame { .. })
                    ));
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_src_first_set_wins() {
        let (client, _server) = socket_pair().await;
        let (conn, _reader) = Connection::new(client);

        assert!(conn.src().is_none());
        assert!(conn.set_src("10.0.0.5:7000"));
        assert!(!conn.set_src("10.0.0.6:7000"));
        assert_eq!(conn.src(), Some("10.0.0.5:7000"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_recoverable() {
        let (mut client, server) = socket_pair().await;
        let (_server_conn, mut server_reader) = Connection::new(server);

        // A frame with no separator, followed by a valid one
        client.write_all(&[0, 3, b'a', b'b', b'c']).await.unwrap();
        client
            .write_all(&beege_protocol::encode_command("heartbeat", b"x").unwrap())
            .await
            .unwrap();

        let err = server_reader.read_command().await.unwrap_err();
        assert!(err.is_recoverable());
        let cmd = server_reader.read_command().await.unwrap().unwrap();
        assert_eq!(cmd.name, "heartbeat");
    }

    #[tokio::test]
    async fn test_truncated_frame_is_fatal() {
        let (mut client, server) = socket_pair().await;
        let (_server_conn, mut server_reader) = Connection::new(server);

        client.write_all(&[0, 10, b'a', b'b']).await.unwrap();
        drop(client);

        let err = server_reader.read_command().await.unwrap_err();
        assert!(!err.is_recoverable());
        assert!(matches!(
            err,
            ConnectionError::Protocol(ProtocolError::TruncatedFrame { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_result_on_eof() {
        let (client, server) = socket_pair().await;
        let (_server_conn, mut server_reader) = Connection::new(server);
        drop(client);

        assert!(matches!(
            server_reader.read_result().await,
            Err(ConnectionError::Eof)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(Connection::connect(&addr, Duration::from_secs(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_frames_are_written_whole() {
        let (client, mut server) = socket_pair().await;
        let (conn, _reader) = Connection::new(client);

        let mut tasks = Vec::new();
        for i in 0..16u8 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                conn.send_command("docker_status", &[b'a' + i; 512]).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        conn.close().await.unwrap();

        let mut raw = Vec::new();
        server.read_to_end(&mut raw).await.unwrap();

        let mut codec = FrameCodec;
        let mut buf = bytes::BytesMut::from(&raw[..]);
        let mut count = 0;
        while let Some(body) = tokio_util::codec::Decoder::decode(&mut codec, &mut buf).unwrap() {
            let cmd = decode_command(&body).unwrap();
            assert_eq!(cmd.name, "docker_status");
            let first = cmd.payload[0];
            assert!(cmd.payload.iter().all(|b| *b == first));
            count += 1;
        }
        assert_eq!(count, 16);
    }
}
