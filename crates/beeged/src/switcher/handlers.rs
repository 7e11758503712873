//! Command handlers and the peer-lost callback.
//!
//! The handler table is filled in during startup and frozen before the
//! switcher actor spawns. After that it is only ever read, from any
//! connection's receive loop, without locking.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use beege_protocol::validate_command_name;

use super::commands::SwitcherError;
use crate::server::Connection;

/// Handles one command name.
///
/// Invoked on the receiving connection's own task with the connection and
/// the decoded payload. Replies go through `conn`; gossip goes through a
/// [`Broadcaster`](super::Broadcaster) captured at registration.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, conn: Arc<Connection>, payload: Bytes);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Arc<Connection>, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn call(&self, conn: Arc<Connection>, payload: Bytes) {
        (self)(conn, payload).await
    }
}

/// Lifecycle callback fired when a labelled peer leaves the live set.
///
/// Runs inside the switcher actor, so it must not call back into the
/// switcher. A frame it returns is fanned out to the remaining connections.
#[async_trait]
pub trait PeerLost: Send + Sync + 'static {
    async fn on_peer_lost(&self, address: &str) -> Option<Bytes>;
}

/// Peer-lost callback that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnorePeerLost;

#[async_trait]
impl PeerLost for IgnorePeerLost {
    async fn on_peer_lost(&self, _address: &str) -> Option<Bytes> {
        None
    }
}

/// Command name to handler mapping.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name`.
    ///
    /// # Errors
    ///
    /// - `SwitcherError::InvalidCommandName` if the name is empty, contains
    ///   whitespace, or is the reserved `disconnect`
    /// - `SwitcherError::DuplicateHandler` if the name is already taken
    pub fn register(&mut self, name: &str, handler: impl Handler) -> Result<(), SwitcherError> {
        validate_command_name(name)
            .map_err(|_| SwitcherError::InvalidCommandName(name.to_string()))?;

        if self.handlers.contains_key(name) {
            return Err(SwitcherError::DuplicateHandler(name.to_string()));
        }

        self.handlers.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("names", &self.names())
            .finish()
    }
}
