//! beege Core - Shared types for cluster membership
//!
//! This crate provides the domain types shared between the wire protocol
//! (beege-protocol) and the daemon (beeged): node roles and the
//! role-scoped peer tables that make up a roster.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod peer;
pub mod role;

// Re-exports for convenience
pub use error::{DomainError, DomainResult};
pub use peer::{unix_now, validate_address, PeerRecord, PeerTable, UnixTimestamp};
pub use role::Role;
