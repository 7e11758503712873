//! beege daemon - cluster membership, gossip and broadcast hub
//!
//! This crate provides the runtime of a beege node:
//! - `server` - TCP listener, framed connections and receive loops
//! - `switcher` - Hub actor owning live connections and the handler table
//! - `membership` - Discovery, greeting, gossip, reconnection and reporting
//! - `engine` - Local docker engine adapter
//! - `monitor` - Host metrics sampling
//! - `config` / `cli` - Configuration and the `beeged` entry point
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       beeged node                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │    Listener     │────▶│     SwitcherActor           │   │
//! │  │  (controllers)  │     │  (live connection owner)    │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ connections                 │ broadcast         │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│────▶│  membership handlers        │   │
//! │  │ (per connection)│     │  roster / gossip / reports  │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod cli;
pub mod config;
pub mod engine;
pub mod membership;
pub mod monitor;
pub mod server;
pub mod switcher;
