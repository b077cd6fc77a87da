//! ntsync-server: real-time key-value synchronization server
//!
//! Clients share a tree of typed, versioned entries over a NetworkTables-style
//! binary protocol. Every change is fanned out, in commit order, to each
//! connection whose subscriptions match; entries flagged persistent survive
//! restarts through a JSON store file.
//!
//! # Architecture
//!
//! - Thread-per-core workers on mio event loops
//! - One mutation lock orders writes and their notifications
//! - Bounded per-connection outboxes; slow clients get a resync marker
//! - Debounced background persistence with atomic file replacement

/// Minimal blocking client
pub mod client;

/// Registry of live connections
pub mod client_registry;

/// Configuration management for the server
pub mod config;

/// Error types and result aliases
pub mod error;

/// Per-connection protocol state machine
pub mod network;

/// Subscriptions, outboxes and event fan-out
pub mod notify;

/// Durable store for persistent entries
pub mod persist;

/// Binary wire protocol
pub mod protocol;

/// Core server implementation
pub mod server;

/// Entry store and table view
pub mod store;

pub use client::Client;
pub use config::Config;
pub use error::{Error, Result};
pub use server::Server;
pub use store::{EntryFlags, EntryStore, Value};
