//! # peer-registry
//!
//! Self-hostable discovery directory for hearth peers.
//!
//! Peers publish signed address records here and look each other up by
//! peer id. The registry:
//! - Accepts a record only if its signature verifies against the claimed peer id
//! - Caps record lifetime and size, and rate limits publishers
//! - Keeps one record per peer (last write wins) in SQLite
//! - Sweeps expired records in the background
//! - Answers reachability echoes so NAT'd peers can learn their public address
//!
//! ## Architecture
//!
//! ```text
//! Peer A ──┐   POST /v1/records          ┌── Peer B
//!          ├────────────────────────────►│   GET /v1/records/:peer_id
//!          │                             │
//!      ┌───┴─────────────────────────────┴───┐
//!      │          hearth-registry            │
//!      │  ┌───────────────────────────────┐  │
//!      │  │  SQLite (signed records, TTL) │  │
//!      │  └───────────────────────────────┘  │
//!      └─────────────────────────────────────┘
//! ```
//!
//! The registry never holds keys. A record it serves can be checked by the
//! reader without trusting the registry.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod limits;
pub mod server;
pub mod storage;

pub use config::Config;
pub use error::{RegistryServerError, StorageError};
pub use server::Registry;
pub use storage::{RecordStorage, SqliteStorage, StoredRecord};
