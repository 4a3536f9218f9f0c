//! # hearth-peer-core
//!
//! Pure logic for hearth peers (no I/O, instant tests).
//!
//! This crate implements the state machines and bookkeeping behind peer
//! discovery, NAT traversal, connection pooling and delta synchronization,
//! without any network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. Time is passed in by the caller. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O (sockets, HTTP, storage) is performed by `hearth-peer-node`,
//! which interprets the decisions made here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address_book;
pub mod backoff;
pub mod health;
pub mod ledger;
pub mod nat;
pub mod penalty;
pub mod pool;
pub mod queue;

pub use address_book::{direct_source, AddressBook, CandidatePolicy, PeerEntry};
pub use backoff::Backoff;
pub use health::{EndpointHealth, EndpointStatus, RegistryHealth};
pub use ledger::{Admission, InboundLedger};
pub use nat::{NatAction, NatEvent, NatState};
pub use penalty::{AddressBlacklist, PeerPenalties, Strike};
pub use pool::{PoolPolicy, SessionState, SessionUsage};
pub use queue::{PushOutcome, QueuedDelta, SyncQueue, DEFAULT_QUEUE_CAPACITY};
