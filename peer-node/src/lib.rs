//! # peer-node
//!
//! Networking core of a hearth social node.
//!
//! A node keeps one authenticated, encrypted session per peer and pushes
//! locally authored deltas to every peer it knows about, in order, until
//! each one acknowledges them. Peers find each other through gossip, seed
//! lists and signed address records published to registries.
//!
//! ## Features
//!
//! - **Signed identity**: Ed25519 keypair per node; the public key is the peer id
//! - **Forward-secret sessions**: X25519 handshake, XChaCha20-Poly1305 per message
//! - **NAT traversal**: NAT-PMP port mapping with relay fallback
//! - **Registry fan-out**: health-tracked queries across several registries
//! - **LAN discovery**: signed UDP broadcast announcements on the local network
//! - **Ordered delivery**: per-peer bounded queues with cumulative acks
//!
//! ## Example
//!
//! ```ignore
//! use peer_node::{Node, NodeConfig};
//!
//! let node = Node::start(NodeConfig::from_file("hearth.toml".as_ref())?).await?;
//!
//! // Reach a peer, asking the registries if needed
//! node.connect(peer_id).await?;
//!
//! // Author a delta; it is delivered to every known peer
//! node.enqueue_local(b"hello").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod lan;
pub mod nat;
pub mod node;
pub mod registry;
pub mod store;
pub mod sync;
pub mod transport;

pub use config::{ConfigError, NodeConfig, PeerSeed};
pub use connection::{ConnectError, ConnectionManager, ConnectionSettings, SessionInfo};
pub use crypto::{ContentCipher, CryptoError, IdentityKeypair, SessionCipher, StorageKey};
pub use error::NodeError;
pub use lan::{LanDiscovery, LanSettings};
pub use nat::{NatError, NatHandle, NatPmpMapper, NatTraversal, PortMapper, ReachabilityCheck};
pub use node::{Node, NodeParts, NodeStatus, QueueInfo};
pub use registry::{RegistryClient, RegistryError};
pub use store::{ContentStore, MemoryStore, StoreError};
pub use sync::{SyncEngine, SyncError};
pub use transport::{Dialer, TcpDialer, TransportError, MAX_FRAME_SIZE};

/// Seconds since the Unix epoch.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
