//! JSON bodies exchanged with a registry over HTTP.
//!
//! ```text
//! POST /v1/records            RegistryRecord      -> PublishResponse
//! GET  /v1/records/{peer_id}                      -> LookupResponse | 404 ErrorBody
//! GET  /v1/echo?port=N                            -> EchoResponse
//! ```

use crate::{PeerId, RegistryRecord};
use serde::{Deserialize, Serialize};

/// Reply to an accepted publish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Peer the record belongs to.
    pub peer_id: PeerId,
    /// Seconds until the registry drops the record.
    pub expires_in: u32,
}

/// Reply to a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    /// The stored record, exactly as signed by its owner.
    pub record: RegistryRecord,
    /// Seconds of validity the registry has left for it.
    pub expires_in: u32,
}

/// Reachability echo: the address the registry saw the request come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoResponse {
    /// Observed remote host.
    pub observed_host: String,
    /// Port the caller asked about.
    pub port: u16,
    /// Whether a TCP connection back to `observed_host:port` succeeded.
    pub reachable: bool,
}

/// Error payload for non-2xx replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub error: String,
    /// Human-readable detail.
    pub message: String,
}
