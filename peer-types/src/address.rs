//! Reachability types: endpoints, their provenance, and expiry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP stream.
    Tcp,
    /// UDP datagram.
    Udp,
}

impl Protocol {
    /// Stable single-byte code used in signing transcripts.
    pub fn code(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
            Protocol::Udp => f.write_str("udp"),
        }
    }
}

/// Where an address came from.
///
/// Ordered by connection preference: a direct local-network address is tried
/// before a NAT-mapped external one, which is tried before a registry-relay one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressSource {
    /// Direct or local-network address.
    Local,
    /// Externally reachable address obtained through automatic port mapping.
    Upnp,
    /// Address learned through a registry or reachable only via relay.
    RegistryRelay,
}

impl AddressSource {
    /// Lower is preferred.
    pub fn priority(self) -> u8 {
        match self {
            AddressSource::Local => 0,
            AddressSource::Upnp => 1,
            AddressSource::RegistryRelay => 2,
        }
    }
}

/// A (protocol, host, port) triple; the deduplication key for addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Hostname or IP literal.
    pub host: String,
    /// Port number.
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint.
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
        }
    }

    /// Shorthand for a TCP endpoint.
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Tcp, host, port)
    }

    /// `host:port`, bracketing IPv6 literals, suitable for socket APIs.
    pub fn socket_string(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.socket_string())
    }
}

/// A known address of a peer, with provenance and expiry.
///
/// `expires_at` is a unix timestamp in seconds; `None` never expires (used
/// for the node's own local-interface addresses).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressRecord {
    /// Where to connect.
    pub endpoint: Endpoint,
    /// How this address was learned.
    pub source: AddressSource,
    /// Unix seconds after which the address is stale.
    pub expires_at: Option<u64>,
}

impl AddressRecord {
    /// Create an address record.
    pub fn new(endpoint: Endpoint, source: AddressSource, expires_at: Option<u64>) -> Self {
        Self {
            endpoint,
            source,
            expires_at,
        }
    }

    /// True once `now` has reached the expiry.
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    /// Seconds left before expiry; `None` for non-expiring records.
    pub fn remaining_ttl(&self, now: u64) -> Option<u64> {
        self.expires_at.map(|at| at.saturating_sub(now))
    }
}

/// One address entry as it appears in a published record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WireAddress {
    /// Transport protocol.
    pub proto: Protocol,
    /// Hostname or IP literal.
    pub host: String,
    /// Port number.
    pub port: u16,
    /// Lifetime in seconds from publication.
    pub ttl: u32,
}

impl WireAddress {
    /// Build a wire address from an endpoint and TTL.
    pub fn from_endpoint(endpoint: &Endpoint, ttl: u32) -> Self {
        Self {
            proto: endpoint.protocol,
            host: endpoint.host.clone(),
            port: endpoint.port,
            ttl,
        }
    }

    /// The endpoint this entry points at.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.proto, self.host.clone(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_priority_order() {
        assert!(AddressSource::Local.priority() < AddressSource::Upnp.priority());
        assert!(AddressSource::Upnp.priority() < AddressSource::RegistryRelay.priority());
    }

    #[test]
    fn ipv6_hosts_are_bracketed() {
        assert_eq!(Endpoint::tcp("::1", 9999).socket_string(), "[::1]:9999");
        assert_eq!(Endpoint::tcp("10.0.0.2", 80).socket_string(), "10.0.0.2:80");
        assert_eq!(Endpoint::tcp("10.0.0.2", 80).to_string(), "tcp://10.0.0.2:80");
    }

    #[test]
    fn expiry_is_inclusive() {
        let rec = AddressRecord::new(Endpoint::tcp("1.2.3.4", 1), AddressSource::Upnp, Some(100));
        assert!(!rec.is_expired(99));
        assert!(rec.is_expired(100));
        assert_eq!(rec.remaining_ttl(40), Some(60));
        assert_eq!(rec.remaining_ttl(400), Some(0));
    }

    #[test]
    fn local_records_never_expire() {
        let rec = AddressRecord::new(Endpoint::tcp("192.168.1.5", 1), AddressSource::Local, None);
        assert!(!rec.is_expired(u64::MAX));
        assert_eq!(rec.remaining_ttl(0), None);
    }

    #[test]
    fn source_serializes_kebab_case() {
        let json = serde_json::to_string(&AddressSource::RegistryRelay).unwrap();
        assert_eq!(json, "\"registry-relay\"");
    }
}
