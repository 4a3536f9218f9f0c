//! Address Manager: known reachable addresses per peer.
//!
//! Peers live in an arena keyed by [`PeerId`]; nothing here holds a reference
//! to another peer. Address lists are deduplicated by (protocol, host, port)
//! and expired entries are dropped on every resolve, so a returned candidate
//! list never contains duplicates or stale addresses.
//!
//! Time is passed in explicitly as unix seconds.

use peer_types::{AddressRecord, AddressSource, Endpoint, PeerId, RegistryRecord, WireAddress};
use std::collections::HashMap;
use std::net::IpAddr;

/// Which candidates the Connection Manager may dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CandidatePolicy {
    /// Every non-expired candidate, best first.
    #[default]
    Direct,
    /// Only registry-relay candidates (direct traversal is known to fail).
    RelayOnly,
}

/// Everything known about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    /// The peer.
    pub peer_id: PeerId,
    /// Deduplicated addresses, possibly including expired ones until the next resolve.
    pub addresses: Vec<AddressRecord>,
    /// Unix seconds of first contact or discovery.
    pub first_seen: u64,
    /// Unix seconds of the most recent observation or contact.
    pub last_seen: u64,
}

/// Known addresses for this node and for every remote peer.
#[derive(Debug, Default)]
pub struct AddressBook {
    own: Vec<AddressRecord>,
    peers: HashMap<PeerId, PeerEntry>,
}

impl AddressBook {
    /// Create an empty address book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one of this node's local-interface addresses (never expires).
    pub fn register_local(&mut self, endpoint: Endpoint) {
        merge(&mut self.own, AddressRecord::new(endpoint, AddressSource::Local, None));
    }

    /// Register an externally reachable address of this node, valid for `ttl_secs`.
    pub fn register_external(&mut self, source: AddressSource, endpoint: Endpoint, ttl_secs: u64, now: u64) {
        let record = AddressRecord::new(endpoint, source, Some(now.saturating_add(ttl_secs)));
        merge(&mut self.own, record);
    }

    /// Drop every own address learned from `source` (e.g. a lost port mapping).
    pub fn withdraw_external(&mut self, source: AddressSource) -> usize {
        let before = self.own.len();
        self.own.retain(|r| r.source != source);
        before - self.own.len()
    }

    /// This node's current addresses, best first.
    pub fn own_addresses(&mut self, now: u64) -> Vec<AddressRecord> {
        prune_and_sort(&mut self.own, now);
        self.own.clone()
    }

    /// Own addresses in publishable form; non-expiring ones get `default_ttl`.
    pub fn local_record_addresses(&mut self, now: u64, default_ttl: u32) -> Vec<WireAddress> {
        self.own_addresses(now)
            .iter()
            .map(|r| {
                let ttl = r
                    .remaining_ttl(now)
                    .map(|left| left.min(default_ttl as u64) as u32)
                    .unwrap_or(default_ttl);
                WireAddress::from_endpoint(&r.endpoint, ttl)
            })
            .collect()
    }

    /// Record addresses observed for a peer. Creates the entry on first contact.
    ///
    /// Returns true if the peer was not known before.
    pub fn observe<I>(&mut self, peer_id: PeerId, addresses: I, now: u64) -> bool
    where
        I: IntoIterator<Item = AddressRecord>,
    {
        let mut is_new = false;
        let entry = self.peers.entry(peer_id).or_insert_with(|| {
            is_new = true;
            PeerEntry {
                peer_id,
                addresses: Vec::new(),
                first_seen: now,
                last_seen: now,
            }
        });
        for record in addresses {
            if !record.is_expired(now) {
                merge(&mut entry.addresses, record);
            }
        }
        entry.last_seen = entry.last_seen.max(now);
        is_new
    }

    /// Record every address of a verified registry record, tagging each with `source`.
    ///
    /// The caller is responsible for verifying the signature first.
    pub fn observe_record(&mut self, record: &RegistryRecord, source: AddressSource, now: u64) -> bool {
        let addresses = record.addresses.iter().map(|a| {
            AddressRecord::new(a.endpoint(), source, Some(now.saturating_add(a.ttl as u64)))
        });
        self.observe(record.peer_id, addresses, now)
    }

    /// Mark a peer as seen without new addresses (e.g. on inbound contact).
    pub fn touch(&mut self, peer_id: &PeerId, now: u64) {
        if let Some(entry) = self.peers.get_mut(peer_id) {
            entry.last_seen = entry.last_seen.max(now);
        }
    }

    /// Ordered candidate list for a peer. Empty means "currently unreachable".
    pub fn resolve(&mut self, peer_id: &PeerId, now: u64) -> Vec<AddressRecord> {
        self.resolve_with(peer_id, now, CandidatePolicy::Direct)
    }

    /// Ordered candidate list filtered by `policy`.
    pub fn resolve_with(&mut self, peer_id: &PeerId, now: u64, policy: CandidatePolicy) -> Vec<AddressRecord> {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return Vec::new();
        };
        prune_and_sort(&mut entry.addresses, now);
        entry
            .addresses
            .iter()
            .filter(|r| match policy {
                CandidatePolicy::Direct => true,
                CandidatePolicy::RelayOnly => r.source == AddressSource::RegistryRelay,
            })
            .cloned()
            .collect()
    }

    /// Remove peers not seen for `timeout_secs`. Returns the evicted ids.
    pub fn evict_inactive(&mut self, now: u64, timeout_secs: u64) -> Vec<PeerId> {
        let stale: Vec<PeerId> = self
            .peers
            .values()
            .filter(|e| now.saturating_sub(e.last_seen) >= timeout_secs)
            .map(|e| e.peer_id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Look up a peer entry.
    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerEntry> {
        self.peers.get(peer_id)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True if no peer is known.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// Source to assign an address a peer told us about directly.
///
/// Private, loopback and link-local hosts are local-network candidates;
/// anything else is an externally mapped address.
pub fn direct_source(host: &str) -> AddressSource {
    match host.trim_matches(|c| c == '[' || c == ']').parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) if v4.is_private() || v4.is_loopback() || v4.is_link_local() => AddressSource::Local,
        Ok(IpAddr::V6(v6)) if v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 => AddressSource::Local,
        _ => AddressSource::Upnp,
    }
}

/// Insert or fold a record into a list keyed by endpoint.
///
/// Overlapping records keep the better source and the later expiry.
fn merge(list: &mut Vec<AddressRecord>, incoming: AddressRecord) {
    match list.iter_mut().find(|r| r.endpoint == incoming.endpoint) {
        Some(existing) => {
            if incoming.source.priority() < existing.source.priority() {
                existing.source = incoming.source;
            }
            existing.expires_at = match (existing.expires_at, incoming.expires_at) {
                (None, _) | (_, None) => None,
                (Some(a), Some(b)) => Some(a.max(b)),
            };
        }
        None => list.push(incoming),
    }
}

fn prune_and_sort(list: &mut Vec<AddressRecord>, now: u64) {
    list.retain(|r| !r.is_expired(now));
    // Stable: equal-priority addresses keep discovery order.
    list.sort_by_key(|r| r.source.priority());
}
