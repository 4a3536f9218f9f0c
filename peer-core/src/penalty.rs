//! Address blacklist and per-peer malformed-message penalties.
//!
//! Authentication failures blacklist the offending address, never the peer
//! id, since addresses can be stale or spoofed. Malformed messages are
//! tolerated once; a second strike inside the window penalizes the peer.

use peer_types::{Endpoint, PeerId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Addresses temporarily excluded from dialing.
#[derive(Debug, Clone)]
pub struct AddressBlacklist {
    duration: Duration,
    entries: HashMap<Endpoint, Instant>,
}

impl AddressBlacklist {
    /// Create a blacklist whose entries last `duration`.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            entries: HashMap::new(),
        }
    }

    /// Exclude `endpoint` until `now + duration`.
    pub fn block(&mut self, endpoint: Endpoint, now: Instant) {
        self.entries.insert(endpoint, now + self.duration);
    }

    /// Whether `endpoint` is currently excluded.
    pub fn is_blocked(&self, endpoint: &Endpoint, now: Instant) -> bool {
        self.entries.get(endpoint).is_some_and(|until| now < *until)
    }

    /// Drop expired entries.
    pub fn purge(&mut self, now: Instant) {
        self.entries.retain(|_, until| now < *until);
    }

    /// Number of entries, expired or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is blacklisted.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of reporting a malformed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strike {
    /// First occurrence in the window: drop the message and carry on.
    Tolerated,
    /// Repeated: close the session and refuse the peer until `until`.
    Penalize {
        /// End of the penalty.
        until: Instant,
    },
}

#[derive(Debug, Clone, Copy)]
struct PeerRecord {
    last_strike: Option<Instant>,
    penalized_until: Option<Instant>,
}

/// Malformed-message accounting per peer.
#[derive(Debug, Clone)]
pub struct PeerPenalties {
    window: Duration,
    penalty: Duration,
    peers: HashMap<PeerId, PeerRecord>,
}

impl PeerPenalties {
    /// Two strikes within `window` penalize a peer for `penalty`.
    pub fn new(window: Duration, penalty: Duration) -> Self {
        Self {
            window,
            penalty,
            peers: HashMap::new(),
        }
    }

    /// Report a malformed message from `peer`.
    pub fn strike(&mut self, peer: PeerId, now: Instant) -> Strike {
        let record = self.peers.entry(peer).or_insert(PeerRecord {
            last_strike: None,
            penalized_until: None,
        });

        let repeated = record
            .last_strike
            .is_some_and(|last| now.saturating_duration_since(last) <= self.window);
        if repeated {
            let until = now + self.penalty;
            record.last_strike = None;
            record.penalized_until = Some(until);
            Strike::Penalize { until }
        } else {
            record.last_strike = Some(now);
            Strike::Tolerated
        }
    }

    /// Whether `peer` is currently refused.
    pub fn is_penalized(&self, peer: &PeerId, now: Instant) -> bool {
        self.peers
            .get(peer)
            .and_then(|r| r.penalized_until)
            .is_some_and(|until| now < until)
    }

    /// Forget peers with no active penalty and no strike inside the window.
    pub fn purge(&mut self, now: Instant) {
        let window = self.window;
        self.peers.retain(|_, r| {
            let penalized = r.penalized_until.is_some_and(|until| now < until);
            let striking = r
                .last_strike
                .is_some_and(|last| now.saturating_duration_since(last) <= window);
            penalized || striking
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blacklist_expires() {
        let mut bl = AddressBlacklist::new(Duration::from_secs(60));
        let addr = Endpoint::tcp("203.0.113.1", 9999);
        let now = Instant::now();

        bl.block(addr.clone(), now);
        assert!(bl.is_blocked(&addr, now + Duration::from_secs(59)));
        assert!(!bl.is_blocked(&addr, now + Duration::from_secs(60)));
        assert!(!bl.is_blocked(&Endpoint::tcp("203.0.113.2", 9999), now));

        bl.purge(now + Duration::from_secs(61));
        assert!(bl.is_empty());
    }

    #[test]
    fn first_malformed_message_is_tolerated() {
        let mut p = PeerPenalties::new(Duration::from_secs(60), Duration::from_secs(300));
        let peer = PeerId::new([1; 32]);
        let now = Instant::now();

        assert_eq!(p.strike(peer, now), Strike::Tolerated);
        assert!(!p.is_penalized(&peer, now));
    }

    #[test]
    fn second_strike_in_window_penalizes() {
        let mut p = PeerPenalties::new(Duration::from_secs(60), Duration::from_secs(300));
        let peer = PeerId::new([1; 32]);
        let now = Instant::now();

        p.strike(peer, now);
        let later = now + Duration::from_secs(30);
        assert_eq!(
            p.strike(peer, later),
            Strike::Penalize {
                until: later + Duration::from_secs(300)
            }
        );
        assert!(p.is_penalized(&peer, later));
        assert!(!p.is_penalized(&peer, later + Duration::from_secs(300)));
    }

    #[test]
    fn strikes_outside_window_are_forgiven() {
        let mut p = PeerPenalties::new(Duration::from_secs(60), Duration::from_secs(300));
        let peer = PeerId::new([2; 32]);
        let now = Instant::now();

        p.strike(peer, now);
        assert_eq!(p.strike(peer, now + Duration::from_secs(120)), Strike::Tolerated);

        p.purge(now + Duration::from_secs(500));
        assert!(!p.is_penalized(&peer, now + Duration::from_secs(500)));
    }
}
