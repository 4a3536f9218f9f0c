//! Session pool policy: LRU eviction and idle expiry.
//!
//! The connection manager keeps the live sessions; this module only decides
//! which of them to close, from a snapshot of their usage.

use peer_types::PeerId;
use std::time::{Duration, Instant};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake in progress.
    Handshaking,
    /// Authenticated and usable.
    Established,
    /// Shutting down.
    Closing,
}

impl SessionState {
    /// Short label for logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Handshaking => "handshaking",
            Self::Established => "established",
            Self::Closing => "closing",
        }
    }
}

/// Usage snapshot of one pooled session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionUsage {
    /// Remote peer.
    pub peer: PeerId,
    /// Last frame sent or received.
    pub last_used: Instant,
    /// Current state.
    pub state: SessionState,
}

/// Pool bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Maximum concurrent sessions.
    pub capacity: usize,
    /// Sessions unused for this long are closed.
    pub idle_timeout: Duration,
}

impl PoolPolicy {
    /// Create a policy.
    pub fn new(capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            idle_timeout,
        }
    }

    /// The session to evict before admitting a new one, if the pool is full.
    ///
    /// Picks the least recently used established session.
    pub fn eviction_candidate(&self, sessions: &[SessionUsage]) -> Option<PeerId> {
        let live = sessions
            .iter()
            .filter(|s| s.state != SessionState::Closing)
            .count();
        if live < self.capacity {
            return None;
        }
        sessions
            .iter()
            .filter(|s| s.state == SessionState::Established)
            .min_by_key(|s| s.last_used)
            .map(|s| s.peer)
    }

    /// Established sessions idle past the timeout.
    pub fn expired(&self, sessions: &[SessionUsage], now: Instant) -> Vec<PeerId> {
        sessions
            .iter()
            .filter(|s| s.state == SessionState::Established)
            .filter(|s| now.saturating_duration_since(s.last_used) >= self.idle_timeout)
            .map(|s| s.peer)
            .collect()
    }
}
