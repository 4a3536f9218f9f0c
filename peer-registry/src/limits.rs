//! Rate limiting for the registry server.
//!
//! Publishes are limited per peer id (the key a record is signed with), since
//! many honest peers can share one NAT'd IP. Every request also counts
//! against a server-wide cap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the registry server.
#[derive(Clone)]
pub struct RateLimits {
    publish_limiter: Arc<KeyedLimiter<[u8; 32]>>,
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("publish_keys", &self.publish_limiter.len())
            .finish_non_exhaustive()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration. Zero values are treated as one.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.publishes_per_minute).unwrap_or(NonZeroU32::MIN);
        let global = NonZeroU32::new(config.global_requests_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            publish_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
            global_limiter: Arc::new(RateLimiter::direct(Quota::per_second(global))),
        }
    }

    /// Check if `peer_id` may publish now.
    pub fn check_publish(&self, peer_id: &[u8; 32]) -> Result<(), RateLimitError> {
        self.publish_limiter
            .check_key(peer_id)
            .map_err(|_| RateLimitError::PublishLimitExceeded)
    }

    /// Check the server-wide request rate.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of tracked publisher keys (for metrics).
    pub fn publish_keys_count(&self) -> usize {
        self.publish_limiter.len()
    }

    /// Drop limiter cells of idle publishers. Called from the cleanup task.
    pub fn shrink(&self) {
        self.publish_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many publishes from this peer.
    #[error("publish rate limit exceeded")]
    PublishLimitExceeded,
    /// Server-wide request rate exceeded.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(publishes_per_minute: u32, global_requests_per_second: u32) -> LimitsConfig {
        LimitsConfig {
            publishes_per_minute,
            global_requests_per_second,
        }
    }

    #[test]
    fn publish_limit_is_per_peer() {
        let limits = RateLimits::new(&config(2, 1000));
        let a = [1u8; 32];
        let b = [2u8; 32];

        assert!(limits.check_publish(&a).is_ok());
        assert!(limits.check_publish(&a).is_ok());
        assert_eq!(
            limits.check_publish(&a),
            Err(RateLimitError::PublishLimitExceeded)
        );

        assert!(limits.check_publish(&b).is_ok());
        assert_eq!(limits.publish_keys_count(), 2);
    }

    #[test]
    fn global_rate_limiter_rejects_excess() {
        let limits = RateLimits::new(&config(100, 5));
        for _ in 0..5 {
            assert!(limits.check_global().is_ok());
        }
        assert_eq!(
            limits.check_global(),
            Err(RateLimitError::GlobalLimitExceeded)
        );
    }

    #[test]
    fn zero_quota_still_admits_one() {
        let limits = RateLimits::new(&config(0, 0));
        assert!(limits.check_publish(&[3u8; 32]).is_ok());
        assert!(limits.check_global().is_ok());
    }

    #[test]
    fn shrink_keeps_limiter_usable() {
        let limits = RateLimits::new(&config(10, 1000));
        let _ = limits.check_publish(&[4u8; 32]);
        limits.shrink();
        assert!(limits.check_publish(&[5u8; 32]).is_ok());
    }
}
