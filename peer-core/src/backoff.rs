//! Exponential backoff with jitter.
//!
//! Shared by connection dial rounds and registry endpoint recovery. Jitter
//! keeps many peers from retrying in lockstep after a common outage.

use std::time::Duration;

/// Backoff schedule: `min(max, base * 2^(attempt - 1)) + random(0..=jitter)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: Duration,
}

impl Backoff {
    /// Create a schedule.
    pub const fn new(base: Duration, max: Duration, jitter: Duration) -> Self {
        Self { base, max, jitter }
    }

    /// Delay before attempt number `attempt` (1-based), including jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay(attempt) + random_jitter(self.jitter)
    }

    /// Delay before attempt number `attempt` without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Upper bound of the jitter component.
    pub fn jitter(&self) -> Duration {
        self.jitter
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(30), Duration::from_millis(500))
    }
}

/// Uniform jitter in `0..=max`. Falls back to no jitter if the OS RNG fails.
fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut bytes = [0u8; 8];
    if getrandom::getrandom(&mut bytes).is_err() {
        return Duration::ZERO;
    }
    Duration::from_millis(u64::from_le_bytes(bytes) % (max_ms + 1))
}
