//! Registry endpoint health table.
//!
//! Owned by a single writer (the registry monitor task); readers get cloned
//! snapshots. A failing endpoint becomes `Degraded`, and after `down_after`
//! consecutive failures `Down` with an exponential backoff before it is
//! queried again. One success restores `Healthy`.

use crate::backoff::Backoff;
use std::time::{Duration, Instant};

/// Health of one registry endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointHealth {
    /// Answering normally.
    Healthy,
    /// Recent failures, still queried.
    Degraded {
        /// Consecutive failures.
        failures: u32,
    },
    /// Skipped until `retry_at`.
    Down {
        /// Consecutive failures.
        failures: u32,
        /// Earliest time to try again.
        retry_at: Instant,
    },
}

impl EndpointHealth {
    /// Short label for logs and status output.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded { .. } => "degraded",
            Self::Down { .. } => "down",
        }
    }
}

/// Health and latency of one configured endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointStatus {
    /// Base URL.
    pub url: String,
    /// Position in the configured list; lower is preferred.
    pub priority: usize,
    /// Current health.
    pub health: EndpointHealth,
    /// Round-trip time of the last successful request.
    pub latency: Option<Duration>,
    /// When the endpoint was last heard from or failed.
    pub last_checked: Option<Instant>,
}

impl EndpointStatus {
    /// Whether a query may be sent now.
    pub fn is_queryable(&self, now: Instant) -> bool {
        match self.health {
            EndpointHealth::Healthy | EndpointHealth::Degraded { .. } => true,
            EndpointHealth::Down { retry_at, .. } => now >= retry_at,
        }
    }
}

/// Health of every configured registry endpoint.
#[derive(Debug, Clone)]
pub struct RegistryHealth {
    endpoints: Vec<EndpointStatus>,
    down_after: u32,
    backoff: Backoff,
}

impl RegistryHealth {
    /// Start with every endpoint healthy, in priority order.
    pub fn new<I, S>(urls: I, down_after: u32, backoff: Backoff) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let endpoints = urls
            .into_iter()
            .enumerate()
            .map(|(priority, url)| EndpointStatus {
                url: url.into(),
                priority,
                health: EndpointHealth::Healthy,
                latency: None,
                last_checked: None,
            })
            .collect();
        Self {
            endpoints,
            down_after: down_after.max(1),
            backoff,
        }
    }

    /// A request to endpoint `index` succeeded in `latency`.
    pub fn record_success(&mut self, index: usize, latency: Duration, now: Instant) {
        if let Some(ep) = self.endpoints.get_mut(index) {
            ep.health = EndpointHealth::Healthy;
            ep.latency = Some(latency);
            ep.last_checked = Some(now);
        }
    }

    /// A request to endpoint `index` failed. Returns the new health.
    pub fn record_failure(&mut self, index: usize, now: Instant) -> Option<EndpointHealth> {
        let down_after = self.down_after;
        let backoff = self.backoff;
        let ep = self.endpoints.get_mut(index)?;

        let failures = match ep.health {
            EndpointHealth::Healthy => 1,
            EndpointHealth::Degraded { failures } | EndpointHealth::Down { failures, .. } => {
                failures.saturating_add(1)
            }
        };
        ep.health = if failures >= down_after {
            let attempt = failures - down_after + 1;
            EndpointHealth::Down {
                failures,
                retry_at: now + backoff.delay(attempt),
            }
        } else {
            EndpointHealth::Degraded { failures }
        };
        ep.last_checked = Some(now);
        Some(ep.health)
    }

    /// All endpoints in priority order.
    pub fn endpoints(&self) -> &[EndpointStatus] {
        &self.endpoints
    }

    /// Endpoints that may be queried now, in priority order.
    pub fn queryable(&self, now: Instant) -> Vec<EndpointStatus> {
        self.endpoints
            .iter()
            .filter(|ep| ep.is_queryable(now))
            .cloned()
            .collect()
    }

    /// The healthy endpoint with the lowest measured latency.
    ///
    /// Endpoints without a measurement rank after measured ones; ties go to
    /// the higher-priority endpoint.
    pub fn best_endpoint(&self) -> Option<&EndpointStatus> {
        self.endpoints
            .iter()
            .filter(|ep| ep.health == EndpointHealth::Healthy)
            .min_by_key(|ep| (ep.latency.is_none(), ep.latency, ep.priority))
    }
}
