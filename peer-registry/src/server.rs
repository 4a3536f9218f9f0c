//! Registry server core: admission checks, storage and counters.
//!
//! The HTTP layer in [`crate::http`] is a thin shell over [`Registry`].

use crate::config::Config;
use crate::error::{RegistryServerError, Result};
use crate::limits::RateLimits;
use crate::storage::{RecordStorage, StoredRecord};
use peer_types::api::EchoResponse;
use peer_types::{PeerId, RegistryRecord};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;

/// Operational counters. Monotonic since startup.
#[derive(Debug, Default)]
pub struct RegistryMetrics {
    /// Records accepted.
    pub publishes_total: AtomicU64,
    /// Records refused (bad signature, TTL, size).
    pub rejected_total: AtomicU64,
    /// Lookups served.
    pub lookups_total: AtomicU64,
    /// Lookups for unknown or expired peers.
    pub lookup_misses: AtomicU64,
    /// Echo checks served.
    pub echoes_total: AtomicU64,
    /// Requests refused by a rate limit.
    pub rate_limit_hits: AtomicU64,
    /// Records removed by the sweep.
    pub records_expired: AtomicU64,
}

/// The registry.
pub struct Registry {
    config: Config,
    storage: Arc<dyn RecordStorage>,
    rate_limits: RateLimits,
    metrics: RegistryMetrics,
    started: Instant,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Create a registry over `storage`.
    pub fn new(config: Config, storage: impl RecordStorage + 'static) -> Self {
        let rate_limits = RateLimits::new(&config.limits);
        Self {
            config,
            storage: Arc::new(storage),
            rate_limits,
            metrics: RegistryMetrics::default(),
            started: Instant::now(),
        }
    }

    /// Time since the registry was created.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Storage backend.
    pub fn storage(&self) -> &dyn RecordStorage {
        self.storage.as_ref()
    }

    /// Rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Operational counters.
    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }

    /// Count a request against the global cap.
    pub fn admit(&self) -> Result<()> {
        self.rate_limits.check_global().map_err(|e| {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            e.into()
        })
    }

    /// Verify and store a record. Replaces any earlier record for the same peer.
    pub async fn publish(&self, record: &RegistryRecord) -> Result<StoredRecord> {
        if let Err(e) = self.rate_limits.check_publish(record.peer_id.as_bytes()) {
            self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
            return Err(e.into());
        }
        if let Err(e) = self.check(record) {
            self.metrics.rejected_total.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(peer = %record.peer_id, error = %e, "record rejected");
            return Err(e);
        }

        let stored = self.storage.upsert(record).await?;
        self.metrics.publishes_total.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            peer = %record.peer_id,
            addresses = record.addresses.len(),
            ttl = record.ttl(),
            "record published"
        );
        Ok(stored)
    }

    fn check(&self, record: &RegistryRecord) -> Result<()> {
        let limits = &self.config.storage;
        if record.addresses.len() > limits.max_addresses {
            return Err(RegistryServerError::TooManyAddresses {
                count: record.addresses.len(),
                max: limits.max_addresses,
            });
        }
        record
            .verify()
            .map_err(|_| RegistryServerError::InvalidSignature)?;
        let ttl = record.ttl();
        if ttl > limits.max_ttl_secs {
            return Err(RegistryServerError::TtlExceeded {
                ttl,
                max: limits.max_ttl_secs,
            });
        }
        Ok(())
    }

    /// The live record for `peer_id`.
    pub async fn lookup(&self, peer_id: &PeerId) -> Result<StoredRecord> {
        self.metrics.lookups_total.fetch_add(1, Ordering::Relaxed);
        match self.storage.lookup(peer_id).await? {
            Some(stored) => Ok(stored),
            None => {
                self.metrics.lookup_misses.fetch_add(1, Ordering::Relaxed);
                Err(RegistryServerError::NotFound {
                    peer_id: peer_id.to_string(),
                })
            }
        }
    }

    /// Report the caller's observed address and try a TCP connect back to `port` on it.
    pub async fn echo(&self, observed: IpAddr, port: u16) -> EchoResponse {
        self.metrics.echoes_total.fetch_add(1, Ordering::Relaxed);
        let target = SocketAddr::new(observed, port);
        let timeout = Duration::from_millis(self.config.http.echo_timeout_ms);
        let reachable = matches!(
            tokio::time::timeout(timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        );
        tracing::debug!(%target, reachable, "echo check");
        EchoResponse {
            observed_host: observed.to_string(),
            port,
            reachable,
        }
    }

    /// Delete expired records and shrink limiter state.
    pub async fn sweep(&self) -> Result<u64> {
        let deleted = self.storage.cleanup_expired().await?;
        self.metrics.records_expired.fetch_add(deleted, Ordering::Relaxed);
        self.rate_limits.shrink();
        Ok(deleted)
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
