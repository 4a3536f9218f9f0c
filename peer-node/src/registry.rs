//! Registry client.
//!
//! Registries are plain HTTP services that store signed [`RegistryRecord`]s.
//! Lookups fan out to every queryable endpoint; any record returned must
//! verify against the requested peer id, and among valid answers the one
//! with the longest remaining TTL wins (ties go to the higher-priority
//! endpoint). Publishing goes to every queryable endpoint.
//!
//! Endpoint health lives in a [`RegistryHealth`] table owned by a single
//! [`RegistryMonitor`] task. Requests report outcomes to it over a channel,
//! it heartbeats each endpoint's `/health`, and it publishes snapshots on a
//! watch channel.

use crate::config::RegistryClientConfig;
use crate::nat::ReachabilityCheck;
use async_trait::async_trait;
use peer_core::{EndpointHealth, EndpointStatus, RegistryHealth};
use peer_types::api::{EchoResponse, ErrorBody, LookupResponse, PublishResponse};
use peer_types::{Endpoint, PeerId, RegistryRecord};
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Registry client errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No endpoint is queryable, or none answered.
    #[error("no registry available ({attempted} attempted)")]
    Unavailable {
        /// Endpoints that were tried.
        attempted: usize,
    },

    /// Every answering registry refused the request.
    #[error("registry rejected request: {0}")]
    Rejected(String),

    /// A registry returned a record that does not verify.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// One row of registry status.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEndpointInfo {
    /// Base URL.
    pub url: String,
    /// Configured priority, lower first.
    pub priority: usize,
    /// Health label.
    pub health: &'static str,
    /// Last measured latency.
    pub latency_ms: Option<u64>,
}

impl From<&EndpointStatus> for RegistryEndpointInfo {
    fn from(status: &EndpointStatus) -> Self {
        Self {
            url: status.url.clone(),
            priority: status.priority,
            health: status.health.label(),
            latency_ms: status.latency.map(|l| l.as_millis() as u64),
        }
    }
}

#[derive(Debug)]
struct Report {
    index: usize,
    outcome: Result<Duration, ()>,
}

struct Inner {
    http: reqwest::Client,
    health: watch::Receiver<RegistryHealth>,
    reports: mpsc::UnboundedSender<Report>,
    timeout: Duration,
}

/// HTTP client for a prioritized list of registries.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<Inner>,
}

/// Single writer of the endpoint health table.
pub struct RegistryMonitor {
    http: reqwest::Client,
    health: RegistryHealth,
    snapshots: watch::Sender<RegistryHealth>,
    reports: mpsc::UnboundedReceiver<Report>,
    heartbeat: Duration,
    timeout: Duration,
}

impl RegistryClient {
    /// Create a client for `urls` (in priority order) and its monitor.
    ///
    /// The monitor must be spawned for health to change.
    pub fn new(urls: &[String], config: &RegistryClientConfig) -> Result<(Self, RegistryMonitor), RegistryError> {
        let timeout = Duration::from_millis(config.query_timeout_ms);
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        let health = RegistryHealth::new(
            urls.iter().map(|u| u.trim_end_matches('/').to_string()),
            config.down_after,
            config.backoff(),
        );
        let (snapshots, health_rx) = watch::channel(health.clone());
        let (reports_tx, reports) = mpsc::unbounded_channel();

        let client = Self {
            inner: Arc::new(Inner {
                http: http.clone(),
                health: health_rx,
                reports: reports_tx,
                timeout,
            }),
        };
        let monitor = RegistryMonitor {
            http,
            health,
            snapshots,
            reports,
            heartbeat: Duration::from_secs(config.heartbeat_secs),
            timeout,
        };
        Ok((client, monitor))
    }

    /// Find the freshest valid record for `peer`. `Ok(None)` if no registry knows it.
    pub async fn discover(&self, peer: &PeerId) -> Result<Option<RegistryRecord>, RegistryError> {
        let targets = self.targets();
        if targets.is_empty() {
            return Err(RegistryError::Unavailable { attempted: 0 });
        }
        let attempted = targets.len();

        let mut lookups = JoinSet::new();
        for endpoint in targets {
            let http = self.inner.http.clone();
            let timeout = self.inner.timeout;
            let peer = *peer;
            lookups.spawn(async move {
                let started = Instant::now();
                let result = lookup(&http, &endpoint.url, &peer, timeout).await;
                (endpoint, started.elapsed(), result)
            });
        }

        let mut answered = 0;
        let mut best: Option<(u32, usize, RegistryRecord)> = None;
        while let Some(joined) = lookups.join_next().await {
            let Ok((endpoint, latency, result)) = joined else {
                continue;
            };
            let found = match result {
                Ok(found) => found,
                Err(e) => {
                    debug!(url = %endpoint.url, error = %e, "registry lookup failed");
                    self.report(endpoint.priority, Err(()));
                    continue;
                }
            };
            if let Some(LookupResponse { record, expires_in }) = found {
                if let Err(e) = check_record(&record, peer) {
                    warn!(url = %endpoint.url, error = %e, "registry served an invalid record");
                    self.report(endpoint.priority, Err(()));
                    continue;
                }
                let better = match &best {
                    None => true,
                    Some((ttl, priority, _)) => {
                        expires_in > *ttl || (expires_in == *ttl && endpoint.priority < *priority)
                    }
                };
                if better {
                    best = Some((expires_in, endpoint.priority, record));
                }
            }
            answered += 1;
            self.report(endpoint.priority, Ok(latency));
        }

        if answered == 0 {
            return Err(RegistryError::Unavailable { attempted });
        }
        Ok(best.map(|(_, _, record)| record))
    }

    /// Publish a signed record to every queryable registry.
    ///
    /// Returns how many accepted it.
    pub async fn publish(&self, record: &RegistryRecord) -> Result<usize, RegistryError> {
        let targets = self.targets();
        if targets.is_empty() {
            return Err(RegistryError::Unavailable { attempted: 0 });
        }
        let attempted = targets.len();

        let mut posts = JoinSet::new();
        for endpoint in targets {
            let http = self.inner.http.clone();
            let record = record.clone();
            posts.spawn(async move {
                let started = Instant::now();
                let result = post_record(&http, &endpoint.url, &record).await;
                (endpoint, started.elapsed(), result)
            });
        }

        let mut accepted = 0;
        let mut rejection = None;
        while let Some(joined) = posts.join_next().await {
            let Ok((endpoint, latency, result)) = joined else {
                continue;
            };
            match result {
                Ok(response) => {
                    debug!(url = %endpoint.url, expires_in = response.expires_in, "record published");
                    accepted += 1;
                    self.report(endpoint.priority, Ok(latency));
                }
                Err(RegistryError::Rejected(reason)) => {
                    warn!(url = %endpoint.url, reason = %reason, "registry rejected record");
                    self.report(endpoint.priority, Ok(latency));
                    rejection.get_or_insert(reason);
                }
                Err(e) => {
                    debug!(url = %endpoint.url, error = %e, "publish failed");
                    self.report(endpoint.priority, Err(()));
                }
            }
        }

        match (accepted, rejection) {
            (0, Some(reason)) => Err(RegistryError::Rejected(reason)),
            (0, None) => Err(RegistryError::Unavailable { attempted }),
            (n, _) => Ok(n),
        }
    }

    /// Ask the best registry which address we appear from, and whether `port` is reachable there.
    pub async fn echo(&self, port: u16) -> Result<EchoResponse, RegistryError> {
        let endpoint = self
            .best_endpoint()
            .or_else(|| self.targets().into_iter().next())
            .ok_or(RegistryError::Unavailable { attempted: 0 })?;

        let started = Instant::now();
        let result = async {
            let response = self
                .inner
                .http
                .get(format!("{}/v1/echo", endpoint.url))
                .query(&[("port", port)])
                .send()
                .await?;
            if !response.status().is_success() {
                return Err(rejection(response).await);
            }
            Ok(response.json::<EchoResponse>().await?)
        }
        .await;

        self.report(endpoint.priority, result.as_ref().map(|_| started.elapsed()).map_err(|_| ()));
        result
    }

    /// Healthy endpoint with the lowest measured latency.
    pub fn best_endpoint(&self) -> Option<EndpointStatus> {
        self.inner.health.borrow().best_endpoint().cloned()
    }

    /// Current health table.
    pub fn health(&self) -> RegistryHealth {
        self.inner.health.borrow().clone()
    }

    /// Follow health table changes.
    pub fn subscribe(&self) -> watch::Receiver<RegistryHealth> {
        self.inner.health.clone()
    }

    /// Status rows for every endpoint.
    pub fn status(&self) -> Vec<RegistryEndpointInfo> {
        self.inner
            .health
            .borrow()
            .endpoints()
            .iter()
            .map(RegistryEndpointInfo::from)
            .collect()
    }

    fn targets(&self) -> Vec<EndpointStatus> {
        self.inner.health.borrow().queryable(Instant::now())
    }

    fn report(&self, index: usize, outcome: Result<Duration, ()>) {
        let _ = self.inner.reports.send(Report { index, outcome });
    }
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("endpoints", &self.inner.health.borrow().endpoints().len())
            .finish()
    }
}

#[async_trait]
impl ReachabilityCheck for RegistryClient {
    async fn observe(&self, port: u16) -> Option<Endpoint> {
        match self.echo(port).await {
            Ok(echo) => {
                debug!(host = %echo.observed_host, reachable = echo.reachable, "registry echo");
                Some(Endpoint::tcp(echo.observed_host, port))
            }
            Err(e) => {
                debug!(error = %e, "reachability echo failed");
                None
            }
        }
    }
}

impl RegistryMonitor {
    /// Run until every client handle is dropped.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let start = tokio::time::Instant::now() + self.heartbeat;
        let mut heartbeat = tokio::time::interval_at(start, self.heartbeat.max(Duration::from_millis(1)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                report = self.reports.recv() => match report {
                    Some(report) => self.apply(report),
                    None => break,
                },
                _ = heartbeat.tick() => self.heartbeat().await,
            }
        }
        debug!("registry monitor stopped");
    }

    async fn heartbeat(&mut self) {
        let targets = self.health.queryable(Instant::now());
        let mut checks = JoinSet::new();
        for endpoint in targets {
            let http = self.http.clone();
            let timeout = self.timeout;
            checks.spawn(async move {
                let started = Instant::now();
                let ok = http
                    .get(format!("{}/health", endpoint.url))
                    .timeout(timeout)
                    .send()
                    .await
                    .is_ok_and(|r| r.status().is_success());
                Report {
                    index: endpoint.priority,
                    outcome: if ok { Ok(started.elapsed()) } else { Err(()) },
                }
            });
        }
        while let Some(joined) = checks.join_next().await {
            if let Ok(report) = joined {
                self.apply(report);
            }
        }
    }

    fn apply(&mut self, report: Report) {
        let now = Instant::now();
        let before = self.health.endpoints().get(report.index).map(|e| e.health);
        match report.outcome {
            Ok(latency) => self.health.record_success(report.index, latency, now),
            Err(()) => {
                self.health.record_failure(report.index, now);
            }
        }
        let after = self.health.endpoints().get(report.index).map(|e| e.health);

        if let (Some(before), Some(after)) = (before, after) {
            if before.label() != after.label() {
                let url = &self.health.endpoints()[report.index].url;
                match after {
                    EndpointHealth::Healthy => info!(url = %url, "registry recovered"),
                    EndpointHealth::Degraded { failures } => {
                        warn!(url = %url, failures, "registry degraded")
                    }
                    EndpointHealth::Down { failures, .. } => {
                        warn!(url = %url, failures, "registry down, backing off")
                    }
                }
            }
        }
        self.snapshots.send_replace(self.health.clone());
    }
}

fn check_record(record: &RegistryRecord, requested: &PeerId) -> Result<(), RegistryError> {
    if record.peer_id != *requested {
        return Err(RegistryError::InvalidRecord(format!(
            "asked for {requested}, got {}",
            record.peer_id
        )));
    }
    record
        .verify()
        .map_err(|e| RegistryError::InvalidRecord(e.to_string()))
}

async fn lookup(
    http: &reqwest::Client,
    base: &str,
    peer: &PeerId,
    timeout: Duration,
) -> Result<Option<LookupResponse>, RegistryError> {
    let response = http
        .get(format!("{base}/v1/records/{peer}"))
        .timeout(timeout)
        .send()
        .await?;
    match response.status() {
        StatusCode::NOT_FOUND => Ok(None),
        status if status.is_success() => Ok(Some(response.json().await?)),
        _ => Err(rejection(response).await),
    }
}

async fn post_record(
    http: &reqwest::Client,
    base: &str,
    record: &RegistryRecord,
) -> Result<PublishResponse, RegistryError> {
    let response = http.post(format!("{base}/v1/records")).json(record).send().await?;
    if response.status().is_client_error() {
        return Err(rejection(response).await);
    }
    let response = response.error_for_status()?;
    Ok(response.json().await?)
}

async fn rejection(response: reqwest::Response) -> RegistryError {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => RegistryError::Rejected(format!("{status}: {}", body.message)),
        Err(_) => RegistryError::Rejected(status.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::IdentityKeypair;
    use axum::extract::{ConnectInfo, Query};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use peer_types::WireAddress;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    fn config() -> RegistryClientConfig {
        RegistryClientConfig {
            heartbeat_secs: 3600,
            query_timeout_ms: 2000,
            down_after: 2,
            backoff_base_secs: 60,
            backoff_max_secs: 600,
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                router
                    .route("/health", get(|| async { "ok" }))
                    .into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });
        format!("http://{addr}")
    }

    async fn serving_record(response: Option<LookupResponse>) -> String {
        serve(Router::new().route(
            "/v1/records/:peer_id",
            get(move || {
                let response = response.clone();
                async move {
                    match response {
                        Some(r) => Ok(Json(r)),
                        None => Err(StatusCode::NOT_FOUND),
                    }
                }
            }),
        ))
        .await
    }

    fn record(identity: &IdentityKeypair, host: &str) -> RegistryRecord {
        identity
            .sign_record(vec![WireAddress::from_endpoint(&Endpoint::tcp(host, 8001), 300)])
            .unwrap()
    }

    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    fn client(urls: Vec<String>) -> RegistryClient {
        let (client, monitor) = RegistryClient::new(&urls, &config()).unwrap();
        monitor.spawn();
        client
    }

    #[tokio::test]
    async fn longest_ttl_wins() {
        let owner = IdentityKeypair::generate().unwrap();
        let short = serving_record(Some(LookupResponse {
            record: record(&owner, "203.0.113.1"),
            expires_in: 100,
        }))
        .await;
        let long = serving_record(Some(LookupResponse {
            record: record(&owner, "203.0.113.2"),
            expires_in: 280,
        }))
        .await;

        let found = client(vec![short, long])
            .discover(&owner.peer_id())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.addresses[0].host, "203.0.113.2");
    }

    #[tokio::test]
    async fn failing_registry_is_degraded_and_lookup_still_succeeds() {
        let owner = IdentityKeypair::generate().unwrap();
        let good = serving_record(Some(LookupResponse {
            record: record(&owner, "203.0.113.3"),
            expires_in: 200,
        }))
        .await;
        let registry = client(vec![dead_url(), good]);

        let found = registry.discover(&owner.peer_id()).await.unwrap();
        assert!(found.is_some());

        let mut health = registry.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            health.wait_for(|h| matches!(h.endpoints()[0].health, EndpointHealth::Degraded { .. })),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(registry.status()[1].health, "healthy");
    }

    #[tokio::test]
    async fn unknown_peer_is_none() {
        let url = serving_record(None).await;
        let peer = IdentityKeypair::generate().unwrap().peer_id();
        assert!(client(vec![url]).discover(&peer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn record_for_another_peer_is_not_trusted() {
        let owner = IdentityKeypair::generate().unwrap();
        let other = IdentityKeypair::generate().unwrap();
        let url = serving_record(Some(LookupResponse {
            record: record(&other, "203.0.113.4"),
            expires_in: 200,
        }))
        .await;

        let result = client(vec![url]).discover(&owner.peer_id()).await;
        assert!(matches!(result, Err(RegistryError::Unavailable { attempted: 1 })));
    }

    #[tokio::test]
    async fn down_endpoint_is_skipped() {
        let registry = client(vec![dead_url()]);
        let peer = PeerId::new([1; 32]);
        for _ in 0..2 {
            let _ = registry.discover(&peer).await;
        }

        let mut health = registry.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            health.wait_for(|h| matches!(h.endpoints()[0].health, EndpointHealth::Down { .. })),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(
            registry.discover(&peer).await,
            Err(RegistryError::Unavailable { attempted: 0 })
        ));
    }

    #[tokio::test]
    async fn publish_reports_acceptances_and_rejections() {
        let owner = IdentityKeypair::generate().unwrap();
        let peer_id = owner.peer_id();
        let accepting = serve(Router::new().route(
            "/v1/records",
            post(move || async move {
                Json(PublishResponse {
                    peer_id,
                    expires_in: 300,
                })
            }),
        ))
        .await;
        let refusing = serve(Router::new().route(
            "/v1/records",
            post(|| async {
                (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorBody {
                        error: "invalid_signature".into(),
                        message: "signature does not verify".into(),
                    }),
                )
            }),
        ))
        .await;

        let signed = record(&owner, "203.0.113.5");
        assert_eq!(client(vec![accepting, refusing.clone()]).publish(&signed).await.unwrap(), 1);
        match client(vec![refusing]).publish(&signed).await {
            Err(RegistryError::Rejected(reason)) => assert!(reason.contains("signature does not verify")),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn echo_reports_observed_address() {
        let url = serve(Router::new().route(
            "/v1/echo",
            get(
                |ConnectInfo(addr): ConnectInfo<SocketAddr>, Query(q): Query<HashMap<String, u16>>| async move {
                    Json(EchoResponse {
                        observed_host: addr.ip().to_string(),
                        port: q.get("port").copied().unwrap_or_default(),
                        reachable: false,
                    })
                },
            ),
        ))
        .await;

        let registry = client(vec![url]);
        assert_eq!(
            registry.observe(8001).await,
            Some(Endpoint::tcp("127.0.0.1", 8001))
        );
    }
}
