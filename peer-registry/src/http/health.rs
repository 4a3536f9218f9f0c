//! Health endpoint polled by registry clients as their heartbeat.

use crate::server::Registry;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Always `"ok"` when the handler runs.
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
    /// Live records; zero if the count query failed.
    pub records: u64,
    /// Seconds since startup.
    pub uptime_seconds: u64,
}

/// Not rate limited, so heartbeats keep working under load.
pub async fn health_handler(Extension(registry): Extension<Arc<Registry>>) -> Json<HealthStatus> {
    let records = registry.storage().count().await.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "record count failed");
        0
    });

    Json(HealthStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        records,
        uptime_seconds: registry.uptime().as_secs(),
    })
}
