//! Prometheus metrics endpoint.

use crate::server::Registry;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
pub async fn metrics_handler(Extension(registry): Extension<Arc<Registry>>) -> impl IntoResponse {
    let m = registry.metrics();
    let records = registry.storage().count().await.unwrap_or(0);
    let publishers = registry.rate_limits().publish_keys_count();

    let body = format!(
        r#"# HELP hearth_registry_records Live records in the database
# TYPE hearth_registry_records gauge
hearth_registry_records {records}

# HELP hearth_registry_publishers_tracked Peers with rate limiter state
# TYPE hearth_registry_publishers_tracked gauge
hearth_registry_publishers_tracked {publishers}

# HELP hearth_registry_info Server information
# TYPE hearth_registry_info gauge
hearth_registry_info{{version="{version}"}} 1

# HELP hearth_registry_publishes_total Records accepted
# TYPE hearth_registry_publishes_total counter
hearth_registry_publishes_total {publishes}

# HELP hearth_registry_rejected_total Records refused
# TYPE hearth_registry_rejected_total counter
hearth_registry_rejected_total {rejected}

# HELP hearth_registry_lookups_total Lookups served
# TYPE hearth_registry_lookups_total counter
hearth_registry_lookups_total {lookups}

# HELP hearth_registry_lookup_misses_total Lookups for unknown peers
# TYPE hearth_registry_lookup_misses_total counter
hearth_registry_lookup_misses_total {misses}

# HELP hearth_registry_echoes_total Echo checks served
# TYPE hearth_registry_echoes_total counter
hearth_registry_echoes_total {echoes}

# HELP hearth_registry_rate_limit_hits_total Requests refused by rate limits
# TYPE hearth_registry_rate_limit_hits_total counter
hearth_registry_rate_limit_hits_total {rate_limits}

# HELP hearth_registry_records_expired_total Records removed by the sweep
# TYPE hearth_registry_records_expired_total counter
hearth_registry_records_expired_total {expired}
"#,
        version = env!("CARGO_PKG_VERSION"),
        publishes = m.publishes_total.load(Ordering::Relaxed),
        rejected = m.rejected_total.load(Ordering::Relaxed),
        lookups = m.lookups_total.load(Ordering::Relaxed),
        misses = m.lookup_misses.load(Ordering::Relaxed),
        echoes = m.echoes_total.load(Ordering::Relaxed),
        rate_limits = m.rate_limit_hits.load(Ordering::Relaxed),
        expired = m.records_expired.load(Ordering::Relaxed),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
