//! HTTP API of the registry server.
//!
//! ```text
//! POST /v1/records            RegistryRecord -> 200 PublishResponse | 400 | 429
//! GET  /v1/records/:peer_id                  -> 200 LookupResponse  | 404
//! GET  /v1/echo?port=N                       -> 200 EchoResponse
//! GET  /health                               -> 200 HealthStatus
//! GET  /metrics                              -> Prometheus text
//! ```

pub mod health;
mod metrics;

use crate::error::RegistryServerError;
use crate::server::{unix_now, Registry};
use axum::extract::{ConnectInfo, Path, Query};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use peer_types::api::{EchoResponse, ErrorBody, LookupResponse, PublishResponse};
use peer_types::{PeerId, RegistryRecord};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(registry: Arc<Registry>) -> Router {
    let mut router = Router::new()
        .route("/v1/records", post(publish_handler))
        .route("/v1/records/:peer_id", get(lookup_handler))
        .route("/v1/echo", get(echo_handler))
        .route("/health", get(health::health_handler));
    if registry.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    router.layer(Extension(registry))
}

/// Serve the API on `listener` until the future is dropped.
///
/// The echo endpoint needs the caller's socket address, so the router is
/// served with connect info.
pub async fn serve(listener: tokio::net::TcpListener, registry: Arc<Registry>) -> std::io::Result<()> {
    axum::serve(
        listener,
        build_router(registry).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

impl IntoResponse for RegistryServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InvalidSignature
            | Self::TtlExceeded { .. }
            | Self::TooManyAddresses { .. }
            | Self::InvalidPeerId(_) => StatusCode::BAD_REQUEST,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
            Self::Config(_) | Self::Storage(_) | Self::Io(_) => {
                tracing::error!(error = %self, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorBody {
            error: self.code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn publish_handler(
    Extension(registry): Extension<Arc<Registry>>,
    Json(record): Json<RegistryRecord>,
) -> Result<Json<PublishResponse>, RegistryServerError> {
    registry.admit()?;
    let stored = registry.publish(&record).await?;
    Ok(Json(PublishResponse {
        peer_id: record.peer_id,
        expires_in: stored.expires_in(stored.published_at),
    }))
}

async fn lookup_handler(
    Extension(registry): Extension<Arc<Registry>>,
    Path(peer_id): Path<String>,
) -> Result<Json<LookupResponse>, RegistryServerError> {
    registry.admit()?;
    let peer: PeerId = peer_id
        .parse()
        .map_err(|_| RegistryServerError::InvalidPeerId(peer_id.clone()))?;
    let stored = registry.lookup(&peer).await?;
    Ok(Json(LookupResponse {
        expires_in: stored.expires_in(unix_now()),
        record: stored.record,
    }))
}

#[derive(Debug, Deserialize)]
struct EchoQuery {
    port: u16,
}

async fn echo_handler(
    Extension(registry): Extension<Arc<Registry>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<EchoQuery>,
) -> Result<Json<EchoResponse>, RegistryServerError> {
    registry.admit()?;
    Ok(Json(registry.echo(remote.ip(), query.port).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::tests::{registry, signed};
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn app(config: Config) -> Router {
        build_router(Arc::new(registry(config).await))
    }

    fn post_record(record: &RegistryRecord) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/records")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(record).unwrap()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn publish_then_lookup() {
        let app = app(Config::default()).await;
        let record = signed(1, 300, 2);

        let response = app.clone().oneshot(post_record(&record)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let published: PublishResponse = json(response).await;
        assert_eq!(published.peer_id, record.peer_id);
        assert_eq!(published.expires_in, 300);

        let response = app
            .oneshot(get(&format!("/v1/records/{}", record.peer_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let found: LookupResponse = json(response).await;
        assert_eq!(found.record, record);
        assert!(found.expires_in <= 300 && found.expires_in >= 298);
    }

    #[tokio::test]
    async fn forged_record_is_bad_request() {
        let app = app(Config::default()).await;
        let mut record = signed(2, 300, 1);
        record.addresses[0].port = 1;

        let response = app.oneshot(post_record(&record)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.error, "InvalidSignature");
    }

    #[tokio::test]
    async fn excessive_ttl_is_bad_request() {
        let mut config = Config::default();
        config.storage.max_ttl_secs = 60;
        let app = app(config).await;

        let response = app.oneshot(post_record(&signed(3, 61, 1))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.error, "TtlExceeded");
    }

    #[tokio::test]
    async fn unknown_peer_is_not_found() {
        let app = app(Config::default()).await;
        let peer = signed(4, 60, 1).peer_id;

        let response = app
            .oneshot(get(&format!("/v1/records/{peer}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: ErrorBody = json(response).await;
        assert_eq!(body.error, "NotFound");
    }

    #[tokio::test]
    async fn garbage_peer_id_is_bad_request() {
        let app = app(Config::default()).await;
        let response = app.oneshot(get("/v1/records/not-a-key")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn global_limit_returns_429() {
        let mut config = Config::default();
        config.limits.global_requests_per_second = 1;
        let app = app(config).await;
        let peer = signed(5, 60, 1).peer_id;

        let first = app
            .clone()
            .oneshot(get(&format!("/v1/records/{peer}")))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::NOT_FOUND);

        let second = app
            .oneshot(get(&format!("/v1/records/{peer}")))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn echo_uses_caller_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let caller: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let app = app(Config::default())
            .await
            .layer(MockConnectInfo(caller));

        let response = app
            .oneshot(get(&format!("/v1/echo?port={port}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let echo: EchoResponse = json(response).await;
        assert_eq!(echo.observed_host, "127.0.0.1");
        assert_eq!(echo.port, port);
        assert!(echo.reachable);
    }

    #[tokio::test]
    async fn health_and_metrics_respond() {
        let app = app(Config::default()).await;

        let response = app.clone().oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let health: serde_json::Value = json(response).await;
        assert_eq!(health["status"], "ok");
        assert_eq!(health["records"], 0);

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("hearth_registry_publishes_total 0"));
    }

    #[tokio::test]
    async fn metrics_can_be_disabled() {
        let mut config = Config::default();
        config.http.metrics_enabled = false;
        let app = app(config).await;
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
