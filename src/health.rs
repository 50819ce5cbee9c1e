use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

pub struct HealthState {
    pub registry: Arc<Registry>,
    pub ready: Arc<AtomicBool>,
}

pub type SharedHealthState = Arc<HealthState>;

impl HealthState {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
    }
}

/// `/readyz` and `/metrics`. Liveness stays with the caller since the
/// webhook server answers it from the database.
pub fn router(state: SharedHealthState) -> Router {
    Router::new()
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub async fn healthz() -> &'static str {
    "ok"
}

pub async fn readyz(State(state): State<SharedHealthState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Relaxed) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

pub async fn metrics_handler(State(state): State<SharedHealthState>) -> impl IntoResponse {
    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.registry) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response();
    }
    (
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buffer,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::metrics::SyncMetrics;

    async fn get_path(router: Router, path: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_readyz_follows_flag() {
        let state = Arc::new(HealthState::new(Registry::default()));
        let (status, _) = get_path(router(state.clone()), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        state.set_ready();
        let (status, body) = get_path(router(state), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_metrics_are_encoded() {
        let mut registry = Registry::default();
        let metrics = SyncMetrics::new(&mut registry);
        metrics.write("Company", "created");
        let state = Arc::new(HealthState::new(registry));

        let (status, body) = get_path(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("maintainerd_sync_writes_total"));
        assert!(body.contains(r#"kind="Company""#));
        assert!(body.ends_with("# EOF\n"));
    }
}
