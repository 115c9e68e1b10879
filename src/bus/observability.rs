//! Read-only HTTP observability surface: `/healthz`, `/ready`, `/metrics`.
//! Boundary-only — serving is the only job of this module; it owns no
//! business state beyond the readiness predicate it's handed.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

/// Readiness is `(queue writable) ∧ (registry loaded)`; callers pass a
/// closure rather than raw state so bus and agent binaries can each supply
/// their own definition without this module knowing about either.
pub struct ObservabilityState {
    pub ready: Box<dyn Fn() -> bool + Send + Sync>,
    pub metrics_handle: PrometheusHandle,
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(state): State<Arc<ObservabilityState>>) -> StatusCode {
    if (state.ready)() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics(State(state): State<Arc<ObservabilityState>>) -> String {
    state.metrics_handle.render()
}

/// Serves until `shutdown` resolves, then lets in-flight requests finish
/// before returning.
pub async fn serve_observability(
    addr: SocketAddr,
    state: Arc<ObservabilityState>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown).await
}
