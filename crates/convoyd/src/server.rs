//! Health and metrics endpoints.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;

use convoy_controller::{Controller, render_prometheus};

pub fn build_router(controller: Arc<Controller>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(controller)
}

/// GET /healthz
async fn healthz() -> &'static str {
    "ok"
}

/// GET /readyz — ready once every informer cache has synced.
async fn readyz(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    if controller.has_synced() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "caches not synced")
    }
}

/// GET /metrics
async fn metrics(State(controller): State<Arc<Controller>>) -> impl IntoResponse {
    let body = render_prometheus(&controller.metrics().snapshot());
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
