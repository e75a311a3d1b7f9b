//! API route definitions.
//!
//! HTTP surface of the incident API:
//! - /health               — liveness + readiness
//! - /metrics              — Prometheus counters and histograms
//! - /api/v3/stats         — incident breakdowns and SLO compliance
//! - /api/v3/trace/{id}    — end-to-end stage trace for a tracking id
//! - /api/v3/incidents     — create (backfill/test) and fetch incidents

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::state::ApiState;

pub fn create_app(state: ApiState) -> Router {
    let v3 = Router::new()
        .route("/stats", get(handlers::get_stats))
        .route("/trace/:tracking_id", get(handlers::get_trace))
        .route("/incidents", post(handlers::create_incident))
        .route("/incidents/:incident_id", get(handlers::get_incident))
        .route(
            "/incidents/:incident_id/status",
            post(handlers::update_status),
        );

    Router::new()
        .route("/health", get(handlers::get_health))
        .route("/metrics", get(handlers::get_metrics))
        .nest("/api/v3", v3)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
