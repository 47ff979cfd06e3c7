use std::time::Duration;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers::{cluster, health, internal, load, metrics, search, templates};
use super::middleware;
use super::AppState;

/// Builds the axum router with all routes, middleware, and shared state.
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let body_limit = state.config.server.max_request_body_mb * 1024 * 1024;

    // Search paths skip the request-id span and trace layer; the handlers
    // carry their own #[instrument].
    let search_routes = Router::new()
        .route("/v1/search", post(search::search))
        .route("/internal/v1/scan", post(internal::scan))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::concurrency_limit,
        ))
        .layer(axum::middleware::from_fn(middleware::http_metrics))
        .layer(TimeoutLayer::new(timeout))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit));

    // Bulk loads run far longer than a request timeout.
    let admin_routes = Router::new()
        .route("/v1/admin/load", post(load::trigger_load).get(load::load_status))
        .layer(axum::middleware::from_fn(middleware::http_metrics))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(axum::middleware::from_fn(middleware::request_id));

    let other_routes = Router::new()
        .route("/healthz", get(health::health_check))
        .route("/readyz", get(health::readiness_check))
        .route("/metrics", get(metrics::metrics_handler))
        .route(
            "/v1/templates",
            post(templates::enroll_templates).delete(templates::clear_templates),
        )
        .route("/v1/templates/_stats", get(templates::store_stats))
        .route(
            "/v1/templates/:id",
            get(templates::get_template).delete(templates::delete_template),
        )
        .route("/v1/cluster", get(cluster::cluster_view))
        .layer(axum::middleware::from_fn(middleware::http_metrics))
        .layer(TimeoutLayer::new(timeout))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(axum::middleware::from_fn(middleware::request_id));

    search_routes
        .merge(admin_routes)
        .merge(other_routes)
        .with_state(state)
}
