use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use prometheus::{Encoder, TextEncoder};

use crate::metrics::STORED_TEMPLATES;
use crate::server::AppState;

/// Prometheus text exposition. The stored-templates gauge is refreshed from
/// the store first so it is exact at scrape time.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    STORED_TEMPLATES.set(state.store.size() as i64);

    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&prometheus::gather(), &mut buf) {
        tracing::error!(error = %e, "failed to encode prometheus metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            format!("metrics encoding failed: {e}").into_bytes(),
        );
    }
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buf,
    )
}
