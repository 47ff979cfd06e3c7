use axum::extract::{MatchedPath, State};
use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::Instrument;

use crate::error::GalleryError;
use crate::metrics::HTTP_REQUESTS_TOTAL;
use crate::server::handlers::ApiError;
use crate::server::AppState;

/// Middleware that increments `HTTP_REQUESTS_TOTAL` for every response.
///
/// Labels use the matched route pattern so template ids in URLs do not
/// blow up cardinality.
pub async fn http_metrics(
    matched_path: Option<MatchedPath>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let method = request.method().to_string();
    let path = matched_path
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let response = next.run(request).await;
    let status = response.status().as_u16().to_string();
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, &status])
        .inc();
    response
}

/// Rejects a search with 503 when every search permit is taken.
///
/// Searches are CPU bound on the scan pool; queueing them only grows latency.
pub async fn concurrency_limit(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Ok(_permit) = state.search_semaphore.clone().try_acquire_owned() else {
        return ApiError(GalleryError::SearchConcurrencyExhausted).into_response();
    };
    next.run(request).await
}

/// Middleware that attaches a request ID to every request.
///
/// Honours an incoming `x-request-id`, otherwise generates a UUID v4, and
/// echoes it back on the response.
pub async fn request_id(request: Request<axum::body::Body>, next: Next) -> Response {
    let id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let header = HeaderValue::from_str(&id).ok();
    async move {
        let mut response = next.run(request).await;
        if let Some(value) = header {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(tracing::info_span!("request", request_id = %id))
    .await
}
