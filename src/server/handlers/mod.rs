/// Cluster membership view.
pub mod cluster;
/// Health and readiness probe handlers.
pub mod health;
/// Peer scatter endpoint.
pub mod internal;
/// Bulk-load trigger and status.
pub mod load;
/// Prometheus metrics exposition handler.
pub mod metrics;
/// Identification search.
pub mod search;
/// Template enrollment, lookup, and deletion.
pub mod templates;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::error::GalleryError;

/// Wrapper that converts `GalleryError` into an HTTP response.
pub struct ApiError(pub GalleryError);

impl From<GalleryError> for ApiError {
    fn from(e: GalleryError) -> Self {
        ApiError(e)
    }
}

/// JSON body `{error, status}` with the status from `GalleryError::status_code`.
impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status_code.is_server_error() {
            tracing::error!(error = %self.0, status, "server error");
        } else if status_code.is_client_error() {
            tracing::warn!(error = %self.0, status, "client error");
        }
        let body = json!({
            "error": self.0.to_string(),
            "status": status,
        });
        (status_code, axum::Json(body)).into_response()
    }
}
