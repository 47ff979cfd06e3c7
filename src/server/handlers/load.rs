use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::instrument;

use crate::server::AppState;
use crate::types::{LoadRequest, LoadResult};

use super::ApiError;

#[derive(Debug, Serialize)]
pub struct LoadStatus {
    pub running: bool,
    pub last_result: Option<LoadResult>,
}

/// `POST /v1/admin/load`: run a bulk load and wait for its result.
///
/// A skipped or failed load still answers 200; `success` carries the outcome.
#[instrument(skip(state, req))]
pub async fn trigger_load(
    State(state): State<AppState>,
    Json(req): Json<LoadRequest>,
) -> Result<Json<LoadResult>, ApiError> {
    Ok(Json(state.loader.load(req).await?))
}

/// `GET /v1/admin/load`.
pub async fn load_status(State(state): State<AppState>) -> Json<LoadStatus> {
    Json(LoadStatus {
        running: state.loader.is_running(),
        last_result: state.loader.last_result(),
    })
}
