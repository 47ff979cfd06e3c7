use axum::extract::State;
use axum::Json;
use tracing::instrument;

use crate::server::AppState;
use crate::types::{SearchRequest, SearchResponse};

use super::ApiError;

/// `POST /v1/search`: top-N identification across the cluster.
#[instrument(skip(state, req), fields(top_n = req.top_n, groups = req.group_ids.len()))]
pub async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    let query = req.into_query()?;
    let response = state.aggregator.search(query).await?;
    Ok(Json(response))
}
