use axum::extract::State;
use axum::Json;
use tracing::instrument;

use crate::search::ScanResponse;
use crate::server::AppState;
use crate::types::SearchRequest;

use super::ApiError;

/// `POST /internal/v1/scan`: scan only this node's partitions for a peer.
///
/// Never fans out further, so a cluster search is exactly one hop deep.
#[instrument(skip(state, req), fields(top_n = req.top_n))]
pub async fn scan(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<ScanResponse>, ApiError> {
    let query = req.into_query()?;
    Ok(Json(state.aggregator.scan_for_peer(query).await?))
}
