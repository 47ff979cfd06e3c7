use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::GalleryError;
use crate::server::AppState;
use crate::types::{Template, TemplateRecord};

use super::ApiError;

#[derive(Debug, Deserialize)]
pub struct EnrollRequest {
    pub templates: Vec<TemplateRecord>,
}

#[derive(Debug, Serialize)]
pub struct EnrollResponse {
    pub enrolled: usize,
    pub store_size: usize,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub cleared: usize,
}

/// Store occupancy. `partition_min`/`partition_max` show key skew.
#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub size: usize,
    pub partitions: usize,
    pub partition_min: usize,
    pub partition_max: usize,
    pub approx_bytes: usize,
    pub fence: u64,
}

/// `POST /v1/templates`: enroll a batch. All-or-nothing on validation.
#[instrument(skip(state, req), fields(count = req.templates.len()))]
pub async fn enroll_templates(
    State(state): State<AppState>,
    Json(req): Json<EnrollRequest>,
) -> Result<Json<EnrollResponse>, ApiError> {
    let max = state.config.server.max_enroll_batch;
    if req.templates.is_empty() {
        return Err(ApiError(GalleryError::Validation(
            "templates must not be empty".into(),
        )));
    }
    if req.templates.len() > max {
        return Err(ApiError(GalleryError::Validation(format!(
            "batch of {} exceeds maximum of {max}",
            req.templates.len()
        ))));
    }

    let templates = req
        .templates
        .into_iter()
        .map(TemplateRecord::into_template)
        .collect::<Result<Vec<Template>, _>>()?;
    let enrolled = state.store.put_all(templates);
    info!(enrolled, "templates enrolled");

    Ok(Json(EnrollResponse {
        enrolled,
        store_size: state.store.size(),
    }))
}

/// `GET /v1/templates/:id`.
pub async fn get_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TemplateRecord>, ApiError> {
    let template = state
        .store
        .get(&id)
        .ok_or(GalleryError::TemplateNotFound { id })?;
    Ok(Json(TemplateRecord::from(template.as_ref())))
}

/// `DELETE /v1/templates/:id`.
#[instrument(skip(state))]
pub async fn delete_template(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.store.remove(&id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError(GalleryError::TemplateNotFound { id })),
    }
}

/// `DELETE /v1/templates`: empty the store under the load lock.
///
/// Fails with 409 while a load holds the lock.
#[instrument(skip(state))]
pub async fn clear_templates(
    State(state): State<AppState>,
) -> Result<Json<ClearResponse>, ApiError> {
    let cleared = state.loader.clear_under_lock().await?;
    Ok(Json(ClearResponse { cleared }))
}

/// `GET /v1/templates/_stats`.
pub async fn store_stats(State(state): State<AppState>) -> Json<StoreStats> {
    let sizes = state.store.partition_sizes();
    Json(StoreStats {
        size: sizes.iter().sum(),
        partitions: sizes.len(),
        partition_min: sizes.iter().copied().min().unwrap_or(0),
        partition_max: sizes.iter().copied().max().unwrap_or(0),
        approx_bytes: state.store.approx_bytes(),
        fence: state.store.fence(),
    })
}
