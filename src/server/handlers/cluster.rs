use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::cluster::MembershipView;
use crate::server::AppState;
use crate::types::ShardAssignment;

#[derive(Debug, Serialize)]
pub struct ClusterResponse {
    pub node_id: String,
    pub address: String,
    pub view: MembershipView,
    /// `None` until this node appears in its own view.
    pub shard: Option<ShardAssignment>,
}

/// `GET /v1/cluster`.
pub async fn cluster_view(State(state): State<AppState>) -> Json<ClusterResponse> {
    let view = state.membership.view();
    let shard = ShardAssignment::from_view(&view, state.membership.node_id()).ok();
    Json(ClusterResponse {
        node_id: state.membership.node_id().to_string(),
        address: state.membership.address().to_string(),
        view,
        shard,
    })
}
