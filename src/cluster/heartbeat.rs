use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::MembershipRegistry;

/// Publish this node's heartbeat every `interval` until shutdown, then leave
/// the cluster.
pub async fn heartbeat_loop(
    registry: Arc<MembershipRegistry>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(
        node_id = %registry.node_id(),
        interval_secs = interval.as_secs(),
        "heartbeat loop started"
    );

    loop {
        match registry.heartbeat().await {
            Ok(view) => debug!(members = view.len(), "heartbeat published"),
            Err(e) => warn!(error = %e, "heartbeat failed"),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {},
            _ = shutdown.changed() => {
                info!("heartbeat loop shutting down");
                break;
            }
        }
    }

    if let Err(e) = registry.leave().await {
        warn!(error = %e, "failed to remove membership record on shutdown");
    }
}
