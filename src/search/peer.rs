use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cluster::MemberRecord;
use crate::config::SearchConfig;
use crate::error::{GalleryError, Result};
use crate::metrics::PEER_SCAN_RETRIES_TOTAL;
use crate::types::{MatchResult, SearchRequest};

/// Path peers expose for scanning their local partitions.
pub const SCAN_PATH: &str = "/internal/v1/scan";

/// A peer's bounded partial result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResponse {
    pub results: Vec<MatchResult>,
    pub partitions_scanned: usize,
    pub candidates_scanned: u64,
}

/// HTTP client for the scatter half of a cluster search.
///
/// Only the immutable query travels to the peer; each peer scans its own
/// partitions and answers with at most `top_n` results.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    max_attempts: usize,
    backoff: Duration,
}

impl PeerClient {
    pub fn new(config: &SearchConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.peer_timeout_ms))
            .build()
            .map_err(|e| GalleryError::Config(format!("failed to build peer client: {e}")))?;
        Ok(Self {
            http,
            max_attempts: config.peer_max_attempts.max(1),
            backoff: Duration::from_millis(100),
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Scan a peer, retrying with linear backoff. Exhausted retries fail the
    /// whole search with `PartitionUnavailable`.
    pub async fn scan(&self, peer: &MemberRecord, request: &SearchRequest) -> Result<ScanResponse> {
        let mut last_error = String::new();
        for attempt in 1..=self.max_attempts {
            match self.try_scan(peer, request).await {
                Ok(response) => {
                    debug!(
                        peer = %peer.node_id,
                        attempt,
                        results = response.results.len(),
                        "peer scan complete"
                    );
                    return Ok(response);
                }
                Err(e) => {
                    warn!(peer = %peer.node_id, attempt, error = %e, "peer scan failed");
                    last_error = e.to_string();
                    if attempt < self.max_attempts {
                        PEER_SCAN_RETRIES_TOTAL
                            .with_label_values(&[&peer.node_id])
                            .inc();
                        tokio::time::sleep(self.backoff * attempt as u32).await;
                    }
                }
            }
        }
        Err(GalleryError::PartitionUnavailable {
            partition: format!("node:{}", peer.node_id),
            attempts: self.max_attempts,
            reason: last_error,
        })
    }

    async fn try_scan(&self, peer: &MemberRecord, request: &SearchRequest) -> Result<ScanResponse> {
        let url = format!("{}{}", peer.address.trim_end_matches('/'), SCAN_PATH);
        let peer_err = |reason: String| GalleryError::Peer {
            node_id: peer.node_id.clone(),
            reason,
        };

        let resp = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| peer_err(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(peer_err(format!("status {status}: {body}")));
        }
        resp.json::<ScanResponse>()
            .await
            .map_err(|e| peer_err(format!("bad scan response: {e}")))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_unreachable_peer_exhausts_into_partition_unavailable() {
        let config = SearchConfig {
            peer_timeout_ms: 200,
            peer_max_attempts: 2,
            ..SearchConfig::default()
        };
        let client = PeerClient::new(&config)
            .unwrap()
            .with_backoff(Duration::from_millis(1));
        let peer = MemberRecord {
            node_id: "node-b".to_string(),
            // Port 9 (discard) on localhost is not listening.
            address: "http://127.0.0.1:9".to_string(),
            joined_at: Utc::now(),
            expires_at: Utc::now(),
        };
        let request = SearchRequest {
            feature: String::new(),
            threshold: 0.5,
            top_n: 1,
            group_ids: vec![],
        };

        let err = client.scan(&peer, &request).await.unwrap_err();
        match err {
            GalleryError::PartitionUnavailable {
                partition,
                attempts,
                ..
            } => {
                assert_eq!(partition, "node:node-b");
                assert_eq!(attempts, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
