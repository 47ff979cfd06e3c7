use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::{info, instrument};

use crate::cluster::MembershipRegistry;
use crate::config::{HostProfile, SearchConfig};
use crate::error::{GalleryError, Result};
use crate::index::TemplateStore;
use crate::metrics::{
    GaugeGuard, ACTIVE_SEARCHES, CANDIDATES_SCANNED_TOTAL, PREFILTER_REJECTIONS_TOTAL,
    SEARCHES_TOTAL, SEARCH_DURATION,
};
use crate::search::peer::{PeerClient, ScanResponse};
use crate::search::scan::{scan_partition, with_local_retry, PreparedQuery, ScanParams, ScanStats};
use crate::search::topn::{merge_distinct, BoundedTopN};
use crate::types::{SearchQuery, SearchRequest, SearchResponse};

/// Scatter-gather top-N search.
///
/// Local partitions are scanned on a dedicated rayon pool and combined by a
/// tree reduction. Each live peer scans its own partitions over HTTP. All
/// partial heaps merge into one; any partition that cannot be scanned fails
/// the whole search rather than shrinking the result.
pub struct SearchAggregator {
    store: Arc<TemplateStore>,
    pool: Arc<rayon::ThreadPool>,
    params: ScanParams,
    max_top_n: usize,
    membership: Option<Arc<MembershipRegistry>>,
    peer_client: PeerClient,
}

impl SearchAggregator {
    pub fn new(
        store: Arc<TemplateStore>,
        profile: &HostProfile,
        config: &SearchConfig,
        membership: Option<Arc<MembershipRegistry>>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(profile.scan_workers.max(1))
            .thread_name(|i| format!("gallery-scan-{i}"))
            .build()
            .map_err(|e| GalleryError::Config(format!("failed to build scan pool: {e}")))?;
        info!(workers = profile.scan_workers, "scan pool started");
        Ok(Self {
            store,
            pool: Arc::new(pool),
            params: ScanParams::from(config),
            max_top_n: config.max_top_n,
            membership,
            peer_client: PeerClient::new(config)?,
        })
    }

    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.store
    }

    fn check_limits(&self, query: &SearchQuery) -> Result<()> {
        if query.top_n > self.max_top_n {
            return Err(GalleryError::InvalidQuery(format!(
                "top_n {} exceeds maximum of {}",
                query.top_n, self.max_top_n
            )));
        }
        Ok(())
    }

    /// Search every partition in the cluster.
    #[instrument(skip(self, query), fields(top_n = query.top_n, threshold = query.threshold))]
    pub async fn search(&self, query: SearchQuery) -> Result<SearchResponse> {
        let _active = GaugeGuard::inc(&ACTIVE_SEARCHES);
        let start = Instant::now();
        let peers = self
            .membership
            .as_ref()
            .map(|m| m.peers())
            .unwrap_or_default();
        let scope = if peers.is_empty() { "local" } else { "cluster" };

        let result = self.gather(query, &peers).await;

        SEARCH_DURATION
            .with_label_values(&[scope])
            .observe(start.elapsed().as_secs_f64());
        let outcome = match &result {
            Ok(_) => "success",
            Err(GalleryError::InvalidQuery(_)) => "invalid",
            Err(_) => "failure",
        };
        SEARCHES_TOTAL.with_label_values(&[outcome]).inc();

        if let Ok(response) = &result {
            info!(
                results = response.results.len(),
                partitions = response.partitions_scanned,
                peers = response.peers_queried,
                elapsed_ms = start.elapsed().as_millis(),
                "search complete"
            );
        }
        result
    }

    async fn gather(
        &self,
        query: SearchQuery,
        peers: &[crate::cluster::MemberRecord],
    ) -> Result<SearchResponse> {
        self.check_limits(&query)?;
        let top_n = query.top_n;
        let threshold = query.threshold;
        let wire = SearchRequest::from(&query);

        let remote = futures::future::join_all(
            peers.iter().map(|peer| self.peer_client.scan(peer, &wire)),
        );
        let (local, remote) = tokio::join!(self.scan_local(query), remote);

        let (local, stats) = local?;
        let mut partitions = stats.partitions;
        let mut partials = vec![local.into_sorted_vec()];
        for response in remote {
            let ScanResponse {
                results,
                partitions_scanned,
                ..
            } = response?;
            partitions += partitions_scanned;
            partials.push(
                results
                    .into_iter()
                    .filter(|r| r.score >= threshold)
                    .collect(),
            );
        }

        // Nodes that loaded overlapping data may return the same template.
        let merged = merge_distinct(top_n, partials);
        Ok(SearchResponse {
            results: merged.into_sorted_vec(),
            partitions_scanned: partitions,
            peers_queried: peers.len(),
        })
    }

    /// Scan only this node's partitions. Serves both local searches and
    /// peers' scatter requests.
    pub async fn scan_local(&self, query: SearchQuery) -> Result<(BoundedTopN, ScanStats)> {
        self.check_limits(&query)?;
        let top_n = query.top_n;
        let prepared = PreparedQuery::new(&query, self.params);
        let store = Arc::clone(&self.store);
        let pool = Arc::clone(&self.pool);

        let (top, stats) = tokio::task::spawn_blocking(move || {
            pool.install(|| {
                (0..store.partition_count())
                    .into_par_iter()
                    .map(|i| match store.partition(i) {
                        Some(partition) => with_local_retry(&format!("local:{i}"), || {
                            scan_partition(partition, &prepared)
                        }),
                        None => Ok((BoundedTopN::new(top_n), ScanStats::default())),
                    })
                    .try_reduce(
                        || (BoundedTopN::new(top_n), ScanStats::default()),
                        |(a, sa), (b, sb)| Ok((a.merge(b), sa + sb)),
                    )
            })
        })
        .await
        .map_err(|e| GalleryError::PartitionUnavailable {
            partition: "local".to_string(),
            attempts: 1,
            reason: e.to_string(),
        })??;

        CANDIDATES_SCANNED_TOTAL.inc_by(stats.candidates);
        PREFILTER_REJECTIONS_TOTAL.inc_by(stats.prefiltered);
        Ok((top, stats))
    }

    /// Wire response for `/internal/v1/scan`.
    pub async fn scan_for_peer(&self, query: SearchQuery) -> Result<ScanResponse> {
        let (top, stats) = self.scan_local(query).await?;
        Ok(ScanResponse {
            results: top.into_sorted_vec(),
            partitions_scanned: stats.partitions,
            candidates_scanned: stats.candidates,
        })
    }
}
