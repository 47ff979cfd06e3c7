use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{DoneMarker, LeaseKeeper, LeaseManager, MembershipRegistry};
use crate::config::{Config, HostProfile, LoadMode};
use crate::error::{GalleryError, Result};
use crate::feature::FeatureBlob;
use crate::index::TemplateStore;
use crate::loader::governor::Pressure;
use crate::loader::source::{RowSource, ShardFilter, TemplateRow};
use crate::metrics::{LOAD_DURATION, LOAD_ROWS_TOTAL};
use crate::types::{
    LoadRequest, LoadResult, LoadSummary, RejectedRows, ShardAssignment, Template,
};

const MISSING_ID: &str = "missing_id";
const MISSING_FEATURE: &str = "missing_feature";
const BAD_FEATURE_LENGTH: &str = "bad_feature_length";
const NON_FINITE_FEATURE: &str = "non_finite_feature";

/// Loader tuning resolved from config and the host profile.
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub mode: LoadMode,
    pub lock_name: String,
    pub lock_timeout: Duration,
    pub lock_poll: Duration,
    pub group_chunk_size: usize,
    pub batch_size: usize,
    pub progress_interval: usize,
    pub expected_members: usize,
    pub stabilization_timeout: Duration,
    pub stabilization_poll: Duration,
    pub slow_delay: Duration,
    pub critical_delay: Duration,
}

impl LoaderSettings {
    pub fn new(config: &Config, profile: &HostProfile) -> Self {
        Self {
            mode: config.loader.mode,
            lock_name: config.loader.lock_name.clone(),
            lock_timeout: Duration::from_secs(config.loader.lock_timeout_secs),
            lock_poll: Duration::from_millis(config.cluster.lock_poll_interval_ms),
            group_chunk_size: config.loader.group_chunk_size.max(1),
            batch_size: profile.batch_size.max(1),
            progress_interval: profile.progress_interval.max(1),
            expected_members: config.cluster.expected_members,
            stabilization_timeout: Duration::from_secs(config.cluster.stabilization_timeout_secs),
            stabilization_poll: Duration::from_secs(config.cluster.heartbeat_interval_secs.max(1)),
            slow_delay: Duration::from_millis(config.governor.slow_delay_ms),
            critical_delay: Duration::from_millis(config.governor.critical_delay_ms),
        }
    }
}

/// Held while a single-leader load writes, so writes carry its token.
struct Fence<'a> {
    token: u64,
    keeper: &'a LeaseKeeper,
}

/// Populates the template store from the backing store.
///
/// Two passes: group memberships first, folded into an `owner -> groups` map
/// in bounded chunks; then templates, annotated from that map and inserted in
/// batches. Throughput follows the memory governor.
pub struct BulkLoader {
    store: Arc<TemplateStore>,
    source: Option<Arc<dyn RowSource>>,
    leases: LeaseManager,
    membership: Arc<MembershipRegistry>,
    pressure: watch::Receiver<Pressure>,
    settings: LoaderSettings,
    running: Mutex<()>,
    last_result: watch::Sender<Option<LoadResult>>,
}

impl BulkLoader {
    pub fn new(
        store: Arc<TemplateStore>,
        source: Option<Arc<dyn RowSource>>,
        leases: LeaseManager,
        membership: Arc<MembershipRegistry>,
        pressure: watch::Receiver<Pressure>,
        settings: LoaderSettings,
    ) -> Self {
        let (last_result, _) = watch::channel(None);
        Self {
            store,
            source,
            leases,
            membership,
            pressure,
            settings,
            running: Mutex::new(()),
            last_result,
        }
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.try_lock().is_err()
    }

    pub fn last_result(&self) -> Option<LoadResult> {
        self.last_result.borrow().clone()
    }

    /// Run one load.
    ///
    /// Request validation errors are returned as `Err`. Everything that
    /// happens once loading starts is reported through `LoadResult`.
    #[instrument(skip(self), fields(mode = %self.settings.mode))]
    pub async fn load(&self, request: LoadRequest) -> Result<LoadResult> {
        let explicit = request.explicit_shard()?;
        let Some(source) = self.source.clone() else {
            return Ok(LoadResult::failed("no backing store configured"));
        };
        let _running = self.running.try_lock().map_err(|_| {
            GalleryError::Validation("a load is already running on this node".into())
        })?;

        info!(source = %source.describe(), shard = ?explicit, "load requested");
        let result = match (explicit, self.settings.mode) {
            (Some(shard), _) => self.finish(self.run(source.as_ref(), Some(shard), None).await),
            (None, LoadMode::Sharded) => self.load_sharded(source.as_ref()).await,
            (None, LoadMode::SingleLeader) => self.load_as_leader(source.as_ref()).await,
        };
        self.last_result.send_replace(Some(result.clone()));
        Ok(result)
    }

    async fn load_sharded(&self, source: &dyn RowSource) -> LoadResult {
        let s = &self.settings;
        if let Err(e) = self
            .membership
            .wait_for_stable(s.expected_members, s.stabilization_timeout, s.stabilization_poll)
            .await
        {
            // Proceed with what we know rather than block the load.
            warn!(error = %e, "membership did not stabilize, computing shard anyway");
        }
        let view = self.membership.view();
        let shard = match ShardAssignment::from_view(&view, self.membership.node_id()) {
            Ok(shard) => shard,
            Err(e) => return LoadResult::failed(e.to_string()),
        };
        info!(shard = %shard, members = ?view.node_ids(), "shard assigned");
        self.finish(self.run(source, Some(shard), None).await)
    }

    async fn load_as_leader(&self, source: &dyn RowSource) -> LoadResult {
        let s = &self.settings;
        let lease = match self
            .leases
            .acquire_within(&s.lock_name, s.lock_timeout, s.lock_poll)
            .await
        {
            Ok(lease) => lease,
            Err(e @ GalleryError::LockTimeout { .. }) => {
                info!(error = %e, "load lock not acquired, assuming another node loads");
                return LoadResult::skipped(format!(
                    "skipped: {e}; another node is loading or has loaded"
                ));
            }
            Err(e) => return LoadResult::failed(format!("failed to acquire load lock: {e}")),
        };

        info!(fencing_token = lease.fencing_token, "load lock acquired");
        match self.previous_load().await {
            Ok(None) => {}
            Ok(Some(marker)) => {
                self.leases.release(&lease).await;
                info!(
                    loaded_by = %marker.holder_id,
                    fencing_token = marker.fencing_token,
                    "data already loaded, skipping"
                );
                return LoadResult::skipped(format!(
                    "skipped: already loaded by {} under fencing token {}",
                    marker.holder_id, marker.fencing_token
                ));
            }
            Err(e) => {
                self.leases.release(&lease).await;
                return LoadResult::failed(format!("failed to read load marker: {e}"));
            }
        }

        let keeper = self.leases.keep_alive(lease.clone());
        let fence = Fence {
            token: lease.fencing_token,
            keeper: &keeper,
        };
        let outcome = self.run(source, None, Some(fence)).await;
        drop(keeper);
        if outcome.is_ok() {
            if let Err(e) = self.leases.mark_done(&lease).await {
                warn!(error = %e, "failed to record load completion");
            }
        }
        self.leases.release(&lease).await;
        self.finish(outcome)
    }

    /// A completed single-leader load that still counts: its loader is live
    /// and, if that loader is this node, the data is still here.
    async fn previous_load(&self) -> Result<Option<DoneMarker>> {
        let Some(marker) = self.leases.done_marker(&self.settings.lock_name).await? else {
            return Ok(None);
        };
        let view = match self.membership.refresh().await {
            Ok(view) => view,
            Err(e) => {
                warn!(error = %e, "membership refresh failed, using cached view");
                self.membership.view()
            }
        };
        if view.position(&marker.holder_id).is_none() {
            warn!(loaded_by = %marker.holder_id, "previous loader left the cluster, reloading");
            return Ok(None);
        }
        if marker.holder_id == self.membership.node_id() && self.store.is_empty() {
            info!("previous load was ours but the store is empty, reloading");
            return Ok(None);
        }
        Ok(Some(marker))
    }

    fn finish(&self, outcome: Result<LoadSummary>) -> LoadResult {
        match outcome {
            Ok(summary) => {
                LOAD_DURATION.observe(summary.elapsed_ms as f64 / 1000.0);
                info!(
                    shard = ?summary.shard,
                    group_rows = summary.group_rows,
                    owners_with_groups = summary.owners_with_groups,
                    template_rows = summary.template_rows,
                    templates_loaded = summary.templates_loaded,
                    rejected_missing_id = summary.rejected.missing_id,
                    rejected_missing_feature = summary.rejected.missing_feature,
                    rejected_bad_feature_length = summary.rejected.bad_feature_length,
                    rejected_non_finite_feature = summary.rejected.non_finite_feature,
                    batches = summary.batches,
                    throttled_batches = summary.throttled_batches,
                    elapsed_ms = summary.elapsed_ms,
                    "load complete"
                );
                LoadResult::completed(summary)
            }
            Err(e) => {
                error!(error = %e, "load failed");
                LoadResult::failed(e.to_string())
            }
        }
    }

    async fn run(
        &self,
        source: &dyn RowSource,
        shard: Option<ShardAssignment>,
        fence: Option<Fence<'_>>,
    ) -> Result<LoadSummary> {
        let start = Instant::now();
        let mut summary = LoadSummary {
            shard,
            ..LoadSummary::default()
        };

        let owner_groups = self.group_pass(source, &mut summary).await?;
        self.template_pass(source, shard, &owner_groups, fence.as_ref(), &mut summary)
            .await?;

        summary.elapsed_ms = start.elapsed().as_millis() as u64;
        Ok(summary)
    }

    /// Pass 1: `owner -> groups`, accumulated in chunks of at most
    /// `group_chunk_size` distinct owners before folding into the result.
    async fn group_pass(
        &self,
        source: &dyn RowSource,
        summary: &mut LoadSummary,
    ) -> Result<HashMap<String, BTreeSet<String>>> {
        let chunk_size = self.settings.group_chunk_size;
        let mut owner_groups: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut chunk: HashMap<String, BTreeSet<String>> = HashMap::with_capacity(chunk_size);

        let mut rows = source.group_rows().await?;
        while let Some(row) = rows.next().await {
            let row = row?;
            summary.group_rows += 1;
            chunk.entry(row.owner_id).or_default().insert(row.group_id);
            if chunk.len() >= chunk_size {
                fold_chunk(&mut owner_groups, &mut chunk);
            }
        }
        fold_chunk(&mut owner_groups, &mut chunk);

        summary.owners_with_groups = owner_groups.len() as u64;
        info!(
            group_rows = summary.group_rows,
            owners = summary.owners_with_groups,
            "group membership pass complete"
        );
        Ok(owner_groups)
    }

    /// Pass 2: validate, annotate and batch-insert templates.
    async fn template_pass(
        &self,
        source: &dyn RowSource,
        shard: Option<ShardAssignment>,
        owner_groups: &HashMap<String, BTreeSet<String>>,
        fence: Option<&Fence<'_>>,
        summary: &mut LoadSummary,
    ) -> Result<()> {
        let filter = shard.map(ShardFilter::new);
        let mut rows = source.template_rows(filter).await?;
        let mut batch: Vec<Template> = Vec::with_capacity(self.settings.batch_size);
        let mut batch_limit = self.settings.batch_size;
        let mut next_progress = self.settings.progress_interval as u64;

        while let Some(row) = rows.next().await {
            let row = row?;
            summary.template_rows += 1;
            let (id, owner_id, feature) = match validate_row(row) {
                Ok(parts) => parts,
                Err(e) => {
                    record_reject(&mut summary.rejected, &e);
                    continue;
                }
            };
            let groups = owner_groups.get(&owner_id).cloned().unwrap_or_default();
            batch.push(Template::new(id, owner_id, feature, groups));

            if batch.len() >= batch_limit {
                batch_limit = self.flush(&mut batch, fence, summary).await?;
                if summary.templates_loaded >= next_progress {
                    info!(
                        templates_loaded = summary.templates_loaded,
                        rejected = summary.rejected.total(),
                        "load progress"
                    );
                    next_progress += self.settings.progress_interval as u64;
                }
            }
        }
        if !batch.is_empty() {
            self.flush(&mut batch, fence, summary).await?;
        }
        Ok(())
    }

    /// Insert the pending batch after honouring memory pressure. Returns the
    /// batch size to use next.
    async fn flush(
        &self,
        batch: &mut Vec<Template>,
        fence: Option<&Fence<'_>>,
        summary: &mut LoadSummary,
    ) -> Result<usize> {
        let pressure = *self.pressure.borrow();
        let next_limit = match pressure {
            Pressure::Normal => self.settings.batch_size,
            Pressure::Slow => {
                tokio::time::sleep(self.settings.slow_delay).await;
                (self.settings.batch_size / 2).max(1)
            }
            Pressure::Critical => {
                tokio::time::sleep(self.settings.critical_delay).await;
                (self.settings.batch_size / 2).max(1)
            }
        };
        if pressure != Pressure::Normal {
            summary.throttled_batches += 1;
        }

        let templates = std::mem::take(batch);
        let inserted = match fence {
            Some(fence) => {
                if fence.keeper.is_lost() {
                    return Err(GalleryError::LeaseExpired {
                        name: self.settings.lock_name.clone(),
                    });
                }
                self.store.put_all_fenced(fence.token, templates)?
            }
            None => self.store.put_all(templates),
        };

        summary.batches += 1;
        summary.templates_loaded += inserted as u64;
        LOAD_ROWS_TOTAL
            .with_label_values(&["loaded"])
            .inc_by(inserted as u64);
        debug!(inserted, pressure = ?pressure, next_limit, "batch inserted");
        Ok(next_limit)
    }

    /// Empty the store under the load lock, fenced by its token, and forget
    /// the cluster's completed load so the next single-leader load runs.
    pub async fn clear_under_lock(&self) -> Result<usize> {
        let lease = self.leases.acquire(&self.settings.lock_name).await?;
        let outcome = match self.store.clear_fenced(lease.fencing_token) {
            Ok(cleared) => self.leases.clear_done(&lease).await.map(|()| cleared),
            Err(e) => Err(e),
        };
        self.leases.release(&lease).await;
        outcome
    }
}

fn fold_chunk(
    into: &mut HashMap<String, BTreeSet<String>>,
    chunk: &mut HashMap<String, BTreeSet<String>>,
) {
    for (owner, groups) in chunk.drain() {
        into.entry(owner).or_default().extend(groups);
    }
}

fn validate_row(row: TemplateRow) -> Result<(String, String, FeatureBlob)> {
    let reject = |reason: &str, row: &TemplateRow| GalleryError::LoadRowRejected {
        row: row.id.clone().unwrap_or_else(|| "<no id>".to_string()),
        reason: reason.to_string(),
    };
    let id = match row.id.as_deref() {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => return Err(reject(MISSING_ID, &row)),
    };
    let feature = match row.feature.as_deref() {
        None | Some([]) => return Err(reject(MISSING_FEATURE, &row)),
        Some(raw) => FeatureBlob::try_from(raw).map_err(|_| reject(BAD_FEATURE_LENGTH, &row))?,
    };
    if !feature.is_finite() {
        return Err(reject(NON_FINITE_FEATURE, &row));
    }
    Ok((id, row.owner_id.unwrap_or_default(), feature))
}

fn record_reject(rejected: &mut RejectedRows, error: &GalleryError) {
    let GalleryError::LoadRowRejected { row, reason } = error else {
        return;
    };
    match reason.as_str() {
        MISSING_ID => rejected.missing_id += 1,
        MISSING_FEATURE => rejected.missing_feature += 1,
        NON_FINITE_FEATURE => rejected.non_finite_feature += 1,
        _ => rejected.bad_feature_length += 1,
    }
    LOAD_ROWS_TOTAL.with_label_values(&[reason.as_str()]).inc();
    debug!(row = %row, reason = %reason, "row rejected");
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: Option<&str>, feature: Option<Vec<u8>>) -> TemplateRow {
        TemplateRow {
            id: id.map(String::from),
            owner_id: Some("o".to_string()),
            feature,
        }
    }

    #[test]
    fn test_validate_row_reasons() {
        assert!(validate_row(row(Some("t1"), Some(vec![0; 512]))).is_ok());

        let reason = |r: TemplateRow| match validate_row(r).unwrap_err() {
            GalleryError::LoadRowRejected { reason, .. } => reason,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(reason(row(None, Some(vec![0; 512]))), MISSING_ID);
        assert_eq!(reason(row(Some(""), Some(vec![0; 512]))), MISSING_ID);
        assert_eq!(reason(row(Some("t"), None)), MISSING_FEATURE);
        assert_eq!(reason(row(Some("t"), Some(vec![]))), MISSING_FEATURE);
        assert_eq!(reason(row(Some("t"), Some(vec![0; 100]))), BAD_FEATURE_LENGTH);

        let nan = FeatureBlob::from_floats(&[f32::NAN; crate::feature::DIMENSIONS]);
        assert_eq!(
            reason(row(Some("t"), Some(nan.as_bytes().to_vec()))),
            NON_FINITE_FEATURE
        );
    }

    #[test]
    fn test_missing_owner_defaults_to_empty() {
        let mut r = row(Some("t1"), Some(vec![0; 512]));
        r.owner_id = None;
        let (_, owner, _) = validate_row(r).unwrap();
        assert_eq!(owner, "");
    }

    #[test]
    fn test_fold_chunk_merges_owner_sets() {
        let mut into = HashMap::new();
        let mut chunk = HashMap::new();
        chunk.insert("o1".to_string(), BTreeSet::from(["A".to_string()]));
        fold_chunk(&mut into, &mut chunk);
        chunk.insert("o1".to_string(), BTreeSet::from(["B".to_string()]));
        fold_chunk(&mut into, &mut chunk);
        assert!(chunk.is_empty());
        assert_eq!(into["o1"].len(), 2);
    }

    #[test]
    fn test_record_reject_counts_by_reason() {
        let mut rejected = RejectedRows::default();
        for r in [
            row(None, Some(vec![0; 512])),
            row(Some("t"), None),
            row(Some("t"), Some(vec![1; 3])),
            row(Some("u"), Some(vec![1; 3])),
            row(Some("v"), Some(vec![0xff; 512])),
        ] {
            record_reject(&mut rejected, &validate_row(r).unwrap_err());
        }
        assert_eq!(
            rejected,
            RejectedRows {
                missing_id: 1,
                missing_feature: 1,
                bad_feature_length: 2,
                non_finite_feature: 1,
            }
        );
    }
}
