use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, instrument};
use xxhash_rust::xxh3::xxh3_64;

use super::partition::Partition;
use crate::error::{GalleryError, Result};
use crate::metrics::{STORED_TEMPLATES, STORE_EVICTIONS_TOTAL};
use crate::types::{ShardAssignment, Template, TemplateId};

/// Fence name used in `FencingTokenStale` errors raised by the store.
const STORE_FENCE: &str = "template-store";

/// Stable key -> partition mapping. Depends only on the id and the
/// partition count, never on insertion order or cluster size.
pub fn partition_for(id: &str, partition_count: usize) -> usize {
    (xxh3_64(id.as_bytes()) % partition_count as u64) as usize
}

/// True if `id` belongs to `shard`: `xxh3(id) mod total_nodes == node_index`.
///
/// Depends only on the id and the shard, so nodes configured with different
/// partition counts still split the keyspace disjointly.
pub fn key_in_shard(id: &str, shard: &ShardAssignment) -> bool {
    shard.owns_hash(xxh3_64(id.as_bytes()))
}

/// This node's in-memory template index.
///
/// A fixed array of [`Partition`]s addressed by [`partition_for`]. Reads and
/// writes on independent keys run concurrently; `clear` gives no isolation
/// against in-flight searches and is only called under the cluster lock.
pub struct TemplateStore {
    partitions: Vec<Partition>,
    /// Highest fencing token observed by a fenced write.
    fence: AtomicU64,
}

impl TemplateStore {
    /// `max_entries` is split evenly across partitions.
    pub fn new(partition_count: usize, max_entries: usize) -> Self {
        let partition_count = partition_count.max(1);
        let per_partition = max_entries.div_ceil(partition_count).max(1);
        Self {
            partitions: (0..partition_count)
                .map(|_| Partition::new(per_partition))
                .collect(),
            fence: AtomicU64::new(0),
        }
    }

    pub fn shared(partition_count: usize, max_entries: usize) -> Arc<Self> {
        Arc::new(Self::new(partition_count, max_entries))
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partition_of(&self, id: &str) -> usize {
        partition_for(id, self.partitions.len())
    }

    pub fn partition(&self, index: usize) -> Option<&Partition> {
        self.partitions.get(index)
    }

    pub fn put(&self, template: Template) {
        let outcome = self.partitions[self.partition_of(&template.id)].insert(template);
        if outcome.added {
            STORED_TEMPLATES.inc();
        }
        if outcome.evicted > 0 {
            STORED_TEMPLATES.sub(outcome.evicted as i64);
            STORE_EVICTIONS_TOTAL.inc_by(outcome.evicted as u64);
        }
    }

    /// Insert a batch. Returns the number of templates written.
    pub fn put_all(&self, templates: impl IntoIterator<Item = Template>) -> usize {
        let mut n = 0;
        for t in templates {
            self.put(t);
            n += 1;
        }
        n
    }

    /// `put_all` guarded by a lock's fencing token.
    pub fn put_all_fenced(&self, token: u64, templates: Vec<Template>) -> Result<usize> {
        self.observe_fence(token)?;
        Ok(self.put_all(templates))
    }

    pub fn get(&self, id: &str) -> Option<Arc<Template>> {
        self.partitions[self.partition_of(id)].get(id)
    }

    pub fn remove(&self, id: &str) -> Option<Arc<Template>> {
        let removed = self.partitions[self.partition_of(id)].remove(id);
        if removed.is_some() {
            STORED_TEMPLATES.dec();
        }
        removed
    }

    /// Ids of all templates tagged with `group_id`.
    pub fn group_index(&self, group_id: &str) -> HashSet<TemplateId> {
        self.partitions
            .iter()
            .flat_map(|p| p.group_members(group_id))
            .collect()
    }

    /// Visit every held template passing `predicate`, optionally restricted
    /// to a group filter.
    pub fn scan_owned<P, F>(&self, groups: Option<&BTreeSet<String>>, predicate: P, mut visit: F)
    where
        P: Fn(&Template) -> bool,
        F: FnMut(&Template),
    {
        for p in &self.partitions {
            p.scan(groups, |t| {
                if predicate(t) {
                    visit(t);
                }
            });
        }
    }

    #[instrument(skip(self))]
    pub fn clear(&self) -> usize {
        let removed: usize = self.partitions.iter().map(Partition::clear).sum();
        STORED_TEMPLATES.sub(removed as i64);
        info!(removed, "template store cleared");
        removed
    }

    /// `clear` guarded by a lock's fencing token.
    pub fn clear_fenced(&self, token: u64) -> Result<usize> {
        self.observe_fence(token)?;
        Ok(self.clear())
    }

    /// Record `token` and reject it if a newer holder has already written.
    fn observe_fence(&self, token: u64) -> Result<()> {
        let previous = self.fence.fetch_max(token, Ordering::AcqRel);
        if token < previous {
            return Err(GalleryError::FencingTokenStale {
                name: STORE_FENCE.to_string(),
                our_token: token,
                current_token: previous,
            });
        }
        Ok(())
    }

    pub fn fence(&self) -> u64 {
        self.fence.load(Ordering::Acquire)
    }

    pub fn size(&self) -> usize {
        self.partitions.iter().map(Partition::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(Partition::is_empty)
    }

    /// Shrink partition maps back toward their live size.
    pub fn reclaim(&self) {
        for p in &self.partitions {
            p.reclaim();
        }
        debug!(size = self.size(), "template store reclaimed spare capacity");
    }

    pub fn approx_bytes(&self) -> usize {
        self.partitions.iter().map(Partition::approx_bytes).sum()
    }

    pub fn partition_sizes(&self) -> Vec<usize> {
        self.partitions.iter().map(Partition::len).collect()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{FeatureBlob, DIMENSIONS};

    fn template(id: &str, groups: &[&str]) -> Template {
        Template::new(
            id,
            "owner",
            FeatureBlob::from_floats(&[0.25; DIMENSIONS]),
            groups.iter().map(|g| g.to_string()).collect(),
        )
    }

    #[test]
    fn test_partition_for_is_stable() {
        for id in ["a", "template-42", "ü"] {
            assert_eq!(partition_for(id, 271), partition_for(id, 271));
            assert!(partition_for(id, 271) < 271);
        }
    }

    #[test]
    fn test_shards_are_disjoint_and_cover() {
        let total = 3;
        let mut per_shard = [0usize; 3];
        for i in 0..500 {
            let id = format!("t{i}");
            let owners: Vec<usize> = (0..total)
                .filter(|n| key_in_shard(&id, &ShardAssignment::new(*n, total).unwrap()))
                .collect();
            assert_eq!(owners.len(), 1, "{id} owned by {owners:?}");
            per_shard[owners[0]] += 1;
        }
        assert!(per_shard.iter().all(|&n| n > 100), "{per_shard:?}");
    }

    #[test]
    fn test_put_get_size() {
        let store = TemplateStore::new(8, 1000);
        assert_eq!(store.put_all((0..50).map(|i| template(&format!("t{i}"), &[]))), 50);
        assert_eq!(store.size(), 50);
        assert_eq!(store.partition_sizes().iter().sum::<usize>(), 50);
        assert!(store.get("t7").is_some());
        assert!(store.get("missing").is_none());

        store.put(template("t7", &[]));
        assert_eq!(store.size(), 50);

        assert!(store.remove("t7").is_some());
        assert!(store.remove("t7").is_none());
        assert_eq!(store.size(), 49);
    }

    #[test]
    fn test_group_index_spans_partitions() {
        let store = TemplateStore::new(16, 1000);
        store.put(template("t1", &["A"]));
        store.put(template("t2", &["B"]));
        store.put(template("t3", &["A", "B"]));

        let a = store.group_index("A");
        assert_eq!(a.len(), 2);
        assert!(a.contains("t1") && a.contains("t3"));
        assert!(store.group_index("Z").is_empty());
    }

    #[test]
    fn test_scan_owned_applies_predicate_and_groups() {
        let store = TemplateStore::new(4, 1000);
        store.put(template("t1", &["A"]));
        store.put(template("t2", &["B"]));
        store.put(template("t3", &["A", "B"]));

        let mut seen = Vec::new();
        let a: BTreeSet<String> = ["A".to_string()].into();
        store.scan_owned(Some(&a), |t| t.id != "t3", |t| seen.push(t.id.clone()));
        assert_eq!(seen, vec!["t1".to_string()]);
    }

    #[test]
    fn test_fenced_writes_reject_stale_token() {
        let store = TemplateStore::new(4, 1000);
        store.put_all_fenced(3, vec![template("t1", &[])]).unwrap();
        assert_eq!(store.fence(), 3);

        let err = store.clear_fenced(2).unwrap_err();
        assert!(matches!(
            err,
            GalleryError::FencingTokenStale {
                our_token: 2,
                current_token: 3,
                ..
            }
        ));
        assert_eq!(store.size(), 1);

        assert_eq!(store.clear_fenced(3).unwrap(), 1);
        assert!(store.put_all_fenced(1, vec![template("t2", &[])]).is_err());
        assert!(store.is_empty());
    }

    #[test]
    fn test_entry_ceiling_is_split_across_partitions() {
        let store = TemplateStore::new(2, 10);
        for i in 0..100 {
            store.put(template(&format!("t{i}"), &[]));
        }
        assert!(store.size() <= 10);
        store.reclaim();
        assert!(store.approx_bytes() > 0);
    }
}
