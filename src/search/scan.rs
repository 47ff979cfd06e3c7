use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::config::SearchConfig;
use crate::error::{GalleryError, Result};
use crate::feature::{cosine_like_score, hamming_within_bound, FloatVector, Signature};
use crate::index::Partition;
use crate::search::topn::BoundedTopN;
use crate::types::{MatchResult, SearchQuery};

/// Attempts made for one local partition before it is reported unavailable.
pub const LOCAL_SCAN_ATTEMPTS: usize = 2;

/// Node-wide scoring parameters, fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct ScanParams {
    pub hamming_bound: u32,
    pub match_threshold: f32,
}

impl From<&SearchConfig> for ScanParams {
    fn from(config: &SearchConfig) -> Self {
        Self {
            hamming_bound: config.hamming_bound,
            match_threshold: config.match_threshold,
        }
    }
}

/// A query decoded once and shared read-only by every partition task.
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    pub signature: Signature,
    pub vector: FloatVector,
    pub threshold: f32,
    pub top_n: usize,
    pub groups: Option<BTreeSet<String>>,
    pub params: ScanParams,
}

impl PreparedQuery {
    pub fn new(query: &SearchQuery, params: ScanParams) -> Self {
        Self {
            signature: query.feature.signature(),
            vector: query.feature.float_vector(),
            threshold: query.threshold,
            top_n: query.top_n,
            groups: query.group_filter.clone(),
            params,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    pub partitions: usize,
    pub candidates: u64,
    pub prefiltered: u64,
}

impl std::ops::Add for ScanStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            partitions: self.partitions + rhs.partitions,
            candidates: self.candidates + rhs.candidates,
            prefiltered: self.prefiltered + rhs.prefiltered,
        }
    }
}

/// Score one partition into a bounded heap.
///
/// Candidates outside the Hamming bound are skipped before the float vector
/// is decoded. Scores below the query threshold, and NaN scores from
/// non-finite features, never enter the heap.
pub fn scan_partition(partition: &Partition, query: &PreparedQuery) -> (BoundedTopN, ScanStats) {
    let mut top = BoundedTopN::new(query.top_n);
    let mut stats = ScanStats {
        partitions: 1,
        ..ScanStats::default()
    };

    partition.scan(query.groups.as_ref(), |candidate| {
        stats.candidates += 1;
        if !hamming_within_bound(
            &query.signature,
            candidate.signature(),
            query.params.hamming_bound,
        ) {
            stats.prefiltered += 1;
            return;
        }
        let score = cosine_like_score(&query.vector, &candidate.feature().float_vector());
        if score.is_nan() || score < query.threshold {
            return;
        }
        top.offer(MatchResult {
            template_id: candidate.id.clone(),
            owner_id: candidate.owner_id.clone(),
            score,
            matched: score >= query.params.match_threshold,
        });
    });

    (top, stats)
}

/// Run `task`, retrying once if it panics. A second panic becomes
/// `PartitionUnavailable` for `partition`.
pub fn with_local_retry<T, F>(partition: &str, task: F) -> Result<T>
where
    F: Fn() -> T,
{
    let mut reason = String::new();
    for attempt in 1..=LOCAL_SCAN_ATTEMPTS {
        match catch_unwind(AssertUnwindSafe(&task)) {
            Ok(value) => return Ok(value),
            Err(payload) => {
                reason = panic_message(payload.as_ref());
                tracing::warn!(partition, attempt, reason = %reason, "partition scan panicked");
            }
        }
    }
    Err(GalleryError::PartitionUnavailable {
        partition: partition.to_string(),
        attempts: LOCAL_SCAN_ATTEMPTS,
        reason,
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::{FeatureBlob, DIMENSIONS};
    use crate::types::Template;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn params() -> ScanParams {
        ScanParams {
            hamming_bound: 283,
            match_threshold: 0.9,
        }
    }

    fn floats(seed: usize) -> [f32; DIMENSIONS] {
        let mut v = [0.0f32; DIMENSIONS];
        for (i, x) in v.iter_mut().enumerate() {
            *x = (((i + 1) * (seed + 3)) % 17) as f32 - 8.0;
        }
        v
    }

    fn query(seed: usize, threshold: f32, top_n: usize) -> PreparedQuery {
        let raw = FeatureBlob::from_floats(&floats(seed)).as_bytes().to_vec();
        let q = SearchQuery::new(&raw, threshold, top_n, Vec::<String>::new()).unwrap();
        PreparedQuery::new(&q, params())
    }

    fn partition_with(seeds: &[usize]) -> Partition {
        let p = Partition::new(1000);
        for s in seeds {
            p.insert(Template::new(
                format!("t{s}"),
                format!("o{s}"),
                FeatureBlob::from_floats(&floats(*s)),
                Default::default(),
            ));
        }
        p
    }

    #[test]
    fn test_identical_template_scores_one_and_matches() {
        let p = partition_with(&[1, 2, 3]);
        let (top, stats) = scan_partition(&p, &query(2, 0.99, 1));
        let results = top.into_sorted_vec();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].template_id, "t2");
        assert!(results[0].score >= 0.99);
        assert!(results[0].matched);
        assert_eq!(stats.candidates, 3);
        assert_eq!(stats.prefiltered, 0);
    }

    #[test]
    fn test_threshold_filters_results() {
        let p = partition_with(&[1, 2, 3, 4, 5]);
        let (top, _) = scan_partition(&p, &query(1, 0.5, 10));
        for r in top.into_sorted_vec() {
            assert!(r.score >= 0.5);
        }
    }

    #[test]
    fn test_nan_template_never_qualifies() {
        let p = partition_with(&[1]);
        p.insert(Template::new(
            "nan",
            "o",
            FeatureBlob::from_floats(&[f32::NAN; DIMENSIONS]),
            Default::default(),
        ));
        let (top, stats) = scan_partition(&p, &query(1, 0.0, 5));
        let results = top.into_sorted_vec();
        assert_eq!(stats.candidates, 2);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].template_id, "t1");
        assert!(results.iter().all(|r| r.score >= 0.0));
    }

    #[test]
    fn test_tight_bound_prefilters() {
        let p = partition_with(&[1, 2, 3, 4]);
        let mut q = query(1, 0.0, 10);
        q.params.hamming_bound = 0;
        let (top, stats) = scan_partition(&p, &q);
        // Only candidates with an identical signature survive a zero bound.
        assert!(top.into_sorted_vec().iter().any(|r| r.template_id == "t1"));
        assert!(stats.prefiltered > 0 || stats.candidates == 1);
    }

    #[test]
    fn test_retry_recovers_from_single_panic() {
        let calls = AtomicUsize::new(0);
        let value = with_local_retry("local:3", || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("transient");
            }
            42
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_retry_exhaustion_is_partition_unavailable() {
        let err = with_local_retry("local:7", || -> u32 { panic!("always") }).unwrap_err();
        match err {
            GalleryError::PartitionUnavailable {
                partition,
                attempts,
                reason,
            } => {
                assert_eq!(partition, "local:7");
                assert_eq!(attempts, LOCAL_SCAN_ATTEMPTS);
                assert_eq!(reason, "always");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
