use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};

use crate::types::MatchResult;

/// Heap entry ordered by score only.
#[derive(Debug, Clone)]
struct ByScore(MatchResult);

impl PartialEq for ByScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ByScore {}

impl PartialOrd for ByScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ByScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.score.total_cmp(&other.0.score)
    }
}

/// Bounded min-heap holding the best `capacity` results seen so far.
///
/// The root is the current minimum, so a candidate is admitted in O(log n)
/// only when it beats it. Merging two heaps is associative and commutative
/// up to ties, which lets partial results combine in any order.
#[derive(Debug, Clone)]
pub struct BoundedTopN {
    capacity: usize,
    heap: BinaryHeap<Reverse<ByScore>>,
}

impl BoundedTopN {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            heap: BinaryHeap::with_capacity(capacity.saturating_add(1).min(1024)),
        }
    }

    /// Insert if not full, else replace the minimum when `result` beats it.
    /// Returns whether the result was kept. A NaN score is never kept.
    pub fn offer(&mut self, result: MatchResult) -> bool {
        if self.capacity == 0 || result.score.is_nan() {
            return false;
        }
        if self.heap.len() < self.capacity {
            self.heap.push(Reverse(ByScore(result)));
            return true;
        }
        match self.heap.peek() {
            Some(Reverse(min)) if result.score > min.0.score => {
                self.heap.pop();
                self.heap.push(Reverse(ByScore(result)));
                true
            }
            _ => false,
        }
    }

    /// Fold the smaller heap into the larger under the same bounded rule.
    pub fn merge(self, other: Self) -> Self {
        let (mut into, from) = if self.heap.len() >= other.heap.len() {
            (self, other)
        } else {
            (other, self)
        };
        into.capacity = into.capacity.max(from.capacity);
        for Reverse(ByScore(r)) in from.heap {
            into.offer(r);
        }
        into
    }

    /// Lowest score currently held, if any.
    pub fn min_score(&self) -> Option<f32> {
        self.heap.peek().map(|Reverse(r)| r.0.score)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drain into a list sorted by descending score. Tie order is unspecified.
    pub fn into_sorted_vec(self) -> Vec<MatchResult> {
        // `into_sorted_vec` on a heap of `Reverse` yields descending scores.
        self.heap
            .into_sorted_vec()
            .into_iter()
            .map(|Reverse(ByScore(r))| r)
            .collect()
    }
}

/// Merge per-node partials that may hold the same template, keeping each
/// `template_id` once at its best score.
///
/// Within a node ids are unique, so each partial alone holds `capacity`
/// distinct results and the union still contains the distinct global top-N.
pub fn merge_distinct<I>(capacity: usize, partials: I) -> BoundedTopN
where
    I: IntoIterator<Item = Vec<MatchResult>>,
{
    let mut all: Vec<MatchResult> = partials.into_iter().flatten().collect();
    all.sort_by(|a, b| b.score.total_cmp(&a.score));
    let mut seen = HashSet::with_capacity(all.len());
    let mut top = BoundedTopN::new(capacity);
    for r in all {
        if top.len() == capacity {
            break;
        }
        if seen.insert(r.template_id.clone()) {
            top.offer(r);
        }
    }
    top
}

impl Extend<MatchResult> for BoundedTopN {
    fn extend<I: IntoIterator<Item = MatchResult>>(&mut self, iter: I) {
        for r in iter {
            self.offer(r);
        }
    }
}
