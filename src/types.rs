use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{GalleryError, Result};
use crate::feature::{FeatureBlob, Signature, FEATURE_BYTES};

/// A unique identifier for a template.
pub type TemplateId = String;

/// Smallest and largest `top_n` a query may ask for.
pub const MIN_TOP_N: usize = 1;
pub const MAX_TOP_N: usize = 100;

/// One enrolled biometric record.
///
/// Immutable once built. The signature is derived from the feature in the
/// constructor and never accepted from outside, so it cannot drift.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub id: TemplateId,
    pub owner_id: String,
    pub group_ids: BTreeSet<String>,
    feature: FeatureBlob,
    signature: Signature,
}

impl Template {
    pub fn new(
        id: impl Into<TemplateId>,
        owner_id: impl Into<String>,
        feature: FeatureBlob,
        group_ids: BTreeSet<String>,
    ) -> Self {
        let signature = feature.signature();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            group_ids,
            feature,
            signature,
        }
    }

    pub fn feature(&self) -> &FeatureBlob {
        &self.feature
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// True if this template belongs to at least one of `groups`.
    pub fn in_any_group(&self, groups: &BTreeSet<String>) -> bool {
        groups.iter().any(|g| self.group_ids.contains(g))
    }

    /// Rough resident size, used for memory accounting.
    pub fn approx_bytes(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.id.len()
            + self.owner_id.len()
            + self.group_ids.iter().map(|g| g.len() + 24).sum::<usize>()
    }
}

/// Wire form of a template. Carries the feature as base64; the signature is
/// never part of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub id: TemplateId,
    pub owner_id: String,
    pub feature: String,
    #[serde(default)]
    pub group_ids: BTreeSet<String>,
}

impl TemplateRecord {
    pub fn into_template(self) -> Result<Template> {
        if self.id.is_empty() {
            return Err(GalleryError::Validation("template id must not be empty".into()));
        }
        let feature = FeatureBlob::from_base64(&self.feature)?;
        if !feature.is_finite() {
            return Err(GalleryError::Validation(format!(
                "template {}: feature contains NaN or infinite values",
                self.id
            )));
        }
        Ok(Template::new(self.id, self.owner_id, feature, self.group_ids))
    }
}

impl From<&Template> for TemplateRecord {
    fn from(t: &Template) -> Self {
        Self {
            id: t.id.clone(),
            owner_id: t.owner_id.clone(),
            feature: t.feature.to_base64(),
            group_ids: t.group_ids.clone(),
        }
    }
}

/// A validated search query.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub feature: FeatureBlob,
    pub threshold: f32,
    pub top_n: usize,
    /// `None` searches the whole store.
    pub group_filter: Option<BTreeSet<String>>,
}

impl SearchQuery {
    /// Validate raw inputs. Every violation is an `InvalidQuery`.
    pub fn new(
        feature: &[u8],
        threshold: f32,
        top_n: usize,
        group_ids: impl IntoIterator<Item = String>,
    ) -> Result<Self> {
        if !(MIN_TOP_N..=MAX_TOP_N).contains(&top_n) {
            return Err(GalleryError::InvalidQuery(format!(
                "top_n {top_n} outside [{MIN_TOP_N}, {MAX_TOP_N}]"
            )));
        }
        if !(0.0..=1.0).contains(&threshold) {
            return Err(GalleryError::InvalidQuery(format!(
                "threshold {threshold} outside [0, 1]"
            )));
        }
        let feature = FeatureBlob::try_from(feature).map_err(|_| {
            GalleryError::InvalidQuery(format!(
                "feature must be exactly {FEATURE_BYTES} bytes, got {}",
                feature.len()
            ))
        })?;
        if !feature.is_finite() {
            return Err(GalleryError::InvalidQuery(
                "feature contains NaN or infinite values".into(),
            ));
        }
        let groups: BTreeSet<String> = group_ids.into_iter().collect();
        Ok(Self {
            feature,
            threshold,
            top_n,
            group_filter: (!groups.is_empty()).then_some(groups),
        })
    }
}

/// Search request as received over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Base64-encoded 512-byte feature.
    pub feature: String,
    pub threshold: f32,
    pub top_n: usize,
    /// Empty searches the entire store.
    #[serde(default)]
    pub group_ids: Vec<String>,
}

impl SearchRequest {
    pub fn into_query(self) -> Result<SearchQuery> {
        let raw = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            self.feature.trim(),
        )
        .map_err(|e| GalleryError::InvalidQuery(format!("feature is not valid base64: {e}")))?;
        SearchQuery::new(&raw, self.threshold, self.top_n, self.group_ids)
    }
}

impl From<&SearchQuery> for SearchRequest {
    fn from(q: &SearchQuery) -> Self {
        Self {
            feature: q.feature.to_base64(),
            threshold: q.threshold,
            top_n: q.top_n,
            group_ids: q
                .group_filter
                .iter()
                .flat_map(|g| g.iter().cloned())
                .collect(),
        }
    }
}

/// One scored candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub template_id: TemplateId,
    pub owner_id: String,
    pub score: f32,
    pub matched: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// At most `top_n` entries, sorted by descending score.
    pub results: Vec<MatchResult>,
    pub partitions_scanned: usize,
    pub peers_queried: usize,
}

/// `(node_index, total_nodes)` for the sharded loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub node_index: usize,
    pub total_nodes: usize,
}

impl ShardAssignment {
    pub fn new(node_index: usize, total_nodes: usize) -> Result<Self> {
        if total_nodes == 0 {
            return Err(GalleryError::Validation("total_shards must be > 0".into()));
        }
        if node_index >= total_nodes {
            return Err(GalleryError::Validation(format!(
                "shard_index {node_index} must be < total_shards {total_nodes}"
            )));
        }
        Ok(Self {
            node_index,
            total_nodes,
        })
    }

    /// A single shard covering everything.
    pub fn whole() -> Self {
        Self {
            node_index: 0,
            total_nodes: 1,
        }
    }

    /// True if a key with this hash belongs to this shard.
    pub fn owns_hash(&self, hash: u64) -> bool {
        hash % self.total_nodes as u64 == self.node_index as u64
    }
}

impl std::fmt::Display for ShardAssignment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.node_index, self.total_nodes)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadRequest {
    #[serde(default)]
    pub shard_index: Option<usize>,
    #[serde(default)]
    pub total_shards: Option<usize>,
}

impl LoadRequest {
    /// Explicit shard from the request, if both fields were given.
    pub fn explicit_shard(&self) -> Result<Option<ShardAssignment>> {
        match (self.shard_index, self.total_shards) {
            (Some(i), Some(n)) => ShardAssignment::new(i, n).map(Some),
            (None, None) => Ok(None),
            _ => Err(GalleryError::Validation(
                "shard_index and total_shards must be given together".into(),
            )),
        }
    }
}

/// Per-reason counts of rejected backing-store rows.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRows {
    pub missing_id: u64,
    pub missing_feature: u64,
    pub bad_feature_length: u64,
    #[serde(default)]
    pub non_finite_feature: u64,
}

impl RejectedRows {
    pub fn total(&self) -> u64 {
        self.missing_id + self.missing_feature + self.bad_feature_length + self.non_finite_feature
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadSummary {
    pub shard: Option<ShardAssignment>,
    pub group_rows: u64,
    pub owners_with_groups: u64,
    pub template_rows: u64,
    pub templates_loaded: u64,
    pub rejected: RejectedRows,
    pub batches: u64,
    pub throttled_batches: u64,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<LoadSummary>,
}

impl LoadResult {
    pub fn completed(summary: LoadSummary) -> Self {
        Self {
            success: true,
            message: format!(
                "loaded {} templates ({} rejected) in {} ms",
                summary.templates_loaded,
                summary.rejected.total(),
                summary.elapsed_ms
            ),
            summary: Some(summary),
        }
    }

    pub fn skipped(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            summary: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            summary: None,
        }
    }
}
