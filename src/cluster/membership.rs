use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::ClusterConfig;
use crate::error::{GalleryError, Result};
use crate::storage::CoordinationStore;
use crate::types::ShardAssignment;

/// Heartbeat record one node publishes about itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub node_id: String,
    /// Base URL peers use for `/internal/v1/scan`.
    pub address: String,
    pub joined_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl MemberRecord {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Live members sorted by `node_id`. `version` changes iff the member set does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MembershipView {
    pub version: u64,
    pub members: Vec<MemberRecord>,
}

impl MembershipView {
    pub fn from_members(mut members: Vec<MemberRecord>) -> Self {
        members.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        members.dedup_by(|a, b| a.node_id == b.node_id);
        let ids: Vec<&str> = members.iter().map(|m| m.node_id.as_str()).collect();
        Self {
            version: xxh3_64(ids.join("\n").as_bytes()),
            members,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.members.iter().position(|m| m.node_id == node_id)
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.members.iter().map(|m| m.node_id.clone()).collect()
    }
}

impl ShardAssignment {
    /// Locate `node_id` in the sorted live list.
    pub fn from_view(view: &MembershipView, node_id: &str) -> Result<Self> {
        let index = view.position(node_id).ok_or_else(|| {
            GalleryError::ClusterNotStable(format!(
                "node {node_id} is not in membership view {:x}",
                view.version
            ))
        })?;
        ShardAssignment::new(index, view.len())
    }
}

fn members_prefix(cluster: &str) -> String {
    format!("{cluster}/members")
}

fn member_key(cluster: &str, node_id: &str) -> String {
    format!("{cluster}/members/{node_id}.json")
}

/// Publishes this node's heartbeat and tracks the cluster's live members.
///
/// Records live in the coordination store; a record is live until its
/// `expires_at`. The latest view is cached in a `watch` channel so readers
/// (search scatter, cluster endpoint) never touch the store.
pub struct MembershipRegistry {
    store: CoordinationStore,
    cluster: String,
    node_id: String,
    address: String,
    ttl: Duration,
    joined_at: DateTime<Utc>,
    view: watch::Sender<MembershipView>,
}

impl MembershipRegistry {
    pub fn new(store: CoordinationStore, config: &ClusterConfig, address: String) -> Self {
        let (view, _) = watch::channel(MembershipView::default());
        Self {
            store,
            cluster: config.name.clone(),
            node_id: config.node_id.clone(),
            address,
            ttl: Duration::from_secs(config.member_ttl_secs),
            joined_at: Utc::now(),
            view,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Publish our record with a fresh expiry, then refresh the view.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn heartbeat(&self) -> Result<MembershipView> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| GalleryError::Config(format!("member ttl out of range: {e}")))?;
        let record = MemberRecord {
            node_id: self.node_id.clone(),
            address: self.address.clone(),
            joined_at: self.joined_at,
            expires_at: now + ttl,
        };
        let data = Bytes::from(serde_json::to_vec_pretty(&record)?);
        self.store
            .put(&member_key(&self.cluster, &self.node_id), data)
            .await?;
        self.refresh().await
    }

    /// Re-read every member record and publish the live set.
    pub async fn refresh(&self) -> Result<MembershipView> {
        let now = Utc::now();
        let keys = self.store.list_prefix(&members_prefix(&self.cluster)).await?;
        let mut members = Vec::with_capacity(keys.len());
        for key in keys {
            let data = match self.store.get(&key).await {
                Ok(data) => data,
                // Deleted between list and get.
                Err(GalleryError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            match serde_json::from_slice::<MemberRecord>(&data) {
                Ok(record) if record.is_live(now) => members.push(record),
                Ok(record) => debug!(node_id = %record.node_id, "skipping expired member"),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable member record"),
            }
        }

        let view = MembershipView::from_members(members);
        let previous = self.view.send_replace(view.clone());
        if previous.version != view.version {
            info!(
                version = %format!("{:x}", view.version),
                members = ?view.node_ids(),
                "membership changed"
            );
        }
        Ok(view)
    }

    /// Last published view.
    pub fn view(&self) -> MembershipView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MembershipView> {
        self.view.subscribe()
    }

    /// Live members other than this node.
    pub fn peers(&self) -> Vec<MemberRecord> {
        self.view
            .borrow()
            .members
            .iter()
            .filter(|m| m.node_id != self.node_id)
            .cloned()
            .collect()
    }

    /// Remove our record. Peers drop us on their next refresh.
    pub async fn leave(&self) -> Result<()> {
        self.store
            .delete(&member_key(&self.cluster, &self.node_id))
            .await?;
        info!(node_id = %self.node_id, "left cluster");
        Ok(())
    }

    /// Wait, bounded by `timeout`, for the view to settle.
    ///
    /// With `expected > 0` the view is stable once it holds that many members.
    /// With `expected == 0` it is stable once two consecutive polls agree.
    /// On timeout returns `ClusterNotStable`; callers log it and proceed with
    /// [`Self::view`].
    pub async fn wait_for_stable(
        &self,
        expected: usize,
        timeout: Duration,
        poll: Duration,
    ) -> Result<MembershipView> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut last_version = None;
        loop {
            let view = self.heartbeat().await?;
            let settled = if expected > 0 {
                view.len() >= expected
            } else {
                last_version == Some(view.version)
            };
            if settled {
                return Ok(view);
            }
            last_version = Some(view.version);

            if tokio::time::Instant::now() + poll > deadline {
                return Err(GalleryError::ClusterNotStable(format!(
                    "{} of {} expected members after {}s",
                    view.len(),
                    expected,
                    timeout.as_secs()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }
}
