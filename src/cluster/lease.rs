use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{GalleryError, Result};
use crate::storage::CoordinationStore;

/// A lease granting cluster-wide exclusive ownership of a named lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder_id: String,
    /// Monotonically increasing across holders; guards fenced writes.
    pub fencing_token: u64,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) etag: String,
}

/// Written by a lock holder once the guarded work has completed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoneMarker {
    pub name: String,
    pub holder_id: String,
    pub fencing_token: u64,
    pub completed_at: DateTime<Utc>,
}

/// Fenced mutual exclusion over the coordination store.
///
/// Each lock is one object, `{cluster}/locks/{name}.json`. A live lease is
/// never overwritten; an expired one is taken over by CAS with the token
/// incremented, so a stalled former holder's writes can be rejected.
#[derive(Clone)]
pub struct LeaseManager {
    store: CoordinationStore,
    cluster: String,
    holder_id: String,
    lease_duration: Duration,
}

impl LeaseManager {
    pub fn new(
        store: CoordinationStore,
        cluster: impl Into<String>,
        holder_id: impl Into<String>,
        lease_duration: Duration,
    ) -> Self {
        Self {
            store,
            cluster: cluster.into(),
            holder_id: holder_id.into(),
            lease_duration,
        }
    }

    fn lock_key(&self, name: &str) -> String {
        format!("{}/locks/{name}.json", self.cluster)
    }

    fn done_key(&self, name: &str) -> String {
        format!("{}/locks/{name}.done.json", self.cluster)
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Try once.
    ///
    /// - No lease object: create one with `fencing_token = 1`.
    /// - Expired lease: take over with `fencing_token + 1` via CAS.
    /// - Live lease: `LeaseHeld`.
    #[instrument(skip(self), fields(lock = name, holder = %self.holder_id))]
    pub async fn acquire(&self, name: &str) -> Result<Lease> {
        let key = self.lock_key(name);

        match self.store.get_with_meta(&key).await {
            Err(GalleryError::NotFound { .. }) => {
                let lease = self.build_lease(name, 1)?;
                let data = Bytes::from(serde_json::to_vec_pretty(&lease)?);
                self.store
                    .put_if_not_exists(&key, data)
                    .await
                    .map_err(|e| self.race_to_held(name, e))?;
                let lease = self.reload(&key).await?;
                debug!(fencing_token = lease.fencing_token, "lease acquired (new)");
                Ok(lease)
            }
            Ok((data, etag)) => {
                let existing: Lease = serde_json::from_slice(&data)?;
                if existing.expires_at > Utc::now() {
                    return Err(GalleryError::LeaseHeld {
                        name: name.to_string(),
                        holder: existing.holder_id,
                    });
                }

                let lease = self.build_lease(name, existing.fencing_token + 1)?;
                let data = Bytes::from(serde_json::to_vec_pretty(&lease)?);
                self.store
                    .put_if_match(&key, data, &etag.unwrap_or_default())
                    .await
                    .map_err(|e| self.race_to_held(name, e))?;
                let lease = self.reload(&key).await?;
                debug!(fencing_token = lease.fencing_token, "lease acquired (takeover)");
                Ok(lease)
            }
            Err(e) => Err(e),
        }
    }

    /// Poll `acquire` until it succeeds or `timeout` elapses.
    ///
    /// Only `LeaseHeld` is retried; any other error returns immediately.
    pub async fn acquire_within(
        &self,
        name: &str,
        timeout: Duration,
        poll: Duration,
    ) -> Result<Lease> {
        let start = tokio::time::Instant::now();
        let deadline = start + timeout;
        loop {
            match self.acquire(name).await {
                Ok(lease) => return Ok(lease),
                Err(GalleryError::LeaseHeld { holder, .. }) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(GalleryError::LockTimeout {
                            name: name.to_string(),
                            waited_secs: start.elapsed().as_secs(),
                        });
                    }
                    debug!(lock = name, holder = %holder, "lock held, waiting");
                    tokio::time::sleep(poll.min(deadline - now)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extend expiry. Token stays the same.
    ///
    /// Returns `LeaseExpired` if another holder has taken over.
    #[instrument(skip(self, lease), fields(lock = %lease.name, holder = %self.holder_id))]
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let key = self.lock_key(&lease.name);
        let (data, etag) = self.store.get_with_meta(&key).await?;
        let current: Lease = serde_json::from_slice(&data)?;

        if current.holder_id != self.holder_id || current.fencing_token != lease.fencing_token {
            return Err(GalleryError::LeaseExpired {
                name: lease.name.clone(),
            });
        }

        let mut renewed = self.build_lease(&lease.name, lease.fencing_token)?;
        renewed.acquired_at = current.acquired_at;
        let data = Bytes::from(serde_json::to_vec_pretty(&renewed)?);
        self.store
            .put_if_match(&key, data, &etag.unwrap_or_default())
            .await
            .map_err(|e| match e {
                GalleryError::CasConflict { .. } => GalleryError::LeaseExpired {
                    name: lease.name.clone(),
                },
                other => other,
            })?;

        let renewed = self.reload(&key).await?;
        debug!(fencing_token = renewed.fencing_token, "lease renewed");
        Ok(renewed)
    }

    /// Best-effort release. Never blocks and never fails: a lease already
    /// taken over, or a store error, is logged and ignored.
    #[instrument(skip(self, lease), fields(lock = %lease.name, holder = %self.holder_id))]
    pub async fn release(&self, lease: &Lease) {
        let key = self.lock_key(&lease.name);

        let (data, etag) = match self.store.get_with_meta(&key).await {
            Ok(found) => found,
            Err(GalleryError::NotFound { .. }) => return,
            Err(e) => {
                warn!(error = %e, "failed to read lease for release");
                return;
            }
        };
        let current: Lease = match serde_json::from_slice(&data) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "unreadable lease on release");
                return;
            }
        };
        if current.holder_id != self.holder_id || current.fencing_token != lease.fencing_token {
            debug!("lease already taken over, skipping release");
            return;
        }

        // Expire in place; keeping the token means the next holder increments from it.
        let mut released = current;
        released.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let body = match serde_json::to_vec_pretty(&released) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                warn!(error = %e, "failed to encode released lease");
                return;
            }
        };
        match self
            .store
            .put_if_match(&key, body, &etag.unwrap_or_default())
            .await
        {
            Ok(()) => info!(fencing_token = lease.fencing_token, "lease released"),
            Err(e) => warn!(error = %e, "lease release failed (best-effort)"),
        }
    }

    /// Held by us and not expired by wall clock.
    pub fn validate(&self, lease: &Lease) -> bool {
        lease.expires_at > Utc::now() && lease.holder_id == self.holder_id
    }

    /// Keep `lease` alive in the background until the keeper is stopped.
    pub fn keep_alive(&self, lease: Lease) -> LeaseKeeper {
        let manager = self.clone();
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        let interval = (self.lease_duration / 3).max(Duration::from_millis(50));
        let task = tokio::spawn(async move {
            let mut current = lease;
            loop {
                tokio::time::sleep(interval).await;
                match manager.renew(&current).await {
                    Ok(renewed) => current = renewed,
                    Err(GalleryError::LeaseExpired { .. }) => {
                        error!(lock = %current.name, "lease lost to another holder");
                        lost_flag.store(true, Ordering::Release);
                        break;
                    }
                    Err(e) => warn!(lock = %current.name, error = %e, "lease renewal failed"),
                }
            }
        });
        LeaseKeeper { task, lost }
    }

    /// Record that the holder of `lease` finished the work the lock guards.
    ///
    /// Rejected with `LeaseExpired` if the lease was taken over meanwhile, so a
    /// stalled former holder cannot claim completion.
    #[instrument(skip(self, lease), fields(lock = %lease.name, holder = %self.holder_id))]
    pub async fn mark_done(&self, lease: &Lease) -> Result<()> {
        let (data, _) = self.store.get_with_meta(&self.lock_key(&lease.name)).await?;
        let current: Lease = serde_json::from_slice(&data)?;
        if current.holder_id != self.holder_id || current.fencing_token != lease.fencing_token {
            return Err(GalleryError::LeaseExpired {
                name: lease.name.clone(),
            });
        }
        let marker = DoneMarker {
            name: lease.name.clone(),
            holder_id: self.holder_id.clone(),
            fencing_token: lease.fencing_token,
            completed_at: Utc::now(),
        };
        let data = Bytes::from(serde_json::to_vec_pretty(&marker)?);
        self.store.put(&self.done_key(&lease.name), data).await?;
        info!(fencing_token = lease.fencing_token, "completion recorded");
        Ok(())
    }

    /// The completion marker for `name`, if any.
    pub async fn done_marker(&self, name: &str) -> Result<Option<DoneMarker>> {
        match self.store.get(&self.done_key(name)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(GalleryError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Drop the completion marker. Only meaningful while holding `lease`.
    pub async fn clear_done(&self, lease: &Lease) -> Result<()> {
        self.store.delete(&self.done_key(&lease.name)).await
    }

    fn build_lease(&self, name: &str, fencing_token: u64) -> Result<Lease> {
        let now = Utc::now();
        let duration = chrono::Duration::from_std(self.lease_duration)
            .map_err(|e| GalleryError::Config(format!("lease duration out of range: {e}")))?;
        Ok(Lease {
            name: name.to_string(),
            holder_id: self.holder_id.clone(),
            fencing_token,
            acquired_at: now,
            expires_at: now + duration,
            etag: String::new(),
        })
    }

    /// Re-read to capture the ETag for the next CAS.
    async fn reload(&self, key: &str) -> Result<Lease> {
        let (data, etag) = self.store.get_with_meta(key).await?;
        let mut lease: Lease = serde_json::from_slice(&data)?;
        lease.etag = etag.unwrap_or_default();
        Ok(lease)
    }

    fn race_to_held(&self, name: &str, e: GalleryError) -> GalleryError {
        match e {
            GalleryError::CasConflict { .. } => GalleryError::LeaseHeld {
                name: name.to_string(),
                holder: "unknown (race)".to_string(),
            },
            other => other,
        }
    }
}

/// Background renewal for a held lease. Dropping it stops renewal.
pub struct LeaseKeeper {
    task: JoinHandle<()>,
    lost: Arc<AtomicBool>,
}

impl LeaseKeeper {
    /// True once renewal found the lease taken over.
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

impl Drop for LeaseKeeper {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn manager(store: &CoordinationStore, holder: &str, secs: u64) -> LeaseManager {
        LeaseManager::new(store.clone(), "test", holder, Duration::from_secs(secs))
    }

    #[tokio::test]
    async fn test_first_acquire_gets_token_one() {
        let store = CoordinationStore::in_memory();
        let lease = manager(&store, "a", 60).acquire("load").await.unwrap();
        assert_eq!(lease.fencing_token, 1);
        assert_eq!(lease.holder_id, "a");
        assert!(!lease.etag.is_empty());
    }

    #[tokio::test]
    async fn test_live_lease_is_exclusive() {
        let store = CoordinationStore::in_memory();
        manager(&store, "a", 60).acquire("load").await.unwrap();
        let err = manager(&store, "b", 60).acquire("load").await.unwrap_err();
        assert!(matches!(err, GalleryError::LeaseHeld { holder, .. } if holder == "a"));
    }

    #[tokio::test]
    async fn test_release_then_acquire_increments_token() {
        let store = CoordinationStore::in_memory();
        let a = manager(&store, "a", 60);
        let lease = a.acquire("load").await.unwrap();
        a.release(&lease).await;

        let next = manager(&store, "b", 60).acquire("load").await.unwrap();
        assert_eq!(next.fencing_token, 2);
    }

    #[tokio::test]
    async fn test_renew_keeps_token_and_detects_takeover() {
        let store = CoordinationStore::in_memory();
        let a = manager(&store, "a", 60);
        let lease = a.acquire("load").await.unwrap();
        let renewed = a.renew(&lease).await.unwrap();
        assert_eq!(renewed.fencing_token, lease.fencing_token);
        assert!(renewed.expires_at >= lease.expires_at);

        // Force expiry and let "b" take over.
        a.release(&renewed).await;
        manager(&store, "b", 60).acquire("load").await.unwrap();
        assert!(matches!(
            a.renew(&renewed).await,
            Err(GalleryError::LeaseExpired { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_release_is_ignored() {
        let store = CoordinationStore::in_memory();
        let a = manager(&store, "a", 60);
        let first = a.acquire("load").await.unwrap();
        a.release(&first).await;
        let b = manager(&store, "b", 60);
        let second = b.acquire("load").await.unwrap();

        // "a" releasing its old lease must not free "b"'s lock.
        a.release(&first).await;
        assert!(manager(&store, "c", 60).acquire("load").await.is_err());
        assert!(b.validate(&second));
    }

    #[tokio::test]
    async fn test_acquire_within_times_out() {
        let store = CoordinationStore::in_memory();
        manager(&store, "a", 60).acquire("load").await.unwrap();
        let err = manager(&store, "b", 60)
            .acquire_within("load", Duration::from_millis(60), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, GalleryError::LockTimeout { .. }));
    }

    #[tokio::test]
    async fn test_acquire_within_waits_for_expiry() {
        let store = CoordinationStore::in_memory();
        let short = LeaseManager::new(store.clone(), "test", "a", Duration::from_millis(100));
        short.acquire("load").await.unwrap();
        let lease = manager(&store, "b", 60)
            .acquire_within("load", Duration::from_secs(2), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(lease.holder_id, "b");
        assert_eq!(lease.fencing_token, 2);
    }

    #[tokio::test]
    async fn test_done_marker_lifecycle() {
        let store = CoordinationStore::in_memory();
        let a = manager(&store, "a", 60);
        assert_eq!(a.done_marker("load").await.unwrap(), None);

        let lease = a.acquire("load").await.unwrap();
        a.mark_done(&lease).await.unwrap();
        a.release(&lease).await;

        let b = manager(&store, "b", 60);
        let marker = b.done_marker("load").await.unwrap().unwrap();
        assert_eq!(marker.holder_id, "a");
        assert_eq!(marker.fencing_token, lease.fencing_token);

        let next = b.acquire("load").await.unwrap();
        b.clear_done(&next).await.unwrap();
        assert_eq!(b.done_marker("load").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_taken_over_holder_cannot_mark_done() {
        let store = CoordinationStore::in_memory();
        let a = manager(&store, "a", 60);
        let stale = a.acquire("load").await.unwrap();
        a.release(&stale).await;
        manager(&store, "b", 60).acquire("load").await.unwrap();

        assert!(matches!(
            a.mark_done(&stale).await,
            Err(GalleryError::LeaseExpired { .. })
        ));
        assert_eq!(a.done_marker("load").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_keep_alive_extends_short_lease() {
        let store = CoordinationStore::in_memory();
        let a = LeaseManager::new(store.clone(), "test", "a", Duration::from_millis(300));
        let lease = a.acquire("load").await.unwrap();
        let keeper = a.keep_alive(lease);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!keeper.is_lost());
        assert!(manager(&store, "b", 60).acquire("load").await.is_err());
        drop(keeper);
    }
}
