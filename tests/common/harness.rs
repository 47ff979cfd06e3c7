use std::time::Duration;

use uuid::Uuid;

use gallery::cluster::{LeaseManager, MembershipRegistry};
use gallery::config::Config;
use gallery::storage::CoordinationStore;

/// Shared in-memory coordination backend with a cluster name unique to the
/// test, so concurrent tests never see each other's members or locks.
pub struct TestHarness {
    pub coordination: CoordinationStore,
    pub cluster: String,
}

impl TestHarness {
    pub fn new() -> Self {
        Self {
            coordination: CoordinationStore::in_memory(),
            cluster: format!("test-{}", Uuid::new_v4()),
        }
    }

    /// Defaults tuned for tests: short timeouts, small batches.
    pub fn config(&self, node_id: &str) -> Config {
        let mut config = Config::default();
        config.cluster.name = self.cluster.clone();
        config.cluster.node_id = node_id.to_string();
        config.cluster.lock_poll_interval_ms = 20;
        config.cluster.stabilization_timeout_secs = 1;
        config.cluster.heartbeat_interval_secs = 1;
        config.cluster.lease_duration_secs = 30;
        config.loader.lock_timeout_secs = 1;
        config.loader.batch_size = 64;
        config.loader.progress_interval = 1000;
        config.index.partition_count = 31;
        config.search.peer_max_attempts = 2;
        config.search.peer_timeout_ms = 1000;
        config.search.scan_workers = 2;
        config
    }

    pub fn leases(&self, holder: &str) -> LeaseManager {
        LeaseManager::new(
            self.coordination.clone(),
            self.cluster.clone(),
            holder,
            Duration::from_secs(30),
        )
    }

    pub fn membership(&self, config: &Config, address: &str) -> MembershipRegistry {
        MembershipRegistry::new(
            self.coordination.clone(),
            &config.cluster,
            address.to_string(),
        )
    }
}
