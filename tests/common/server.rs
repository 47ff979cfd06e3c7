use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};

use super::harness::TestHarness;

use gallery::cluster::MembershipRegistry;
use gallery::config::{Config, HostProfile};
use gallery::index::TemplateStore;
use gallery::loader::{BulkLoader, LoaderSettings, Pressure, RowSource};
use gallery::search::SearchAggregator;
use gallery::server::routes::build_router;
use gallery::server::AppState;

/// One in-process node bound to `127.0.0.1:0`.
pub struct TestNode {
    pub base_url: String,
    pub state: AppState,
    /// Kept so the loader's pressure channel stays open.
    pub pressure: watch::Sender<Pressure>,
}

impl TestNode {
    pub fn store(&self) -> &Arc<TemplateStore> {
        &self.state.store
    }

    pub fn membership(&self) -> &Arc<MembershipRegistry> {
        &self.state.membership
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Start a node that joins `harness`'s cluster. Heartbeats once; call
/// [`refresh_all`] after starting every node so each sees the others.
pub async fn start_node(
    harness: &TestHarness,
    config: Config,
    source: Option<Arc<dyn RowSource>>,
) -> TestNode {
    gallery::metrics::init();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base_url = format!("http://{addr}");

    let profile = HostProfile::detect(&config);
    let store = TemplateStore::shared(config.index.partition_count, config.index.max_entries);
    let membership = Arc::new(harness.membership(&config, &base_url));
    membership.heartbeat().await.unwrap();

    let aggregator = Arc::new(
        SearchAggregator::new(
            Arc::clone(&store),
            &profile,
            &config.search,
            Some(Arc::clone(&membership)),
        )
        .unwrap(),
    );
    let (pressure, pressure_rx) = watch::channel(Pressure::Normal);
    let loader = Arc::new(BulkLoader::new(
        Arc::clone(&store),
        source,
        harness.leases(&config.cluster.node_id),
        Arc::clone(&membership),
        pressure_rx,
        LoaderSettings::new(&config, &profile),
    ));

    let state = AppState {
        search_semaphore: Arc::new(Semaphore::new(config.server.max_concurrent_searches)),
        config: Arc::new(config),
        store,
        aggregator,
        loader,
        membership,
        coordination: harness.coordination.clone(),
    };

    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestNode {
        base_url,
        state,
        pressure,
    }
}

/// Start a single node with default test config.
pub async fn start_test_server() -> (TestNode, TestHarness) {
    let harness = TestHarness::new();
    let node = start_node(&harness, harness.config("node-0"), None).await;
    (node, harness)
}

pub async fn refresh_all(nodes: &[&TestNode]) {
    for node in nodes {
        node.membership().refresh().await.unwrap();
    }
}
