//! Application startup and bootstrap logic.
//!
//! Kept out of `main.rs` so the whole wiring can be exercised from tests
//! with the in-memory coordination backend.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cluster::{heartbeat_loop, LeaseManager, MembershipRegistry};
use crate::config::{Config, HostProfile};
use crate::index::TemplateStore;
use crate::loader::{source, BulkLoader, LoaderSettings, MemoryGovernor, ProcessMemoryProbe};
use crate::search::SearchAggregator;
use crate::server::routes::build_router;
use crate::server::AppState;
use crate::storage::CoordinationStore;
use crate::types::LoadRequest;

/// Resolve the configuration file path.
///
/// Priority:
/// 1. `GALLERY_CONFIG` environment variable
/// 2. `./gallery.toml` if it exists
/// 3. None (use defaults)
pub fn resolve_config_path() -> Option<String> {
    std::env::var("GALLERY_CONFIG").ok().or_else(|| {
        let default = "gallery.toml";
        std::path::Path::new(default)
            .exists()
            .then(|| default.to_string())
    })
}

/// Initialize tracing subscriber from logging config.
///
/// `RUST_LOG` wins over `logging.level` when set.
pub fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        _ => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Build the application router and spawn background tasks.
///
/// Joins the cluster, starts the heartbeat and memory governor loops, and
/// optionally kicks off a bulk load. Returns the router and the sender that
/// stops the background loops.
pub async fn build_app(
    config: Config,
) -> Result<(Router, watch::Sender<bool>), Box<dyn std::error::Error>> {
    info!("gallery starting");

    let profile = HostProfile::detect(&config);
    info!(
        cpu_cores = profile.cpu_cores,
        memory_limit_mb = profile.memory_limit_bytes / (1024 * 1024),
        scan_workers = profile.scan_workers,
        batch_size = profile.batch_size,
        progress_interval = profile.progress_interval,
        "host profile detected"
    );
    info!(
        host = %config.server.host,
        port = config.server.port,
        cluster = %config.cluster.name,
        node_id = %config.cluster.node_id,
        coordination = %config.coordination.backend,
        partitions = config.index.partition_count,
        load_mode = %config.loader.mode,
        "configuration loaded"
    );

    crate::metrics::init();

    let coordination = CoordinationStore::from_config(&config.coordination)?;
    let store = TemplateStore::shared(config.index.partition_count, config.index.max_entries);

    let membership = Arc::new(MembershipRegistry::new(
        coordination.clone(),
        &config.cluster,
        config.server.advertised(),
    ));
    let view = membership.heartbeat().await?;
    info!(members = view.len(), address = %membership.address(), "joined cluster");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(heartbeat_loop(
        Arc::clone(&membership),
        Duration::from_secs(config.cluster.heartbeat_interval_secs),
        shutdown_rx.clone(),
    ));

    let governor = Arc::new(MemoryGovernor::new(
        &config.governor,
        &profile,
        Arc::new(ProcessMemoryProbe),
        Some(Arc::clone(&store)),
    ));
    let pressure = governor.subscribe();
    tokio::spawn(governor.run(shutdown_rx));

    let aggregator = Arc::new(SearchAggregator::new(
        Arc::clone(&store),
        &profile,
        &config.search,
        Some(Arc::clone(&membership)),
    )?);

    let leases = LeaseManager::new(
        coordination.clone(),
        config.cluster.name.clone(),
        config.cluster.node_id.clone(),
        Duration::from_secs(config.cluster.lease_duration_secs),
    );
    let rows = source::from_config(&config.source);
    match &rows {
        Some(rows) => info!(source = %rows.describe(), "backing store configured"),
        None => info!("no backing store configured, bulk load disabled"),
    }
    let loader = Arc::new(BulkLoader::new(
        Arc::clone(&store),
        rows,
        leases,
        Arc::clone(&membership),
        pressure,
        LoaderSettings::new(&config, &profile),
    ));

    if config.loader.load_on_startup {
        let loader = Arc::clone(&loader);
        tokio::spawn(async move {
            match loader.load(LoadRequest::default()).await {
                Ok(result) => info!(
                    success = result.success,
                    message = %result.message,
                    "startup load finished"
                ),
                Err(e) => warn!(error = %e, "startup load rejected"),
            }
        });
    }

    let search_semaphore = Arc::new(Semaphore::new(config.server.max_concurrent_searches));
    let state = AppState {
        config: Arc::new(config),
        store,
        aggregator,
        loader,
        membership,
        coordination,
        search_semaphore,
    };

    Ok((build_router(state), shutdown_tx))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageBackend;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.coordination.backend = StorageBackend::Memory;
        config.cluster.name = format!("startup-{}", uuid::Uuid::new_v4());
        config
    }

    #[test]
    fn test_resolve_config_path_from_env() {
        let original = std::env::var("GALLERY_CONFIG").ok();

        std::env::set_var("GALLERY_CONFIG", "foo.toml");
        let path = resolve_config_path();

        match original {
            Some(v) => std::env::set_var("GALLERY_CONFIG", v),
            None => std::env::remove_var("GALLERY_CONFIG"),
        }

        assert_eq!(path, Some("foo.toml".to_string()));
    }

    #[tokio::test]
    async fn test_build_app_memory_coordination() {
        let (_router, shutdown_tx) = build_app(test_config()).await.unwrap();
        let _ = shutdown_tx.send(true);
    }

    #[tokio::test]
    async fn test_build_app_local_coordination() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.coordination.backend = StorageBackend::Local;
        config.coordination.bucket = tmp.path().to_string_lossy().to_string();

        let (router, shutdown_tx) = build_app(config).await.unwrap();
        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(router);
    }
}
