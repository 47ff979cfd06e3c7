pub mod handlers;
pub mod middleware;
pub mod routes;

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::cluster::MembershipRegistry;
use crate::config::Config;
use crate::index::TemplateStore;
use crate::loader::BulkLoader;
use crate::search::SearchAggregator;
use crate::storage::CoordinationStore;

/// Shared application state injected into all handlers via axum's State extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<TemplateStore>,
    pub aggregator: Arc<SearchAggregator>,
    pub loader: Arc<BulkLoader>,
    pub membership: Arc<MembershipRegistry>,
    /// Backend holding membership records and leases.
    pub coordination: CoordinationStore,
    pub search_semaphore: Arc<Semaphore>,
}
