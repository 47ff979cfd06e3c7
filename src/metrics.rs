use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge,
};

lazy_static::lazy_static! {
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gallery_http_requests_total", "Total HTTP requests", &["method", "path", "status"]
    ).unwrap();

    // Search
    pub static ref SEARCH_DURATION: HistogramVec = register_histogram_vec!(
        "gallery_search_duration_seconds", "Search duration", &["scope"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
    pub static ref SEARCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gallery_searches_total", "Total searches", &["outcome"]
    ).unwrap();
    pub static ref ACTIVE_SEARCHES: IntGauge = register_int_gauge!(
        "gallery_active_searches", "Number of in-flight searches"
    ).unwrap();
    pub static ref CANDIDATES_SCANNED_TOTAL: IntCounter = register_int_counter!(
        "gallery_candidates_scanned_total", "Templates visited by partition scans"
    ).unwrap();
    pub static ref PREFILTER_REJECTIONS_TOTAL: IntCounter = register_int_counter!(
        "gallery_prefilter_rejections_total", "Candidates rejected by the signature prefilter"
    ).unwrap();
    pub static ref PEER_SCAN_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gallery_peer_scan_retries_total", "Retried scans of a peer's partitions", &["peer"]
    ).unwrap();

    // Store
    pub static ref STORED_TEMPLATES: IntGauge = register_int_gauge!(
        "gallery_stored_templates", "Templates held by this node"
    ).unwrap();
    pub static ref STORE_EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        "gallery_store_evictions_total", "Templates evicted at the entry ceiling"
    ).unwrap();

    // Loader
    pub static ref LOAD_ROWS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gallery_load_rows_total", "Backing-store rows processed", &["outcome"]
    ).unwrap();
    pub static ref LOAD_DURATION: Histogram = register_histogram!(
        "gallery_load_duration_seconds", "Bulk load duration",
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0]
    ).unwrap();
    pub static ref MEMORY_PRESSURE_LEVEL: IntGauge = register_int_gauge!(
        "gallery_memory_pressure_level", "Memory pressure: 0 normal, 1 slow, 2 critical"
    ).unwrap();

    // Coordination storage
    pub static ref COORDINATION_OPERATION_DURATION: HistogramVec = register_histogram_vec!(
        "gallery_coordination_operation_duration_seconds", "Coordination store operation latency",
        &["operation"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();
    pub static ref COORDINATION_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gallery_coordination_errors_total", "Coordination store errors", &["operation"]
    ).unwrap();
}

/// RAII guard that decrements an IntGauge on drop.
pub struct GaugeGuard<'a>(pub &'a IntGauge);

impl<'a> GaugeGuard<'a> {
    pub fn inc(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.0.dec();
    }
}

pub fn init() {
    lazy_static::initialize(&HTTP_REQUESTS_TOTAL);
    lazy_static::initialize(&SEARCH_DURATION);
    lazy_static::initialize(&SEARCHES_TOTAL);
    lazy_static::initialize(&ACTIVE_SEARCHES);
    lazy_static::initialize(&CANDIDATES_SCANNED_TOTAL);
    lazy_static::initialize(&PREFILTER_REJECTIONS_TOTAL);
    lazy_static::initialize(&PEER_SCAN_RETRIES_TOTAL);
    lazy_static::initialize(&STORED_TEMPLATES);
    lazy_static::initialize(&STORE_EVICTIONS_TOTAL);
    lazy_static::initialize(&LOAD_ROWS_TOTAL);
    lazy_static::initialize(&LOAD_DURATION);
    lazy_static::initialize(&MEMORY_PRESSURE_LEVEL);
    lazy_static::initialize(&COORDINATION_OPERATION_DURATION);
    lazy_static::initialize(&COORDINATION_ERRORS_TOTAL);
}
