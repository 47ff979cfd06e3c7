use crate::error::{GalleryError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub coordination: StorageConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub loader: LoaderConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Address other members use to reach this node. Defaults to `http://{host}:{port}`.
    #[serde(default)]
    pub advertise_address: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_searches")]
    pub max_concurrent_searches: usize,
    #[serde(default = "default_max_enroll_batch")]
    pub max_enroll_batch: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
    #[serde(default = "default_max_request_body_mb")]
    pub max_request_body_mb: usize,
}

/// Object-store backend holding cluster coordination state (membership and locks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Local,
    S3,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Memory => write!(f, "memory"),
            StorageBackend::Local => write!(f, "local"),
            StorageBackend::S3 => write!(f, "s3"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = GalleryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(StorageBackend::Memory),
            "local" => Ok(StorageBackend::Local),
            "s3" => Ok(StorageBackend::S3),
            other => Err(GalleryError::Config(format!(
                "unknown coordination backend: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    #[serde(default = "default_bucket")]
    pub bucket: String,

    // S3 / MinIO / R2
    #[serde(default)]
    pub s3_region: Option<String>,
    #[serde(default)]
    pub s3_endpoint: Option<String>,
    #[serde(default)]
    pub s3_access_key_id: Option<String>,
    #[serde(default)]
    pub s3_secret_access_key: Option<String>,
    #[serde(default)]
    pub s3_allow_http: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_cluster_name")]
    pub name: String,
    /// Stable identity of this node. Generated when absent.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_member_ttl")]
    pub member_ttl_secs: u64,
    /// Cluster size the sharded loader waits for. 0 means "wait out the grace period".
    #[serde(default)]
    pub expected_members: usize,
    #[serde(default = "default_stabilization_timeout")]
    pub stabilization_timeout_secs: u64,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_lock_poll_interval")]
    pub lock_poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_partition_count")]
    pub partition_count: usize,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Maximum Hamming distance for the signature prefilter. Values above 128
    /// never reject a candidate.
    #[serde(default = "default_hamming_bound")]
    pub hamming_bound: u32,
    /// Score at or above which a result is reported as `matched`.
    #[serde(default = "default_match_threshold")]
    pub match_threshold: f32,
    #[serde(default = "default_max_top_n")]
    pub max_top_n: usize,
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
    #[serde(default = "default_peer_max_attempts")]
    pub peer_max_attempts: usize,
    /// Scan worker threads. 0 derives the count from the host.
    #[serde(default)]
    pub scan_workers: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// One node wins the cluster lock and loads everything.
    #[default]
    SingleLeader,
    /// Every node loads the disjoint shard derived from its membership position.
    Sharded,
}

impl std::fmt::Display for LoadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadMode::SingleLeader => write!(f, "single_leader"),
            LoadMode::Sharded => write!(f, "sharded"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    #[serde(default)]
    pub mode: LoadMode,
    #[serde(default)]
    pub load_on_startup: bool,
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_group_chunk_size")]
    pub group_chunk_size: usize,
    /// Insert batch size. 0 derives it from the host.
    #[serde(default)]
    pub batch_size: usize,
    /// Inserts between progress log lines. 0 derives it from the host.
    #[serde(default)]
    pub progress_interval: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    #[serde(default = "default_slow_threshold_pct")]
    pub slow_threshold_pct: f64,
    #[serde(default = "default_critical_threshold_pct")]
    pub critical_threshold_pct: f64,
    /// Memory ceiling in MiB. 0 derives it from total system memory.
    #[serde(default)]
    pub memory_limit_mb: u64,
    #[serde(default = "default_slow_delay_ms")]
    pub slow_delay_ms: u64,
    #[serde(default = "default_critical_delay_ms")]
    pub critical_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// No backing store configured; loads are rejected.
    None,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_source_kind")]
    pub kind: SourceKind,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    /// Must yield `(id, owner_id, feature)` columns.
    #[serde(default = "default_template_query")]
    pub template_query: String,
    /// Must yield `(owner_id, group_id)` columns.
    #[serde(default = "default_group_query")]
    pub group_query: String,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

// Default value functions
fn default_host() -> String {
    std::env::var("GALLERY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}
fn default_port() -> u16 {
    env_parse("GALLERY_PORT").unwrap_or(8080)
}
fn default_request_timeout() -> u64 {
    env_parse("GALLERY_REQUEST_TIMEOUT_SECS").unwrap_or(30)
}
fn default_max_concurrent_searches() -> usize {
    env_parse("GALLERY_MAX_CONCURRENT_SEARCHES").unwrap_or(64)
}
fn default_max_enroll_batch() -> usize {
    10_000
}
fn default_shutdown_timeout_secs() -> u64 {
    env_parse("GALLERY_SHUTDOWN_TIMEOUT_SECS").unwrap_or(5)
}
fn default_max_request_body_mb() -> usize {
    env_parse("GALLERY_MAX_REQUEST_BODY_MB").unwrap_or(50)
}
fn default_backend() -> StorageBackend {
    env_parse("GALLERY_COORDINATION_BACKEND").unwrap_or(StorageBackend::Memory)
}
fn default_bucket() -> String {
    std::env::var("GALLERY_COORDINATION_BUCKET").unwrap_or_else(|_| "gallery".to_string())
}
fn default_cluster_name() -> String {
    std::env::var("GALLERY_CLUSTER_NAME").unwrap_or_else(|_| "gallery".to_string())
}
fn default_node_id() -> String {
    std::env::var("GALLERY_NODE_ID").unwrap_or_else(|_| format!("node-{}", uuid::Uuid::new_v4()))
}
fn default_heartbeat_interval() -> u64 {
    5
}
fn default_member_ttl() -> u64 {
    15
}
fn default_stabilization_timeout() -> u64 {
    30
}
fn default_lease_duration() -> u64 {
    60
}
fn default_lock_poll_interval() -> u64 {
    1000
}
fn default_partition_count() -> usize {
    271
}
fn default_max_entries() -> usize {
    100_000_000
}
fn default_hamming_bound() -> u32 {
    283
}
fn default_match_threshold() -> f32 {
    0.8
}
fn default_max_top_n() -> usize {
    100
}
fn default_peer_timeout_ms() -> u64 {
    5000
}
fn default_peer_max_attempts() -> usize {
    3
}
fn default_lock_name() -> String {
    "bulk-load".to_string()
}
fn default_lock_timeout() -> u64 {
    300
}
fn default_group_chunk_size() -> usize {
    10_000
}
fn default_sample_interval_ms() -> u64 {
    1000
}
fn default_slow_threshold_pct() -> f64 {
    80.0
}
fn default_critical_threshold_pct() -> f64 {
    85.0
}
fn default_slow_delay_ms() -> u64 {
    50
}
fn default_critical_delay_ms() -> u64 {
    250
}
fn default_source_kind() -> SourceKind {
    SourceKind::None
}
fn default_template_query() -> String {
    "SELECT id, owner_id, feature FROM templates".to_string()
}
fn default_group_query() -> String {
    "SELECT owner_id, group_id FROM group_members".to_string()
}
fn default_channel_capacity() -> usize {
    4096
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    std::env::var("GALLERY_LOG_FORMAT").unwrap_or_else(|_| "json".to_string())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            advertise_address: std::env::var("GALLERY_ADVERTISE_ADDRESS").ok(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_searches: default_max_concurrent_searches(),
            max_enroll_batch: default_max_enroll_batch(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            max_request_body_mb: default_max_request_body_mb(),
        }
    }
}

impl ServerConfig {
    /// Address published in this node's membership record.
    pub fn advertised(&self) -> String {
        self.advertise_address
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.host, self.port))
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            bucket: default_bucket(),
            s3_region: std::env::var("AWS_REGION").ok(),
            s3_endpoint: std::env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()),
            s3_access_key_id: std::env::var("AWS_ACCESS_KEY_ID").ok(),
            s3_secret_access_key: std::env::var("AWS_SECRET_ACCESS_KEY").ok(),
            s3_allow_http: std::env::var("S3_ALLOW_HTTP")
                .ok()
                .map(|v| v == "true")
                .unwrap_or(false),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            node_id: default_node_id(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            member_ttl_secs: default_member_ttl(),
            expected_members: env_parse("GALLERY_EXPECTED_MEMBERS").unwrap_or(0),
            stabilization_timeout_secs: default_stabilization_timeout(),
            lease_duration_secs: default_lease_duration(),
            lock_poll_interval_ms: default_lock_poll_interval(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            partition_count: default_partition_count(),
            max_entries: default_max_entries(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            hamming_bound: default_hamming_bound(),
            match_threshold: default_match_threshold(),
            max_top_n: default_max_top_n(),
            peer_timeout_ms: default_peer_timeout_ms(),
            peer_max_attempts: default_peer_max_attempts(),
            scan_workers: 0,
        }
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            mode: LoadMode::default(),
            load_on_startup: false,
            lock_name: default_lock_name(),
            lock_timeout_secs: default_lock_timeout(),
            group_chunk_size: default_group_chunk_size(),
            batch_size: 0,
            progress_interval: 0,
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            slow_threshold_pct: default_slow_threshold_pct(),
            critical_threshold_pct: default_critical_threshold_pct(),
            memory_limit_mb: 0,
            slow_delay_ms: default_slow_delay_ms(),
            critical_delay_ms: default_critical_delay_ms(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: default_source_kind(),
            sqlite_path: None,
            template_query: default_template_query(),
            group_query: default_group_query(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load config from a TOML file, falling back to defaults.
    /// After loading, env var overrides are applied so that:
    /// env var > TOML file > defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p).map_err(|e| {
                    GalleryError::Config(format!("failed to read config file {p}: {e}"))
                })?;
                toml::from_str(&content)
                    .map_err(|e| GalleryError::Config(format!("failed to parse config: {e}")))?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(v) = std::env::var("GALLERY_HOST") {
            self.server.host = v;
        }
        if let Some(v) = env_parse("GALLERY_PORT") {
            self.server.port = v;
        }
        if let Ok(v) = std::env::var("GALLERY_ADVERTISE_ADDRESS") {
            self.server.advertise_address = Some(v);
        }
        if let Some(v) = env_parse("GALLERY_REQUEST_TIMEOUT_SECS") {
            self.server.request_timeout_secs = v;
        }
        if let Some(v) = env_parse("GALLERY_MAX_CONCURRENT_SEARCHES") {
            self.server.max_concurrent_searches = v;
        }

        // Coordination
        if let Some(v) = env_parse("GALLERY_COORDINATION_BACKEND") {
            self.coordination.backend = v;
        }
        if let Ok(v) = std::env::var("GALLERY_COORDINATION_BUCKET") {
            self.coordination.bucket = v;
        }
        if let Some(v) = std::env::var("S3_ENDPOINT").ok().filter(|s| !s.is_empty()) {
            self.coordination.s3_endpoint = Some(v);
        }

        // Cluster
        if let Ok(v) = std::env::var("GALLERY_CLUSTER_NAME") {
            self.cluster.name = v;
        }
        if let Ok(v) = std::env::var("GALLERY_NODE_ID") {
            self.cluster.node_id = v;
        }
        if let Some(v) = env_parse("GALLERY_EXPECTED_MEMBERS") {
            self.cluster.expected_members = v;
        }

        // Search
        if let Some(v) = env_parse("GALLERY_HAMMING_BOUND") {
            self.search.hamming_bound = v;
        }

        // Loader
        if let Ok(v) = std::env::var("GALLERY_LOAD_MODE") {
            match v.as_str() {
                "sharded" => self.loader.mode = LoadMode::Sharded,
                "single_leader" => self.loader.mode = LoadMode::SingleLeader,
                other => tracing::warn!(value = other, "ignoring unknown GALLERY_LOAD_MODE"),
            }
        }
        if let Ok(v) = std::env::var("GALLERY_LOAD_ON_STARTUP") {
            self.loader.load_on_startup = v == "true";
        }

        // Source
        if let Ok(v) = std::env::var("GALLERY_SQLITE_PATH") {
            self.source.kind = SourceKind::Sqlite;
            self.source.sqlite_path = Some(PathBuf::from(v));
        }

        // Logging
        if let Ok(v) = std::env::var("GALLERY_LOG_FORMAT") {
            self.logging.format = v;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.index.partition_count == 0 {
            return Err(GalleryError::Config("index.partition_count must be > 0".into()));
        }
        if self.search.max_top_n == 0 || self.search.max_top_n > 100 {
            return Err(GalleryError::Config(
                "search.max_top_n must be in 1..=100".into(),
            ));
        }
        if self.governor.slow_threshold_pct > self.governor.critical_threshold_pct {
            return Err(GalleryError::Config(
                "governor.slow_threshold_pct must not exceed critical_threshold_pct".into(),
            ));
        }
        if self.source.kind == SourceKind::Sqlite && self.source.sqlite_path.is_none() {
            return Err(GalleryError::Config(
                "source.sqlite_path is required for the sqlite source".into(),
            ));
        }
        Ok(())
    }
}

/// Tuning derived once at startup from the host's CPU count and memory ceiling.
///
/// Passed explicitly to the loader and the search aggregator; nothing deeper
/// in the crate inspects the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostProfile {
    pub cpu_cores: usize,
    pub memory_limit_bytes: u64,
    pub scan_workers: usize,
    pub batch_size: usize,
    pub progress_interval: usize,
}

const MIB: u64 = 1024 * 1024;
const FALLBACK_MEMORY_BYTES: u64 = 4096 * MIB;

impl HostProfile {
    pub fn detect(config: &Config) -> Self {
        let memory_limit_bytes = if config.governor.memory_limit_mb > 0 {
            config.governor.memory_limit_mb * MIB
        } else {
            system_memory_bytes().unwrap_or(FALLBACK_MEMORY_BYTES)
        };
        let mut profile = Self::derive(num_cpus::get(), memory_limit_bytes);
        if config.search.scan_workers > 0 {
            profile.scan_workers = config.search.scan_workers;
        }
        if config.loader.batch_size > 0 {
            profile.batch_size = config.loader.batch_size;
        }
        if config.loader.progress_interval > 0 {
            profile.progress_interval = config.loader.progress_interval;
        }
        profile
    }

    /// Pure sizing rule, kept separate from detection so it can be tested.
    pub fn derive(cpu_cores: usize, memory_limit_bytes: u64) -> Self {
        let cpu_cores = cpu_cores.max(1);
        let mut batch_size = (cpu_cores * 250).clamp(500, 3000);
        // Small heaps get the lower end of the range.
        if memory_limit_bytes < 2048 * MIB {
            batch_size = 500;
        } else if memory_limit_bytes < 8192 * MIB {
            batch_size = batch_size.min(1500);
        }
        let progress_interval = (batch_size * 20).clamp(10_000, 100_000);
        Self {
            cpu_cores,
            memory_limit_bytes,
            scan_workers: cpu_cores,
            batch_size,
            progress_interval,
        }
    }
}

/// cgroup v2 and v1 memory limit files, in lookup order.
const CGROUP_LIMIT_FILES: [&str; 2] = [
    "/sys/fs/cgroup/memory.max",
    "/sys/fs/cgroup/memory/memory.limit_in_bytes",
];

/// Memory available to this process: the smaller of physical memory and
/// the container's cgroup limit, when either is known.
fn system_memory_bytes() -> Option<u64> {
    let physical = std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|m| parse_meminfo_total(&m));
    let cgroup = CGROUP_LIMIT_FILES.iter().find_map(|path| {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| parse_cgroup_limit(&raw))
    });
    match (physical, cgroup) {
        (Some(p), Some(c)) => Some(p.min(c)),
        (p, c) => p.or(c),
    }
}

fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemTotal:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb * 1024)
}

/// `max` (v2) and the v1 "unlimited" sentinel near `i64::MAX` mean no limit.
fn parse_cgroup_limit(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw == "max" {
        return None;
    }
    let bytes = raw.parse::<u64>().ok()?;
    (bytes > 0 && bytes < u64::MAX / 4).then_some(bytes)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo_total() {
        let meminfo = "MemTotal:       16318412 kB\nMemFree:         1021340 kB\n";
        assert_eq!(parse_meminfo_total(meminfo), Some(16_318_412 * 1024));
        assert_eq!(parse_meminfo_total("MemFree: 1 kB\n"), None);
    }

    #[test]
    fn test_parse_cgroup_limit() {
        assert_eq!(parse_cgroup_limit("2147483648\n"), Some(2 * 1024 * MIB));
        assert_eq!(parse_cgroup_limit("max\n"), None);
        // cgroup v1 reports "unlimited" as a page-aligned i64::MAX.
        assert_eq!(parse_cgroup_limit("9223372036854771712\n"), None);
        assert_eq!(parse_cgroup_limit("0"), None);
        assert_eq!(parse_cgroup_limit("garbage"), None);
    }

    #[test]
    fn test_system_memory_is_detected_on_linux() {
        if cfg!(target_os = "linux") {
            assert!(system_memory_bytes().unwrap() > 0);
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.search.hamming_bound, 283);
        assert_eq!(config.search.max_top_n, 100);
        assert_eq!(config.loader.lock_timeout_secs, 300);
        assert_eq!(config.loader.group_chunk_size, 10_000);
        assert_eq!(config.cluster.stabilization_timeout_secs, 30);
        assert_eq!(config.governor.slow_threshold_pct, 80.0);
        assert_eq!(config.governor.critical_threshold_pct, 85.0);
        assert_eq!(config.loader.mode, LoadMode::SingleLeader);
    }

    #[test]
    fn test_parse_toml_sections() {
        let toml_str = r#"
            [coordination]
            backend = "memory"

            [cluster]
            name = "faces"
            node_id = "node-a"
            expected_members = 3

            [loader]
            mode = "sharded"
            batch_size = 1200

            [search]
            hamming_bound = 40
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.coordination.backend, StorageBackend::Memory);
        assert_eq!(config.cluster.name, "faces");
        assert_eq!(config.cluster.node_id, "node-a");
        assert_eq!(config.cluster.expected_members, 3);
        assert_eq!(config.loader.mode, LoadMode::Sharded);
        assert_eq!(config.loader.batch_size, 1200);
        assert_eq!(config.search.hamming_bound, 40);
        // Untouched sections keep defaults.
        assert_eq!(config.index.partition_count, 271);
    }

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!("S3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!(
            "memory".parse::<StorageBackend>().unwrap(),
            StorageBackend::Memory
        );
        assert!("gcs".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_thresholds() {
        let mut config = Config::default();
        config.governor.slow_threshold_pct = 90.0;
        config.governor.critical_threshold_pct = 85.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_sqlite_path() {
        let mut config = Config::default();
        config.source.kind = SourceKind::Sqlite;
        assert!(config.validate().is_err());
        config.source.sqlite_path = Some(PathBuf::from("/tmp/rows.db"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_host_profile_batch_size_range() {
        for cores in [1, 2, 4, 8, 16, 64, 256] {
            for mem_mb in [512u64, 4096, 65_536] {
                let p = HostProfile::derive(cores, mem_mb * MIB);
                assert!((500..=3000).contains(&p.batch_size), "{p:?}");
                assert!((10_000..=100_000).contains(&p.progress_interval), "{p:?}");
                assert_eq!(p.scan_workers, cores);
            }
        }
    }

    #[test]
    fn test_host_profile_scales_with_cores() {
        let small = HostProfile::derive(2, 64 * 1024 * MIB);
        let large = HostProfile::derive(16, 64 * 1024 * MIB);
        assert!(large.batch_size > small.batch_size);
        assert_eq!(large.batch_size, 3000);
    }

    #[test]
    fn test_host_profile_respects_overrides() {
        let mut config = Config::default();
        config.loader.batch_size = 777;
        config.loader.progress_interval = 12_345;
        config.search.scan_workers = 3;
        config.governor.memory_limit_mb = 1024;
        let p = HostProfile::detect(&config);
        assert_eq!(p.batch_size, 777);
        assert_eq!(p.progress_interval, 12_345);
        assert_eq!(p.scan_workers, 3);
        assert_eq!(p.memory_limit_bytes, 1024 * MIB);
    }
}
