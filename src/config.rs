use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable prefix, e.g. `LOG_BEACON__SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "LOG_BEACON";

/// Paths served by the API router
const RESERVED_ROUTES: [&str; 4] = ["/ingest", "/search", "/tail", "/health"];

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub archiver: ArchiverConfig,
    #[serde(default)]
    pub hot_storage: HotStorageConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub tail: TailConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// "json" or "text"
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_subject")]
    pub subject: String,
    #[serde(default = "default_ack_wait_seconds")]
    pub ack_wait_seconds: u64,
    #[serde(default = "default_max_ack_pending")]
    pub max_ack_pending: usize,
    /// 0 = redeliver without limit
    #[serde(default)]
    pub max_deliver: u32,
    /// SQLite URL of the bus journal; empty keeps retained messages in
    /// memory only
    #[serde(default = "default_journal_url")]
    pub journal_url: String,
    /// How long shutdown waits for in-flight message handlers
    #[serde(default = "default_drain_timeout_seconds")]
    pub drain_timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiverConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_archiver_group")]
    pub queue_group: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    #[serde(default = "default_bucket_retry_attempts")]
    pub bucket_retry_attempts: u32,
    #[serde(default = "default_bucket_retry_delay_seconds")]
    pub bucket_retry_delay_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HotStorageConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_hot_storage_group")]
    pub queue_group: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_true")]
    pub reindex_on_startup: bool,
    #[serde(default = "default_reindex_batch_size")]
    pub reindex_batch_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    Filesystem,
    Memory,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_object_store_backend")]
    pub backend: ObjectStoreBackend,
    /// Root directory for the filesystem backend; buckets are subdirectories
    #[serde(default = "default_object_store_root")]
    pub root: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TailConfig {
    #[serde(default = "default_tail_buffer")]
    pub buffer: usize,
    #[serde(default = "default_ping_interval_seconds")]
    pub ping_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_stream() -> String {
    crate::bus::LOG_STREAM.to_string()
}

fn default_subject() -> String {
    crate::bus::LOG_SUBJECT.to_string()
}

fn default_ack_wait_seconds() -> u64 {
    30
}

fn default_max_ack_pending() -> usize {
    1000
}

fn default_journal_url() -> String {
    "sqlite:./data/bus.db".to_string()
}

fn default_drain_timeout_seconds() -> u64 {
    10
}

fn default_archiver_group() -> String {
    crate::consumers::ARCHIVER_GROUP.to_string()
}

fn default_bucket() -> String {
    "logs".to_string()
}

fn default_bucket_retry_attempts() -> u32 {
    10
}

fn default_bucket_retry_delay_seconds() -> u64 {
    3
}

fn default_hot_storage_group() -> String {
    crate::consumers::HOT_STORAGE_GROUP.to_string()
}

fn default_database_url() -> String {
    "sqlite:./data/hot-storage.db".to_string()
}

fn default_reindex_batch_size() -> usize {
    500
}

fn default_object_store_backend() -> ObjectStoreBackend {
    ObjectStoreBackend::Filesystem
}

fn default_object_store_root() -> String {
    "./data/archive".to_string()
}

fn default_tail_buffer() -> usize {
    crate::tail::DEFAULT_TAIL_BUFFER
}

fn default_ping_interval_seconds() -> u64 {
    crate::tail::DEFAULT_PING_INTERVAL.as_secs()
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            subject: default_subject(),
            ack_wait_seconds: default_ack_wait_seconds(),
            max_ack_pending: default_max_ack_pending(),
            max_deliver: 0,
            journal_url: default_journal_url(),
            drain_timeout_seconds: default_drain_timeout_seconds(),
        }
    }
}

impl Default for ArchiverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_group: default_archiver_group(),
            bucket: default_bucket(),
            bucket_retry_attempts: default_bucket_retry_attempts(),
            bucket_retry_delay_seconds: default_bucket_retry_delay_seconds(),
        }
    }
}

impl Default for HotStorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_group: default_hot_storage_group(),
            database_url: default_database_url(),
            reindex_on_startup: true,
            reindex_batch_size: default_reindex_batch_size(),
        }
    }
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            backend: default_object_store_backend(),
            root: default_object_store_root(),
        }
    }
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            buffer: default_tail_buffer(),
            ping_interval_seconds: default_ping_interval_seconds(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_metrics_endpoint(),
        }
    }
}

impl BusConfig {
    pub fn bus_options(&self) -> crate::bus::BusOptions {
        crate::bus::BusOptions {
            ack_wait: Duration::from_secs(self.ack_wait_seconds),
            max_ack_pending: self.max_ack_pending,
            max_deliver: self.max_deliver,
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    /// Whether retained messages survive a restart
    pub fn is_durable(&self) -> bool {
        !self.journal_url.trim().is_empty()
    }
}

impl TailConfig {
    pub fn settings(&self) -> crate::tail::TailSettings {
        crate::tail::TailSettings {
            buffer: self.buffer,
            ping_interval: Duration::from_secs(self.ping_interval_seconds),
        }
    }
}

/// Load configuration from a TOML file plus `LOG_BEACON__*` overrides
///
/// With no explicit path, `config.toml` in the working directory is used
/// if present; otherwise defaults apply.
pub fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let file = match path {
        Some(path) => config::File::with_name(path).required(true),
        None => config::File::with_name("config").required(false),
    };

    let config = config::Config::builder()
        .add_source(file)
        .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.bus.stream.trim().is_empty() {
        anyhow::bail!("bus.stream cannot be empty");
    }
    crate::bus::validate_subject(&cfg.bus.subject)
        .map_err(|e| anyhow::anyhow!("bus.subject is invalid: {}", e))?;

    if cfg.bus.ack_wait_seconds == 0 {
        anyhow::bail!("bus.ack_wait_seconds must be greater than 0");
    }
    if cfg.bus.max_ack_pending == 0 {
        anyhow::bail!("bus.max_ack_pending must be greater than 0");
    }

    if cfg.archiver.queue_group.trim().is_empty() {
        anyhow::bail!("archiver.queue_group cannot be empty");
    }
    if cfg.hot_storage.queue_group.trim().is_empty() {
        anyhow::bail!("hot_storage.queue_group cannot be empty");
    }
    // Sharing a group would split records between archiver and hot storage
    if cfg.archiver.queue_group == cfg.hot_storage.queue_group {
        anyhow::bail!(
            "archiver and hot_storage must use different queue groups (both are '{}')",
            cfg.archiver.queue_group
        );
    }

    if cfg.archiver.bucket.trim().is_empty() {
        anyhow::bail!("archiver.bucket cannot be empty");
    }
    if cfg.hot_storage.database_url.trim().is_empty() {
        anyhow::bail!("hot_storage.database_url cannot be empty");
    }
    if cfg.object_store.backend == ObjectStoreBackend::Filesystem
        && cfg.object_store.root.trim().is_empty()
    {
        anyhow::bail!("object_store.root cannot be empty for the filesystem backend");
    }

    if cfg.tail.buffer == 0 {
        anyhow::bail!("tail.buffer must be greater than 0");
    }
    if cfg.tail.ping_interval_seconds == 0 {
        anyhow::bail!("tail.ping_interval_seconds must be greater than 0");
    }

    if cfg.metrics.enabled {
        let endpoint = cfg.metrics.endpoint.as_str();
        if !endpoint.starts_with('/') {
            anyhow::bail!("metrics.endpoint must start with '/'");
        }
        if RESERVED_ROUTES.contains(&endpoint) || endpoint.starts_with("/api/v1/") {
            anyhow::bail!("metrics.endpoint '{}' collides with an API route", endpoint);
        }
    }

    Ok(())
}
