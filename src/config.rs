//! Configuration loading and types for chunkvault.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, admin authentication, file metadata persistence,
//! the backend connection pool, streaming, and uploads.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Admin authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Metadata store settings.
    #[serde(default)]
    pub metadata: MetadataConfig,

    /// Backend connection pool.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Range streaming settings.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Upload orchestration settings.
    #[serde(default)]
    pub uploads: UploadConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Maximum upload size through an elevated connection (default 4 GiB).
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Maximum upload size through a standard connection (default 2 GiB).
    #[serde(default = "default_max_file_size_standard")]
    pub max_file_size_standard: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            max_file_size: default_max_file_size(),
            max_file_size_standard: default_max_file_size_standard(),
        }
    }
}

/// Admin authentication.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Bearer token required on admin routes.
    #[serde(default = "default_admin_password")]
    pub admin_password: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_password: default_admin_password(),
        }
    }
}

/// Metadata store configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Backend type: `sqlite` or `memory`.
    #[serde(default = "default_metadata_engine")]
    pub engine: String,

    /// SQLite-specific configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            engine: default_metadata_engine(),
            sqlite: SqliteConfig::default(),
        }
    }
}

/// SQLite-specific metadata configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_metadata_path")]
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_metadata_path(),
        }
    }
}

/// Capability tier of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionClass {
    /// Higher throughput and size privileges; preferred by `acquire`.
    Elevated,
    /// Regular connection.
    Standard,
}

impl std::fmt::Display for ConnectionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionClass::Elevated => f.write_str("elevated"),
            ConnectionClass::Standard => f.write_str("standard"),
        }
    }
}

/// Backend pool configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Max concurrent uses of one elevated connection before `acquire`
    /// falls back to least-loaded selection.
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: usize,

    /// Connection credentials, in pool iteration order.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: default_concurrency_ceiling(),
            connections: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Configured connections, or a single elevated `local` connection
    /// when none are listed.
    pub fn effective_connections(&self) -> Vec<ConnectionConfig> {
        if !self.connections.is_empty() {
            return self.connections.clone();
        }
        vec![ConnectionConfig {
            identity: "local-0".to_string(),
            class: ConnectionClass::Elevated,
            backend: default_backend_kind(),
            root_dir: default_backend_root(),
            base_url: None,
            token: None,
        }]
    }
}

/// Check that identities are unique and that every connection addresses
/// the same store, so any connection can serve any object.
pub fn validate_connections(connections: &[ConnectionConfig]) -> anyhow::Result<()> {
    let mut seen = std::collections::HashSet::new();
    for conn in connections {
        if !seen.insert(conn.identity.as_str()) {
            anyhow::bail!("duplicate connection identity '{}'", conn.identity);
        }
    }

    let Some(first) = connections.first() else {
        return Ok(());
    };
    let store = first.store_key();
    for conn in &connections[1..] {
        if conn.store_key() != store {
            anyhow::bail!(
                "connection '{}' addresses {} but '{}' addresses {}; all connections must share one store",
                conn.identity,
                conn.store_key(),
                first.identity,
                store
            );
        }
    }
    Ok(())
}

/// One configured backend connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Unique key within the pool.
    pub identity: String,

    /// Capability tier.
    #[serde(default = "default_connection_class")]
    pub class: ConnectionClass,

    /// Backend kind: `local`, `memory` or `http`.
    #[serde(default = "default_backend_kind")]
    pub backend: String,

    /// Root directory for the `local` backend.
    #[serde(default = "default_backend_root")]
    pub root_dir: String,

    /// Base URL for the `http` backend.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Bearer token presented to the `http` backend.
    #[serde(default)]
    pub token: Option<String>,
}

impl ConnectionConfig {
    /// The store this connection reads and writes, e.g. `local:./data/objects`.
    fn store_key(&self) -> String {
        match self.backend.as_str() {
            "local" => format!("local:{}", self.root_dir.trim_end_matches('/')),
            "http" => format!(
                "http:{}",
                self.base_url.as_deref().unwrap_or_default().trim_end_matches('/')
            ),
            other => other.to_string(),
        }
    }
}

/// Streaming configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    /// Chunk size hint passed to the backend (default 1 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Upload configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Directory for spooled uploads. Empty means the system temp dir.
    #[serde(default)]
    pub temp_dir: String,

    /// Seconds a finished progress entry stays queryable.
    #[serde(default = "default_progress_ttl")]
    pub progress_ttl_seconds: u64,

    /// Label of the backend storage channel recorded on each file.
    #[serde(default = "default_storage_channel")]
    pub storage_channel: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: String::new(),
            progress_ttl_seconds: default_progress_ttl(),
            storage_channel: default_storage_channel(),
        }
    }
}

impl UploadConfig {
    /// Resolve the spool directory.
    pub fn temp_path(&self) -> std::path::PathBuf {
        if self.temp_dir.is_empty() {
            std::env::temp_dir()
        } else {
            std::path::PathBuf::from(&self.temp_dir)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_file_size() -> u64 {
    4 * 1024 * 1024 * 1024
}

fn default_max_file_size_standard() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_admin_password() -> String {
    "admin123".to_string()
}

fn default_metadata_engine() -> String {
    "sqlite".to_string()
}

fn default_metadata_path() -> String {
    "./data/metadata.db".to_string()
}

fn default_concurrency_ceiling() -> usize {
    3
}

fn default_connection_class() -> ConnectionClass {
    ConnectionClass::Standard
}

fn default_backend_kind() -> String {
    "local".to_string()
}

fn default_backend_root() -> String {
    "./data/objects".to_string()
}

fn default_chunk_size() -> usize {
    1024 * 1024
}

fn default_progress_ttl() -> u64 {
    3600
}

fn default_storage_channel() -> String {
    "default".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.streaming.chunk_size == 0 {
        anyhow::bail!("streaming.chunk_size must be greater than zero");
    }
    validate_connections(&config.pool.connections)?;
    Ok(config)
}
