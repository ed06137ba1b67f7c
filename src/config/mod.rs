//! Configuration management for mongo-s3-export
//!
//! This module handles loading, parsing, and managing configuration from various sources:
//! - Configuration files (TOML format)
//! - Environment variables
//! - Command-line arguments
//!
//! Configuration precedence (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file
//! 4. Default values

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// Smallest part size accepted by S3 multipart uploads (except the last part).
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Prefix for environment variable overrides
const ENV_PREFIX: &str = "MONGO_S3_EXPORT_";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Document store configuration
    #[serde(default)]
    pub mongo: MongoConfig,

    /// Object storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Export pipeline tuning
    #[serde(default)]
    pub export: ExportConfig,

    /// Content sniffing configuration
    #[serde(default)]
    pub sniffer: SnifferConfig,

    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// MongoDB connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConfig {
    /// Connection URI (None leaves the document store uninitialized)
    #[serde(default)]
    pub uri: Option<String>,

    /// Database holding the exported collections and GridFS buckets
    #[serde(default = "default_database")]
    pub database: String,

    /// Cursor batch size for find operations
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    /// Server selection timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Application name reported to the server
    #[serde(default = "default_app_name")]
    pub app_name: String,
}

/// S3 (or S3-compatible) storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Destination bucket (None leaves object storage uninitialized)
    #[serde(default)]
    pub bucket: Option<String>,

    /// AWS region
    #[serde(default)]
    pub region: Option<String>,

    /// Custom endpoint for S3-compatible services (forces path-style addressing)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Multipart part size in bytes
    #[serde(default = "default_part_size")]
    pub part_size: usize,

    /// Number of parts uploaded concurrently per object
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
}

/// Export pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Maximum number of binary relays in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of record chunks buffered between the cursor and the bulk upload
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Count records and binaries before streaming
    #[serde(default = "default_count_upfront")]
    pub count_upfront: bool,

    /// Content type of the uploaded JSON Lines artifact
    #[serde(default = "default_record_content_type")]
    pub record_content_type: String,
}

/// Extra byte signatures appended to the built-in table
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnifferConfig {
    #[serde(default)]
    pub extra_signatures: Vec<SignatureConfig>,
}

/// One configured byte signature
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignatureConfig {
    /// Magic bytes as hex, e.g. `"52617221"`
    pub hex: String,

    /// Byte offset where the magic starts
    #[serde(default)]
    pub offset: usize,

    /// Media type reported on match
    pub media_type: String,

    /// File extension appended to destination keys (without the dot)
    #[serde(default)]
    pub extension: Option<String>,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// SSE keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// Enable timestamps in logs
    #[serde(default = "default_log_timestamps")]
    pub timestamps: bool,
}

/// Log level options
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

// Default value functions
fn default_database() -> String {
    "test".to_string()
}

fn default_batch_size() -> u32 {
    1000
}

fn default_timeout() -> u64 {
    30
}

fn default_app_name() -> String {
    "mongo-s3-export".to_string()
}

fn default_part_size() -> usize {
    10 * 1024 * 1024
}

fn default_queue_size() -> usize {
    4
}

fn default_concurrency() -> usize {
    10
}

fn default_pipe_capacity() -> usize {
    64
}

fn default_count_upfront() -> bool {
    true
}

fn default_record_content_type() -> String {
    "application/x-jsonlines".to_string()
}

fn default_bind() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_keep_alive() -> u64 {
    15
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

fn default_log_timestamps() -> bool {
    true
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: None,
            database: default_database(),
            batch_size: default_batch_size(),
            timeout: default_timeout(),
            app_name: default_app_name(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: None,
            region: None,
            endpoint: None,
            part_size: default_part_size(),
            queue_size: default_queue_size(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            pipe_capacity: default_pipe_capacity(),
            count_upfront: default_count_upfront(),
            record_content_type: default_record_content_type(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            timestamps: default_log_timestamps(),
        }
    }
}

impl Config {
    /// Create a new configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from all sources with proper precedence
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment overrides
    ///
    /// Besides `MONGO_S3_EXPORT_*` variables, the conventional `MONGO_URI`,
    /// `AWS_BUCKET_NAME`, `AWS_REGION` and `AWS_ENDPOINT_URL` are honored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.is_empty())
        };

        if let Some(uri) = get("MONGO_URI").or_else(|| lookup("MONGO_URI")) {
            self.mongo.uri = Some(uri);
        }
        if let Some(db) = get("MONGO_DATABASE") {
            self.mongo.database = db;
        }
        if let Some(bucket) = get("BUCKET").or_else(|| lookup("AWS_BUCKET_NAME")) {
            self.storage.bucket = Some(bucket);
        }
        if let Some(region) = get("REGION").or_else(|| lookup("AWS_REGION")) {
            self.storage.region = Some(region);
        }
        if let Some(endpoint) = get("ENDPOINT").or_else(|| lookup("AWS_ENDPOINT_URL")) {
            self.storage.endpoint = Some(endpoint);
        }
        if let Some(value) = get("CONCURRENCY") {
            self.export.concurrency = parse_env("export.concurrency", &value)?;
        }
        if let Some(value) = get("PART_SIZE") {
            self.storage.part_size = parse_env("storage.part_size", &value)?;
        }
        if let Some(bind) = get("BIND") {
            self.server.bind = bind;
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("mongo-s3-export")
            .join("config.toml")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.export.concurrency == 0 {
            return Err(invalid("export.concurrency", "0"));
        }
        if self.export.pipe_capacity == 0 {
            return Err(invalid("export.pipe_capacity", "0"));
        }
        if self.mongo.batch_size == 0 {
            return Err(invalid("mongo.batch_size", "0"));
        }
        if self.storage.part_size < MIN_PART_SIZE {
            return Err(invalid(
                "storage.part_size",
                &self.storage.part_size.to_string(),
            ));
        }
        if self.storage.queue_size == 0 {
            return Err(invalid("storage.queue_size", "0"));
        }
        for signature in &self.sniffer.extra_signatures {
            match hex::decode(&signature.hex) {
                Ok(bytes) if !bytes.is_empty() => {}
                _ => return Err(invalid("sniffer.extra_signatures.hex", &signature.hex)),
            }
            if !signature.media_type.contains('/') {
                return Err(invalid(
                    "sniffer.extra_signatures.media_type",
                    &signature.media_type,
                ));
            }
        }
        Ok(())
    }

    /// Get server selection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.mongo.timeout)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| ConfigError::InvalidFormat(e.to_string()).into())
    }
}

fn invalid(field: &str, value: &str) -> crate::error::ExportError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
    }
    .into()
}

fn parse_env<T: std::str::FromStr>(field: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(field, value))
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}
