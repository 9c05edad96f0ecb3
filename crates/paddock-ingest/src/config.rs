//! Pipeline configuration
//!
//! Everything a stage needs (namespace prefix, bucket, remote endpoint,
//! concurrency, retry policy, dedupe capacity, warehouse table) lives in one
//! [`PipelineConfig`] that is loaded once and handed to constructors.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::PipelineError;
use crate::retry::{Backoff, RetryPolicy, DEFAULT_BACKOFF_MS, DEFAULT_MAX_ATTEMPTS};
use crate::storage::config::StorageConfig;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Namespace every artifact is written under.
pub const DEFAULT_DATA_PREFIX: &str = "horse_data/";

/// Remote registry endpoint for per-horse lookups.
pub const DEFAULT_SOURCE_URL: &str = "https://homas.pkwk.org/homas/race/search/horse";

/// Per-request timeout against the remote registry.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum in-flight fetches per batch.
pub const DEFAULT_FETCH_CONCURRENCY: usize = 10;

/// Upper bound on distinct keys the clean stage tracks in one run.
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 5_000_000;

/// Durable warehouse table.
pub const DEFAULT_DESTINATION_TABLE: &str = "horse_records";

/// Rows per bulk insert when loading a staging table.
pub const DEFAULT_LOAD_CHUNK_SIZE: usize = 500;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/paddock";

pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Longest destination name that still leaves room for the staging suffix
/// inside Postgres' 63 byte identifier limit.
const MAX_TABLE_NAME_LEN: usize = 40;

/// Full pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Object key prefix shared by shards, masters and cleaned artifacts.
    /// Always ends with `/`.
    pub data_prefix: String,
    pub source: SourceConfig,
    pub fetch: FetchConfig,
    pub dedupe: DedupeConfig,
    pub warehouse: WarehouseConfig,
    pub storage: StorageConfig,
}

/// Remote record source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

/// Fetch stage tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

/// Clean stage capacity contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// The stage fails instead of growing past this many distinct keys
    pub max_tracked_keys: usize,
}

/// Warehouse connection and target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub destination_table: String,
    pub load_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_prefix: DEFAULT_DATA_PREFIX.to_string(),
            source: SourceConfig {
                base_url: DEFAULT_SOURCE_URL.to_string(),
                request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            },
            fetch: FetchConfig {
                concurrency: DEFAULT_FETCH_CONCURRENCY,
                retry: RetryPolicy::default(),
            },
            dedupe: DedupeConfig {
                max_tracked_keys: DEFAULT_MAX_TRACKED_KEYS,
            },
            warehouse: WarehouseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                destination_table: DEFAULT_DESTINATION_TABLE.to_string(),
                load_chunk_size: DEFAULT_LOAD_CHUNK_SIZE,
            },
            storage: StorageConfig::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl PipelineConfig {
    /// Load configuration from the environment (and `.env`), then validate it.
    ///
    /// Pipeline settings use the `PIPELINE_` prefix; the warehouse reads
    /// `DATABASE_*` and storage reads `S3_*`.
    pub fn from_env() -> Result<Self, PipelineError> {
        dotenvy::dotenv().ok();

        let retry_attempts = env_or("PIPELINE_RETRY_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS);
        let retry_delay_ms = env_or("PIPELINE_RETRY_DELAY_MS", DEFAULT_BACKOFF_MS);
        let backoff = match std::env::var("PIPELINE_RETRY_BACKOFF").as_deref() {
            Ok("exponential") => Backoff::Exponential {
                base_ms: retry_delay_ms,
                max_ms: env_or("PIPELINE_RETRY_MAX_DELAY_MS", retry_delay_ms.saturating_mul(8)),
            },
            Ok("fixed") | Err(_) => Backoff::Fixed {
                delay_ms: retry_delay_ms,
            },
            Ok(other) => {
                return Err(PipelineError::Config(format!(
                    "PIPELINE_RETRY_BACKOFF must be 'fixed' or 'exponential', got {:?}",
                    other
                )))
            }
        };

        let config = Self {
            data_prefix: std::env::var("PIPELINE_DATA_PREFIX")
                .unwrap_or_else(|_| DEFAULT_DATA_PREFIX.to_string()),
            source: SourceConfig {
                base_url: std::env::var("PIPELINE_SOURCE_URL")
                    .unwrap_or_else(|_| DEFAULT_SOURCE_URL.to_string()),
                request_timeout_secs: env_or(
                    "PIPELINE_REQUEST_TIMEOUT_SECS",
                    DEFAULT_REQUEST_TIMEOUT_SECS,
                ),
            },
            fetch: FetchConfig {
                concurrency: env_or("PIPELINE_FETCH_CONCURRENCY", DEFAULT_FETCH_CONCURRENCY),
                retry: RetryPolicy {
                    max_attempts: retry_attempts,
                    backoff,
                },
            },
            dedupe: DedupeConfig {
                max_tracked_keys: env_or("PIPELINE_DEDUPE_MAX_KEYS", DEFAULT_MAX_TRACKED_KEYS),
            },
            warehouse: WarehouseConfig {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
                destination_table: std::env::var("PIPELINE_DESTINATION_TABLE")
                    .unwrap_or_else(|_| DEFAULT_DESTINATION_TABLE.to_string()),
                load_chunk_size: env_or("PIPELINE_LOAD_CHUNK_SIZE", DEFAULT_LOAD_CHUNK_SIZE),
            },
            storage: StorageConfig::from_env(),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.data_prefix.is_empty() || !self.data_prefix.ends_with('/') {
            return Err(PipelineError::Config(format!(
                "data prefix must be non-empty and end with '/', got {:?}",
                self.data_prefix
            )));
        }

        if self.source.base_url.is_empty() {
            return Err(PipelineError::Config(
                "source base URL cannot be empty".to_string(),
            ));
        }

        if self.fetch.concurrency == 0 {
            return Err(PipelineError::Config(
                "fetch concurrency must be greater than 0".to_string(),
            ));
        }

        if self.fetch.retry.max_attempts == 0 {
            return Err(PipelineError::Config(
                "retry max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.dedupe.max_tracked_keys == 0 {
            return Err(PipelineError::Config(
                "dedupe max_tracked_keys must be greater than 0".to_string(),
            ));
        }

        if !is_plain_identifier(&self.warehouse.destination_table) {
            return Err(PipelineError::Config(format!(
                "destination table {:?} is not a plain SQL identifier",
                self.warehouse.destination_table
            )));
        }

        if self.warehouse.load_chunk_size == 0 {
            return Err(PipelineError::Config(
                "load chunk size must be greater than 0".to_string(),
            ));
        }

        if self.warehouse.min_connections > self.warehouse.max_connections {
            return Err(PipelineError::Config(format!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.warehouse.min_connections, self.warehouse.max_connections
            )));
        }

        if self.storage.bucket.is_empty() {
            return Err(PipelineError::Config("S3 bucket cannot be empty".to_string()));
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.source.request_timeout_secs)
    }

    /// Set the artifact namespace
    pub fn with_data_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.data_prefix = prefix.into();
        self
    }

    /// Set the remote source endpoint
    pub fn with_source_url(mut self, url: impl Into<String>) -> Self {
        self.source.base_url = url.into();
        self
    }

    /// Set fetch concurrency
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.fetch.concurrency = concurrency;
        self
    }

    /// Set the per-id retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.fetch.retry = retry;
        self
    }

    /// Set the dedupe capacity
    pub fn with_max_tracked_keys(mut self, max: usize) -> Self {
        self.dedupe.max_tracked_keys = max;
        self
    }

    /// Set the durable warehouse table
    pub fn with_destination_table(mut self, table: impl Into<String>) -> Self {
        self.warehouse.destination_table = table.into();
        self
    }

    /// Set the object storage bucket
    pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.storage.bucket = bucket.into();
        self
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`, short enough to take a staging suffix
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= MAX_TABLE_NAME_LEN && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
