//! Client Configuration
//!
//! One TOML file describes a dataset shape, where it lives, and how hard to
//! push the store:
//!
//! ```toml
//! key_prefix = "demo:v1"
//! partitions = 8
//! batches_per_partition = 8
//! compression = "zstd"
//!
//! [store]
//! url = "redis://127.0.0.1:6379"
//! cluster = false
//! max_pool_size = 50
//! connect_timeout_ms = 5000
//! keepalive = true
//! request_timeout_ms = 30000
//!
//! [upload]
//! concurrency_limit = 256
//! drain_batch_size = 100
//!
//! [fetch]
//! pipeline_size = 64
//! concurrency_limit = 256
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//! ```
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Durations are integer milliseconds.
//!
//! ## Environment Overrides
//!
//! - `CHUNKHOUSE_STORE_URL`: `store.url`
//! - `CHUNKHOUSE_KEY_PREFIX`: `key_prefix`
//! - `CHUNKHOUSE_CLUSTER`: `store.cluster` (`on`/`off`, `true`/`false`, `1`/`0`)

use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::store::StoreOptions;
use chunkhouse_core::{validate_shape, Compression};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkhouseConfig {
    /// Namespace root for all keys of one dataset
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Number of partitions (default: 8)
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Batches in every partition (default: 8)
    #[serde(default = "default_batches_per_partition")]
    pub batches_per_partition: u32,

    /// Chunk compression (default: zstd)
    #[serde(default)]
    pub compression: Compression,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub upload: UploadConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for ChunkhouseConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            partitions: default_partitions(),
            batches_per_partition: default_batches_per_partition(),
            compression: Compression::default(),
            store: StoreConfig::default(),
            upload: UploadConfig::default(),
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl ChunkhouseConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ClientError::Config(format!("invalid TOML: {e}")))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `CHUNKHOUSE_*` variables from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("CHUNKHOUSE_STORE_URL") {
            self.store.url = url;
        }
        if let Some(prefix) = lookup("CHUNKHOUSE_KEY_PREFIX") {
            self.key_prefix = prefix;
        }
        if let Some(cluster) = lookup("CHUNKHOUSE_CLUSTER") {
            self.store.cluster = parse_switch(&cluster).ok_or_else(|| {
                ClientError::Config(format!("CHUNKHOUSE_CLUSTER: expected on/off, got '{cluster}'"))
            })?;
        }
        Ok(())
    }

    /// Reject values no operation can run with.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(ClientError::Config("key_prefix must not be empty".into()));
        }
        if self.batches_per_partition == 0 {
            return Err(ClientError::Config(
                "batches_per_partition must be at least 1".into(),
            ));
        }
        validate_shape(self.partitions, self.batches_per_partition)?;
        self.store.validate()?;
        self.upload.validate()?;
        self.fetch.validate()?;
        Ok(())
    }
}

fn parse_switch(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Some(true),
        "off" | "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn default_key_prefix() -> String {
    "chunkhouse".to_string()
}

fn default_partitions() -> u32 {
    8
}

fn default_batches_per_partition() -> u32 {
    8
}

/// Store endpoint and connection options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `redis://`, `rediss://` or `memory://`
    #[serde(default = "default_url")]
    pub url: String,

    /// Treat the store as a sharded cluster
    #[serde(default)]
    pub cluster: bool,

    /// Extra cluster seed nodes besides `url`
    #[serde(default)]
    pub cluster_nodes: Vec<String>,

    /// Shards emulated by `memory://` in cluster mode (default: 3)
    #[serde(default = "default_memory_shards")]
    pub memory_shards: usize,

    /// Connections to a single endpoint (default: 50)
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Connect timeout in milliseconds (default: 5s)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Ping pooled connections in the background (default: true)
    #[serde(default = "default_keepalive")]
    pub keepalive: bool,

    /// Keepalive ping interval in milliseconds (default: 30s)
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// Per-request timeout in milliseconds (default: 30s)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            cluster: false,
            cluster_nodes: Vec::new(),
            memory_shards: default_memory_shards(),
            max_pool_size: default_max_pool_size(),
            connect_timeout_ms: default_connect_timeout_ms(),
            keepalive: default_keepalive(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl StoreConfig {
    /// In-process store, mostly for tests.
    pub fn memory() -> Self {
        Self {
            url: "memory://".to_string(),
            ..Self::default()
        }
    }

    pub fn options(&self) -> StoreOptions {
        StoreOptions {
            max_pool_size: self.max_pool_size,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            keepalive: self.keepalive,
            keepalive_interval: Duration::from_millis(self.keepalive_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_pool_size == 0 {
            return Err(ClientError::Config("store.max_pool_size must be at least 1".into()));
        }
        if self.request_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ClientError::Config("store timeouts must be non-zero".into()));
        }
        if self.keepalive && self.keepalive_interval_ms == 0 {
            return Err(ClientError::Config(
                "store.keepalive_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_memory_shards() -> usize {
    3
}

fn default_max_pool_size() -> usize {
    50
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_keepalive() -> bool {
    true
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Upload bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Max simultaneous outstanding writes (default: 256)
    #[serde(default = "default_upload_concurrency")]
    pub concurrency_limit: usize,

    /// Max pending write handles before a forced drain (default: 100)
    #[serde(default = "default_drain_batch_size")]
    pub drain_batch_size: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_upload_concurrency(),
            drain_batch_size: default_drain_batch_size(),
        }
    }
}

impl UploadConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.concurrency_limit == 0 {
            return Err(ClientError::Config("upload.concurrency_limit must be at least 1".into()));
        }
        if self.drain_batch_size == 0 {
            return Err(ClientError::Config("upload.drain_batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_upload_concurrency() -> usize {
    256
}

fn default_drain_batch_size() -> usize {
    100
}

/// Fetch bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Keys per multi-get call (default: 64)
    #[serde(default = "default_pipeline_size")]
    pub pipeline_size: usize,

    /// Max simultaneous outstanding multi-get calls (default: 256)
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency_limit: usize,

    /// Max payloads decoded at once (default: 8)
    #[serde(default = "default_decode_concurrency")]
    pub decode_concurrency: usize,

    /// Abort on the first undecodable chunk instead of skipping it
    #[serde(default)]
    pub strict_decode: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            pipeline_size: default_pipeline_size(),
            concurrency_limit: default_fetch_concurrency(),
            decode_concurrency: default_decode_concurrency(),
            strict_decode: false,
        }
    }
}

impl FetchConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.pipeline_size == 0 {
            return Err(ClientError::Config("fetch.pipeline_size must be at least 1".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(ClientError::Config("fetch.concurrency_limit must be at least 1".into()));
        }
        if self.decode_concurrency == 0 {
            return Err(ClientError::Config("fetch.decode_concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

fn default_pipeline_size() -> usize {
    64
}

fn default_fetch_concurrency() -> usize {
    256
}

fn default_decode_concurrency() -> usize {
    8
}

/// Backoff schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per store call (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// First backoff in milliseconds (default: 1s)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds (default: 60s)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomize delays by ±25% (default: false)
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: false,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(config.jitter)
    }
}

fn default_max_attempts() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}
