//! Store Client Abstraction
//!
//! [`StoreClient`] is the only way the uploader and fetcher talk to a
//! key-value store. Two backends implement it:
//!
//! - [`RedisStore`]: a Redis server (`redis://`, `rediss://`), either a single
//!   endpoint served by a small pool of multiplexed connections, or a Redis
//!   Cluster reached through one cluster-aware connection
//! - [`MemoryStore`]: an in-process map with the same semantics, used by tests
//!   and examples (`memory://`)
//!
//! ## Topology
//!
//! In [`Topology::Cluster`] mode every multi-key call must stay inside one
//! hash tag. Both backends check this before doing any I/O and return
//! [`ClientError::CrossSlot`] otherwise. Callers split keys per partition.
//!
//! ## Ownership
//!
//! A handle is created by [`connect`] and shared as `Arc<dyn StoreClient>`.
//! There is no global connection state; whoever calls `connect` owns the
//! handle and closes it.

mod memory;
mod redis_store;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

use crate::config::StoreConfig;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chunkhouse_core::hash_tag_of;
use std::sync::Arc;
use std::time::Duration;

/// How keys are spread over servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topology {
    Standalone,
    Cluster,
}

impl Topology {
    pub fn is_cluster(self) -> bool {
        matches!(self, Topology::Cluster)
    }
}

/// Outcome of one key of a multi-get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Present(Bytes),
    Absent,
}

impl FetchOutcome {
    pub fn is_present(&self) -> bool {
        matches!(self, FetchOutcome::Present(_))
    }
}

impl From<Option<Vec<u8>>> for FetchOutcome {
    fn from(value: Option<Vec<u8>>) -> Self {
        match value {
            Some(bytes) => FetchOutcome::Present(Bytes::from(bytes)),
            None => FetchOutcome::Absent,
        }
    }
}

/// Connection settings shared by all backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Connections opened to a single endpoint.
    pub max_pool_size: usize,
    pub connect_timeout: Duration,
    /// Ping idle connections in the background.
    pub keepalive: bool,
    pub keepalive_interval: Duration,
    /// Upper bound for any one store call.
    pub request_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 50,
            connect_timeout: Duration::from_secs(5),
            keepalive: true,
            keepalive_interval: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Key-value store operations used by the chunk pipeline.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Address the handle was opened against.
    fn endpoint(&self) -> &str;

    fn topology(&self) -> Topology;

    /// Store `value` under `key`, replacing any previous value.
    async fn set(&self, key: &str, value: Bytes) -> Result<()>;

    /// Read `keys` in one round trip.
    ///
    /// Returns exactly one outcome per key, in input order.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<FetchOutcome>>;

    /// Delete `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// All keys matching a glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>>;

    async fn ping(&self) -> Result<()>;

    /// Release connections. Later calls fail with [`ClientError::Closed`].
    async fn close(&self) -> Result<()>;
}

/// Open a store handle for `config.url`.
///
/// | Scheme | Backend |
/// |---|---|
/// | `redis://`, `rediss://` | [`RedisStore`] |
/// | `memory://` | [`MemoryStore`] |
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn StoreClient>> {
    let url = config.url.as_str();
    let (scheme, _) = url.split_once("://").ok_or_else(|| ClientError::Connection {
        endpoint: url.to_string(),
        message: "URL has no scheme".to_string(),
    })?;

    match scheme {
        "redis" | "rediss" => Ok(Arc::new(RedisStore::connect(config).await?)),
        "memory" => {
            let store = if config.cluster {
                MemoryStore::cluster(config.memory_shards)
            } else {
                MemoryStore::new()
            };
            Ok(Arc::new(store.with_endpoint(url)))
        }
        other => Err(ClientError::Connection {
            endpoint: url.to_string(),
            message: format!("unsupported scheme '{other}'"),
        }),
    }
}

/// Reject key lists that span more than one hash tag.
pub fn ensure_single_hash_tag(keys: &[String]) -> Result<()> {
    let Some(first) = keys.first() else {
        return Ok(());
    };
    let tag = hash_tag_of(first);
    match keys.iter().find(|k| hash_tag_of(k) != tag) {
        Some(other) => Err(ClientError::CrossSlot {
            first: first.clone(),
            other: other.clone(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkhouse_core::KeySpace;

    #[test]
    fn test_single_tag_check() {
        let keys = KeySpace::new("demo:v1");
        assert!(ensure_single_hash_tag(&keys.partition_keys(3, 8)).is_ok());
        assert!(ensure_single_hash_tag(&[]).is_ok());

        let mixed = vec![keys.key(0, 0), keys.key(0, 1), keys.key(1, 0)];
        match ensure_single_hash_tag(&mixed) {
            Err(ClientError::CrossSlot { first, other }) => {
                assert_eq!(first, keys.key(0, 0));
                assert_eq!(other, keys.key(1, 0));
            }
            other => panic!("expected CrossSlot, got {other:?}"),
        }
    }

    #[test]
    fn test_fetch_outcome_from_option() {
        assert_eq!(FetchOutcome::from(None), FetchOutcome::Absent);
        assert!(FetchOutcome::from(Some(b"x".to_vec())).is_present());
    }

    #[tokio::test]
    async fn test_connect_picks_backend_by_scheme() {
        let config = StoreConfig {
            url: "memory://unit".to_string(),
            ..StoreConfig::default()
        };
        let store = connect(&config).await.unwrap();
        assert_eq!(store.endpoint(), "memory://unit");
        assert_eq!(store.topology(), Topology::Standalone);

        let config = StoreConfig {
            url: "memory://unit".to_string(),
            cluster: true,
            ..StoreConfig::default()
        };
        assert_eq!(connect(&config).await.unwrap().topology(), Topology::Cluster);

        let config = StoreConfig {
            url: "ftp://nope".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            connect(&config).await,
            Err(ClientError::Connection { .. })
        ));
    }
}
