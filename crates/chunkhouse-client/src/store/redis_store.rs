//! Redis backend.
//!
//! ## Single endpoint
//!
//! `max_pool_size` multiplexed connections are opened up front and handed out
//! round-robin. Each one pipelines requests, so the pool bounds sockets while
//! the callers' admission gates bound in-flight work.
//!
//! ## Cluster
//!
//! One cluster-aware connection routes every command by hash slot and follows
//! `MOVED`/`ASK` redirects during resharding. Multi-key commands are checked
//! locally to stay inside one hash tag.
//!
//! ## Keepalive
//!
//! With `keepalive` on, a background task pings every pooled connection each
//! `keepalive_interval` so idle sockets are neither dropped by middleboxes nor
//! found dead by the next burst of writes.

use super::{ensure_single_hash_tag, FetchOutcome, StoreClient, StoreOptions, Topology};
use crate::config::StoreConfig;
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, RedisError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const SCAN_COUNT: usize = 1000;

#[derive(Clone)]
enum Connection {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

impl Connection {
    async fn query<T: redis::FromRedisValue>(&mut self, cmd: &Cmd) -> redis::RedisResult<T> {
        match self {
            Connection::Single(conn) => cmd.query_async(conn).await,
            Connection::Cluster(conn) => cmd.query_async(conn).await,
        }
    }
}

enum Backend {
    Pool {
        connections: Vec<MultiplexedConnection>,
        next: AtomicUsize,
    },
    Cluster(ClusterConnection),
}

impl Backend {
    fn checkout(&self) -> Connection {
        match self {
            Backend::Pool { connections, next } => {
                let i = next.fetch_add(1, Ordering::Relaxed) % connections.len();
                Connection::Single(connections[i].clone())
            }
            Backend::Cluster(conn) => Connection::Cluster(conn.clone()),
        }
    }

    fn all(&self) -> Vec<Connection> {
        match self {
            Backend::Pool { connections, .. } => connections
                .iter()
                .cloned()
                .map(Connection::Single)
                .collect(),
            Backend::Cluster(conn) => vec![Connection::Cluster(conn.clone())],
        }
    }
}

pub struct RedisStore {
    endpoint: String,
    topology: Topology,
    options: StoreOptions,
    backend: RwLock<Option<Backend>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("endpoint", &self.endpoint)
            .field("topology", &self.topology)
            .field("options", &self.options)
            .finish()
    }
}

impl RedisStore {
    /// Open connections and verify them with `PING`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = config.options();
        let endpoint = config.url.clone();
        let connection_error = |e: RedisError| ClientError::Connection {
            endpoint: endpoint.clone(),
            message: e.to_string(),
        };

        let (topology, backend) = if config.cluster {
            let mut nodes = vec![config.url.clone()];
            nodes.extend(config.cluster_nodes.iter().cloned());
            let client = ClusterClient::builder(nodes)
                .connection_timeout(options.connect_timeout)
                .response_timeout(options.request_timeout)
                .build()
                .map_err(connection_error)?;
            let conn = client
                .get_async_connection()
                .await
                .map_err(connection_error)?;
            (Topology::Cluster, Backend::Cluster(conn))
        } else {
            let client = redis::Client::open(config.url.as_str()).map_err(connection_error)?;
            let opens = (0..options.max_pool_size.max(1)).map(|_| {
                client.get_multiplexed_async_connection_with_timeouts(
                    options.request_timeout,
                    options.connect_timeout,
                )
            });
            let connections = try_join_all(opens).await.map_err(connection_error)?;
            (
                Topology::Standalone,
                Backend::Pool {
                    connections,
                    next: AtomicUsize::new(0),
                },
            )
        };

        let store = Self {
            endpoint: endpoint.clone(),
            topology,
            options,
            backend: RwLock::new(Some(backend)),
            keepalive: Mutex::new(None),
        };

        store.ping().await.map_err(|e| ClientError::Connection {
            endpoint: endpoint.clone(),
            message: format!("initial PING failed: {e}"),
        })?;

        if store.options.keepalive {
            store.start_keepalive()?;
        }

        info!(
            endpoint = %store.endpoint,
            topology = ?store.topology,
            pool_size = store.options.max_pool_size,
            keepalive = store.options.keepalive,
            "Connected to Redis"
        );
        Ok(store)
    }

    fn start_keepalive(&self) -> Result<()> {
        let connections = self
            .read_backend()?
            .as_ref()
            .map(Backend::all)
            .unwrap_or_default();
        let interval = self.options.keepalive_interval;
        let timeout = self.options.request_timeout;
        let endpoint = self.endpoint.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let cmd = redis::cmd("PING");
                for (i, conn) in connections.iter().enumerate() {
                    let mut conn = conn.clone();
                    let ping = conn.query::<String>(&cmd);
                    match tokio::time::timeout(timeout, ping).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            warn!(endpoint = %endpoint, connection = i, error = %e, "Keepalive ping failed")
                        }
                        Err(_) => {
                            warn!(endpoint = %endpoint, connection = i, "Keepalive ping timed out")
                        }
                    }
                }
                debug!(endpoint = %endpoint, connections = connections.len(), "Keepalive round done");
            }
        });

        *self.keepalive.lock().map_err(|_| poisoned())? = Some(handle);
        Ok(())
    }

    fn read_backend(&self) -> Result<std::sync::RwLockReadGuard<'_, Option<Backend>>> {
        self.backend.read().map_err(|_| poisoned())
    }

    fn connection(&self) -> Result<Connection> {
        self.read_backend()?
            .as_ref()
            .map(Backend::checkout)
            .ok_or(ClientError::Closed)
    }

    /// Run one command future under the per-request timeout.
    async fn bounded<T>(
        &self,
        operation: &str,
        fut: impl Future<Output = redis::RedisResult<T>>,
    ) -> std::result::Result<redis::RedisResult<T>, ClientError> {
        tokio::time::timeout(self.options.request_timeout, fut)
            .await
            .map_err(|_| {
                ClientError::transient(
                    operation,
                    format!("timed out after {:?}", self.options.request_timeout),
                )
            })
    }
}

fn poisoned() -> ClientError {
    ClientError::Internal("redis store lock poisoned".to_string())
}

fn is_transient(e: &RedisError) -> bool {
    e.is_timeout()
        || e.is_connection_dropped()
        || e.is_connection_refusal()
        || e.is_io_error()
        || matches!(e.code(), Some("TRYAGAIN") | Some("LOADING") | Some("CLUSTERDOWN"))
}

fn cross_slot(e: &RedisError, keys: &[String]) -> Option<ClientError> {
    if e.code() != Some("CROSSSLOT") {
        return None;
    }
    Some(ClientError::CrossSlot {
        first: keys.first().cloned().unwrap_or_default(),
        other: keys.last().cloned().unwrap_or_default(),
    })
}

/// Classify a failed `MGET`: transient failures stay retryable as `Pipeline`,
/// server rejections (`NOAUTH`, `NOPERM`, `WRONGTYPE`, ...) become `Read`.
fn read_error(e: &RedisError, keys: &[String]) -> ClientError {
    if let Some(err) = cross_slot(e, keys) {
        return err;
    }
    if is_transient(e) {
        return ClientError::Pipeline(e.to_string());
    }
    ClientError::Read {
        key: keys.first().cloned().unwrap_or_default(),
        message: e.to_string(),
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn topology(&self) -> Topology {
        self.topology
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());

        match self.bounded("set", conn.query::<()>(&cmd)).await? {
            Ok(()) => Ok(()),
            Err(e) if is_transient(&e) => Err(ClientError::transient("set", e.to_string())),
            Err(e) => Err(ClientError::Write {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<FetchOutcome>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if self.topology.is_cluster() {
            ensure_single_hash_tag(keys)?;
        }
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("MGET");
        cmd.arg(keys);

        let values: Vec<Option<Vec<u8>>> = match self
            .bounded("multi_get", conn.query(&cmd))
            .await
            .map_err(|e| ClientError::Pipeline(e.to_string()))?
        {
            Ok(values) => values,
            Err(e) => return Err(read_error(&e, keys)),
        };

        if values.len() != keys.len() {
            return Err(ClientError::Pipeline(format!(
                "MGET returned {} values for {} keys",
                values.len(),
                keys.len()
            )));
        }
        Ok(values.into_iter().map(FetchOutcome::from).collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        if self.topology.is_cluster() {
            ensure_single_hash_tag(keys)?;
        }
        let mut conn = self.connection()?;
        let mut cmd = redis::cmd("DEL");
        cmd.arg(keys);

        match self.bounded("delete", conn.query::<u64>(&cmd)).await? {
            Ok(n) => Ok(n),
            Err(e) if is_transient(&e) => Err(ClientError::transient("delete", e.to_string())),
            Err(e) => Err(cross_slot(&e, keys).unwrap_or_else(|| ClientError::Write {
                key: keys[0].clone(),
                message: e.to_string(),
            })),
        }
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        if self.topology.is_cluster() {
            return Err(ClientError::Unsupported(
                "scan is not available in cluster mode".to_string(),
            ));
        }
        let mut conn = self.connection()?;
        let mut found = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT);
            let (next, keys): (u64, Vec<String>) =
                match self.bounded("scan", conn.query(&cmd)).await? {
                    Ok(page) => page,
                    Err(e) => return Err(ClientError::transient("scan", e.to_string())),
                };
            found.extend(keys);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        found.sort();
        found.dedup();
        Ok(found)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection()?;
        let cmd = redis::cmd("PING");
        let reply: String = match self.bounded("ping", conn.query(&cmd)).await? {
            Ok(reply) => reply,
            Err(e) => return Err(ClientError::transient("ping", e.to_string())),
        };
        if reply != "PONG" {
            return Err(ClientError::transient("ping", format!("unexpected reply '{reply}'")));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Some(handle) = self.keepalive.lock().map_err(|_| poisoned())?.take() {
            handle.abort();
        }
        let dropped = self.backend.write().map_err(|_| poisoned())?.take();
        if dropped.is_some() {
            info!(endpoint = %self.endpoint, "Closed Redis connections");
        }
        Ok(())
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.keepalive.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_maps_to_connection_error() {
        let config = StoreConfig {
            url: "redis://127.0.0.1:1".to_string(),
            max_pool_size: 1,
            connect_timeout_ms: 200,
            ..StoreConfig::default()
        };
        match RedisStore::connect(&config).await {
            Err(ClientError::Connection { endpoint, .. }) => {
                assert_eq!(endpoint, "redis://127.0.0.1:1")
            }
            other => panic!("expected connection error, got {other:?}"),
        }
    }

    #[test]
    fn test_mget_rejection_is_not_retryable() {
        let keys = vec!["p:{part=00000}:batch=00000".to_string()];

        let auth = RedisError::from((
            redis::ErrorKind::AuthenticationFailed,
            "NOAUTH",
            "Authentication required".to_string(),
        ));
        let err = read_error(&auth, &keys);
        assert!(matches!(&err, ClientError::Read { key, .. } if key == &keys[0]));
        assert!(!err.is_retryable());

        let reset = RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "connection reset by peer",
        ));
        let err = read_error(&reset, &keys);
        assert!(matches!(err, ClientError::Pipeline(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_invalid_url_maps_to_connection_error() {
        let config = StoreConfig {
            url: "redis://bad host:xx".to_string(),
            ..StoreConfig::default()
        };
        assert!(matches!(
            RedisStore::connect(&config).await,
            Err(ClientError::Connection { .. })
        ));
    }
}
