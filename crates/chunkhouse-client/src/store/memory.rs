//! In-process store.
//!
//! Behaves like a Redis server for everything the pipeline uses. In cluster
//! mode keys are spread over shards by hash slot (contiguous slot ranges, as a
//! freshly created Redis Cluster assigns them) and multi-key calls must stay
//! in one hash tag.
//!
//! Test hooks: artificial latency, transient failure injection for `set` and
//! `multi_get`, and permanent rejection of writes and reads.

use super::{ensure_single_hash_tag, FetchOutcome, StoreClient, Topology};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chunkhouse_core::{hash_slot, key::CLUSTER_SLOTS};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;

type Shard = RwLock<BTreeMap<String, Bytes>>;

#[derive(Debug)]
pub struct MemoryStore {
    endpoint: String,
    topology: Topology,
    shards: Vec<Shard>,
    latency: Option<Duration>,
    closed: AtomicBool,
    fail_sets: AtomicUsize,
    fail_multi_gets: AtomicUsize,
    reject_sets: AtomicUsize,
    reject_writes: Mutex<Option<String>>,
    reject_reads: Mutex<Option<String>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Single-endpoint store.
    pub fn new() -> Self {
        Self::with_shards(Topology::Standalone, 1)
    }

    /// Cluster-mode store with `shards` nodes (at least one).
    pub fn cluster(shards: usize) -> Self {
        Self::with_shards(Topology::Cluster, shards.max(1))
    }

    fn with_shards(topology: Topology, shards: usize) -> Self {
        Self {
            endpoint: "memory://".to_string(),
            topology,
            shards: (0..shards).map(|_| RwLock::new(BTreeMap::new())).collect(),
            latency: None,
            closed: AtomicBool::new(false),
            fail_sets: AtomicUsize::new(0),
            fail_multi_gets: AtomicUsize::new(0),
            reject_sets: AtomicUsize::new(0),
            reject_writes: Mutex::new(None),
            reject_reads: Mutex::new(None),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Sleep this long inside every store call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// The next `n` `set` calls fail with a transient error.
    pub fn fail_next_sets(&self, n: usize) {
        self.fail_sets.store(n, Ordering::SeqCst);
    }

    /// The next `n` `multi_get` calls fail as a whole.
    pub fn fail_next_multi_gets(&self, n: usize) {
        self.fail_multi_gets.store(n, Ordering::SeqCst);
    }

    /// Reject every later `set` with a non-transient error, or stop rejecting.
    pub fn reject_writes(&self, message: Option<&str>) {
        if let Ok(mut guard) = self.reject_writes.lock() {
            *guard = message.map(str::to_string);
        }
    }

    /// The next `n` `set` calls are rejected permanently; later ones succeed.
    pub fn reject_next_sets(&self, n: usize) {
        self.reject_sets.store(n, Ordering::SeqCst);
    }

    /// Reject every later `multi_get` with a non-transient error, or stop rejecting.
    pub fn reject_reads(&self, message: Option<&str>) {
        if let Ok(mut guard) = self.reject_reads.lock() {
            *guard = message.map(str::to_string);
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard that owns `key`.
    pub fn shard_of(&self, key: &str) -> usize {
        usize::from(hash_slot(key)) * self.shards.len() / usize::from(CLUSTER_SLOTS)
    }

    /// Number of keys held by each shard.
    pub fn shard_sizes(&self) -> Vec<usize> {
        self.shards
            .iter()
            .map(|s| s.read().map(|m| m.len()).unwrap_or(0))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shard_sizes().iter().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.shard(key)
            .read()
            .map(|m| m.contains_key(key))
            .unwrap_or(false)
    }

    /// Remove one key directly, bypassing the async API.
    pub fn remove(&self, key: &str) -> bool {
        self.shard(key)
            .write()
            .map(|mut m| m.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Every stored key, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .shards
            .iter()
            .filter_map(|s| s.read().ok().map(|m| m.keys().cloned().collect::<Vec<_>>()))
            .flatten()
            .collect();
        keys.sort();
        keys
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.shards[self.shard_of(key)]
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn poisoned() -> ClientError {
        ClientError::Internal("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn topology(&self) -> Topology {
        self.topology
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.ensure_open()?;
        self.simulate_latency().await;

        if Self::take_failure(&self.fail_sets) {
            return Err(ClientError::transient("set", "injected failure"));
        }
        if Self::take_failure(&self.reject_sets) {
            return Err(ClientError::Write {
                key: key.to_string(),
                message: "injected rejection".to_string(),
            });
        }
        let rejection = self.reject_writes.lock().map_err(|_| Self::poisoned())?.clone();
        if let Some(message) = rejection {
            return Err(ClientError::Write {
                key: key.to_string(),
                message,
            });
        }

        self.shard(key)
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<FetchOutcome>> {
        self.ensure_open()?;
        if self.topology.is_cluster() {
            ensure_single_hash_tag(keys)?;
        }
        self.simulate_latency().await;

        if Self::take_failure(&self.fail_multi_gets) {
            return Err(ClientError::Pipeline("injected failure".to_string()));
        }
        let rejection = self.reject_reads.lock().map_err(|_| Self::poisoned())?.clone();
        if let Some(message) = rejection {
            return Err(ClientError::Read {
                key: keys.first().cloned().unwrap_or_default(),
                message,
            });
        }

        keys.iter()
            .map(|key| {
                let shard = self.shard(key).read().map_err(|_| Self::poisoned())?;
                Ok(match shard.get(key) {
                    Some(value) => FetchOutcome::Present(value.clone()),
                    None => FetchOutcome::Absent,
                })
            })
            .collect()
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.ensure_open()?;
        if self.topology.is_cluster() {
            ensure_single_hash_tag(keys)?;
        }
        self.simulate_latency().await;

        let mut removed = 0;
        for key in keys {
            let mut shard = self.shard(key).write().map_err(|_| Self::poisoned())?;
            if shard.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        if self.topology.is_cluster() {
            return Err(ClientError::Unsupported(
                "scan is not available in cluster mode".to_string(),
            ));
        }
        self.simulate_latency().await;

        let pattern: Vec<char> = pattern.chars().collect();
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| glob_match(&pattern, &k.chars().collect::<Vec<_>>()))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Redis-style glob: `*`, `?`, `[...]` and backslash escapes.
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|skip| glob_match(rest, &text[skip..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some(('\\', rest)) if !rest.is_empty() => {
            text.first() == Some(&rest[0]) && glob_match(&rest[1..], &text[1..])
        }
        Some(('[', rest)) => {
            let Some(close) = rest.iter().position(|&c| c == ']') else {
                return text.first() == Some(&'[') && glob_match(rest, &text[1..]);
            };
            let Some(&c) = text.first() else {
                return false;
            };
            let class = &rest[..close];
            let (negate, class) = match class.split_first() {
                Some(('^', tail)) => (true, tail),
                _ => (false, class),
            };
            let mut hit = false;
            let mut i = 0;
            while i < class.len() {
                if i + 2 < class.len() && class[i + 1] == '-' {
                    hit |= class[i] <= c && c <= class[i + 2];
                    i += 3;
                } else {
                    hit |= class[i] == c;
                    i += 1;
                }
            }
            hit != negate && glob_match(&rest[close + 1..], &text[1..])
        }
        Some((&literal, rest)) => text.first() == Some(&literal) && glob_match(rest, &text[1..]),
    }
}
