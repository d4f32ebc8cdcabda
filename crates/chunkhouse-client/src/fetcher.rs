//! Parallel Fetcher
//!
//! Reads a set of partitions back out of the store and reassembles them into
//! one ordered [`Table`].
//!
//! ## Pipeline
//!
//! ```text
//! partitions ──► keys per partition ──► groups of pipeline_size keys
//!                                                │
//!                       permit (concurrency_limit) + spawn multi_get
//!                                                │
//!                  outcomes: present payloads / absent chunk ids
//!                                                │
//!             sort by (partition, batch) ──► decode (decode_concurrency)
//!                                                │
//!                                       AssembledTable
//! ```
//!
//! A group never mixes partitions, so every multi-get stays inside one hash
//! tag and is valid against a cluster.
//!
//! ## Partial Data
//!
//! Absent keys are normal. They are counted and listed on the result, never
//! raised. Fetching partitions that hold nothing at all yields an empty table
//! with `present == 0`.
//!
//! ## Ordering
//!
//! Multi-gets complete in any order. The assembled table is always in
//! ascending `(partition, batch)` order because results are sorted before
//! decoding and decoded in that order.

use crate::config::{ChunkhouseConfig, FetchConfig};
use crate::discovery::discover_partitions;
use crate::error::{ClientError, Result};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::{FetchOutcome, StoreClient};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chunkhouse_core::{validate_shape, ArrowIpcCodec, ChunkCodec, ChunkId, KeySpace, Table};
use chunkhouse_observability::metrics::{
    BYTES_FETCHED_TOTAL, CHUNKS_FETCHED_TOTAL, DECODE_FAILURES_TOTAL, MULTI_GET_LATENCY,
};
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Which partitions to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionSelection {
    All,
    Ids(Vec<u32>),
}

impl FromStr for PartitionSelection {
    type Err = ClientError;

    /// `"all"` or a comma-separated id list such as `"0,1,2"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(PartitionSelection::All);
        }
        let ids = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u32>().map_err(|_| {
                    ClientError::Config(format!("invalid partition id '{part}'"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Err(ClientError::Config("no partition ids given".to_string()));
        }
        Ok(PartitionSelection::Ids(ids))
    }
}

/// A present chunk that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeFailure {
    pub id: ChunkId,
    pub key: String,
    pub message: String,
}

/// Result of a fetch.
#[derive(Debug, Clone)]
pub struct AssembledTable {
    /// Decoded chunks in `(partition, batch)` order.
    pub table: Table,
    pub requested: usize,
    pub present: usize,
    pub absent: usize,
    pub absent_chunks: Vec<ChunkId>,
    pub decode_failures: Vec<DecodeFailure>,
    pub fetch_elapsed: Duration,
    pub decode_elapsed: Duration,
}

impl AssembledTable {
    fn empty() -> Self {
        Self {
            table: Table::empty(),
            requested: 0,
            present: 0,
            absent: 0,
            absent_chunks: Vec::new(),
            decode_failures: Vec::new(),
            fetch_elapsed: Duration::ZERO,
            decode_elapsed: Duration::ZERO,
        }
    }

    /// Every requested chunk was present and decoded.
    pub fn is_complete(&self) -> bool {
        self.absent == 0 && self.decode_failures.is_empty()
    }
}

/// Keys of one multi-get: a run of batches inside one partition.
struct KeyGroup {
    partition: u32,
    first_batch: u32,
    keys: Vec<String>,
}

struct GroupResult {
    partition: u32,
    first_batch: u32,
    keys: Vec<String>,
    outcomes: Vec<FetchOutcome>,
}

pub struct ParallelFetcher {
    store: Arc<dyn StoreClient>,
    codec: Arc<dyn ChunkCodec>,
    config: FetchConfig,
    retry: RetryPolicy,
}

impl std::fmt::Debug for ParallelFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelFetcher")
            .field("endpoint", &self.store.endpoint())
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ParallelFetcher {
    pub fn builder() -> ParallelFetcherBuilder {
        ParallelFetcherBuilder::new()
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Fetch every partition [`discover_partitions`] finds under `prefix`.
    pub async fn fetch_all(&self, prefix: &str, batches_per_partition: u32) -> Result<AssembledTable> {
        let keys = KeySpace::new(prefix);
        let partitions = discover_partitions(self.store.as_ref(), &keys).await?;
        if partitions.is_empty() {
            info!(prefix, "No partitions found");
            return Ok(AssembledTable::empty());
        }
        self.fetch(prefix, &partitions, batches_per_partition).await
    }

    pub async fn fetch_selection(
        &self,
        prefix: &str,
        selection: &PartitionSelection,
        batches_per_partition: u32,
    ) -> Result<AssembledTable> {
        match selection {
            PartitionSelection::All => self.fetch_all(prefix, batches_per_partition).await,
            PartitionSelection::Ids(ids) => self.fetch(prefix, ids, batches_per_partition).await,
        }
    }

    /// Fetch `partitions` (deduplicated, any order) of a dataset stored under `prefix`.
    pub async fn fetch(
        &self,
        prefix: &str,
        partitions: &[u32],
        batches_per_partition: u32,
    ) -> Result<AssembledTable> {
        if batches_per_partition == 0 {
            return Err(ClientError::Config(
                "batches_per_partition must be at least 1".to_string(),
            ));
        }
        let partitions: BTreeSet<u32> = partitions.iter().copied().collect();
        if let Some(&max) = partitions.last() {
            validate_shape(max.saturating_add(1), batches_per_partition)?;
        }

        let keys = KeySpace::new(prefix);
        let groups = self.plan(&keys, &partitions, batches_per_partition);
        let requested = partitions.len() * batches_per_partition as usize;
        info!(
            prefix,
            partitions = partitions.len(),
            requested,
            groups = groups.len(),
            "Starting fetch"
        );

        let fetch_started = Instant::now();
        let results = self.run_groups(groups).await?;
        let fetch_elapsed = fetch_started.elapsed();

        let mut present: Vec<(ChunkId, String, Bytes)> = Vec::new();
        let mut absent_chunks = Vec::new();
        for group in results {
            for (offset, (key, outcome)) in group.keys.into_iter().zip(group.outcomes).enumerate() {
                let id = ChunkId::new(group.partition, group.first_batch + offset as u32);
                match outcome {
                    FetchOutcome::Present(bytes) => present.push((id, key, bytes)),
                    FetchOutcome::Absent => absent_chunks.push(id),
                }
            }
        }
        present.sort_by_key(|(id, _, _)| *id);
        absent_chunks.sort();

        let bytes_fetched: usize = present.iter().map(|(_, _, b)| b.len()).sum();
        CHUNKS_FETCHED_TOTAL
            .with_label_values(&["present"])
            .inc_by(present.len() as u64);
        CHUNKS_FETCHED_TOTAL
            .with_label_values(&["absent"])
            .inc_by(absent_chunks.len() as u64);
        BYTES_FETCHED_TOTAL.inc_by(bytes_fetched as u64);

        if !absent_chunks.is_empty() {
            warn!(
                prefix,
                absent = absent_chunks.len(),
                requested,
                first_absent = %absent_chunks[0],
                "Some requested chunks are absent"
            );
        }

        let present_count = present.len();
        let decode_started = Instant::now();
        let (table, decode_failures) = self.decode_all(present).await?;
        let decode_elapsed = decode_started.elapsed();

        let assembled = AssembledTable {
            table,
            requested,
            present: present_count,
            absent: absent_chunks.len(),
            absent_chunks,
            decode_failures,
            fetch_elapsed,
            decode_elapsed,
        };
        info!(
            prefix,
            requested = assembled.requested,
            present = assembled.present,
            absent = assembled.absent,
            decode_failures = assembled.decode_failures.len(),
            rows = assembled.table.num_rows(),
            bytes = bytes_fetched,
            fetch_ms = fetch_elapsed.as_millis() as u64,
            decode_ms = decode_elapsed.as_millis() as u64,
            "Fetch complete"
        );
        Ok(assembled)
    }

    fn plan(&self, keys: &KeySpace, partitions: &BTreeSet<u32>, batches: u32) -> Vec<KeyGroup> {
        let pipeline = self.config.pipeline_size;
        let mut groups = Vec::new();
        for &partition in partitions {
            let all = keys.partition_keys(partition, batches);
            for (i, chunk) in all.chunks(pipeline).enumerate() {
                groups.push(KeyGroup {
                    partition,
                    first_batch: (i * pipeline) as u32,
                    keys: chunk.to_vec(),
                });
            }
        }
        groups
    }

    /// Issue every group under the admission gate.
    ///
    /// After the first group fails for good no further groups are started;
    /// groups already running finish before the error is returned.
    async fn run_groups(&self, groups: Vec<KeyGroup>) -> Result<Vec<GroupResult>> {
        let gate = Arc::new(Semaphore::new(self.config.concurrency_limit));
        let failed = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(groups.len());

        for group in groups {
            let permit = Arc::clone(&gate)
                .acquire_owned()
                .await
                .map_err(|e| ClientError::Internal(format!("admission gate closed: {e}")))?;
            if failed.load(Ordering::SeqCst) {
                debug!("Skipping remaining groups after failure");
                break;
            }

            let store = Arc::clone(&self.store);
            let retry = self.retry.clone();
            let failed = Arc::clone(&failed);
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let timer = MULTI_GET_LATENCY.start_timer();
                let result =
                    run_with_retry(&retry, "multi_get", || store.multi_get(&group.keys)).await;
                timer.observe_duration();

                let outcomes = match result {
                    Ok(outcomes) if outcomes.len() == group.keys.len() => outcomes,
                    Ok(outcomes) => {
                        failed.store(true, Ordering::SeqCst);
                        return Err(ClientError::Pipeline(format!(
                            "{} outcomes for {} keys starting at '{}'",
                            outcomes.len(),
                            group.keys.len(),
                            group.keys[0]
                        )));
                    }
                    Err(e) => {
                        failed.store(true, Ordering::SeqCst);
                        return Err(e);
                    }
                };
                debug!(
                    partition = group.partition,
                    first_batch = group.first_batch,
                    keys = group.keys.len(),
                    "Multi-get group done"
                );
                Ok(GroupResult {
                    partition: group.partition,
                    first_batch: group.first_batch,
                    keys: group.keys,
                    outcomes,
                })
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        let mut first_error = None;
        for outcome in join_all(handles).await {
            match outcome.map_err(ClientError::from).and_then(|r| r) {
                Ok(group) => results.push(group),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            error!(error = %e, "Fetch aborted");
            return Err(e);
        }
        Ok(results)
    }

    /// Decode sorted payloads on the blocking pool, keeping their order.
    async fn decode_all(
        &self,
        present: Vec<(ChunkId, String, Bytes)>,
    ) -> Result<(Table, Vec<DecodeFailure>)> {
        let decoded: Vec<_> = stream::iter(present)
            .map(|(id, key, bytes)| {
                let codec = Arc::clone(&self.codec);
                async move {
                    let result = tokio::task::spawn_blocking(move || codec.decode(&bytes))
                        .await
                        .map_err(|e| e.to_string())
                        .and_then(|r| r.map_err(|e| e.to_string()));
                    (id, key, result)
                }
            })
            .buffered(self.config.decode_concurrency)
            .collect()
            .await;

        let mut schema: Option<SchemaRef> = None;
        let mut batches: Vec<RecordBatch> = Vec::new();
        let mut failures = Vec::new();

        for (id, key, result) in decoded {
            let outcome = result.and_then(|decoded| {
                let expected = match (&schema, decoded.first()) {
                    (Some(s), _) => Arc::clone(s),
                    (None, Some(first)) => first.schema(),
                    (None, None) => return Ok(decoded),
                };
                if decoded.iter().any(|b| b.schema() != expected) {
                    return Err("schema differs from earlier chunks".to_string());
                }
                schema.get_or_insert(expected);
                Ok(decoded)
            });

            match outcome {
                Ok(decoded) => batches.extend(decoded),
                Err(message) => {
                    DECODE_FAILURES_TOTAL.inc();
                    warn!(
                        key = %key,
                        partition = id.partition,
                        batch = id.batch,
                        error = %message,
                        "Failed to decode chunk"
                    );
                    if self.config.strict_decode {
                        return Err(ClientError::Decode {
                            key,
                            partition: id.partition,
                            batch: id.batch,
                            message,
                        });
                    }
                    failures.push(DecodeFailure { id, key, message });
                }
            }
        }

        let table = match schema {
            Some(schema) => Table::try_new(schema, batches)?,
            None => Table::empty(),
        };
        Ok((table, failures))
    }
}

/// Builder for [`ParallelFetcher`].
pub struct ParallelFetcherBuilder {
    store: Option<Arc<dyn StoreClient>>,
    codec: Arc<dyn ChunkCodec>,
    config: FetchConfig,
    retry: RetryPolicy,
}

impl ParallelFetcherBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            codec: Arc::new(ArrowIpcCodec::default()),
            config: FetchConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    /// Codec, fetch bounds and retry policy from a loaded file.
    pub fn from_config(config: &ChunkhouseConfig) -> Self {
        Self::new()
            .codec(Arc::new(ArrowIpcCodec::new(config.compression)))
            .config(config.fetch)
            .retry_policy(RetryPolicy::from(&config.retry))
    }

    /// Set the store handle (required).
    pub fn store(mut self, store: Arc<dyn StoreClient>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn codec(mut self, codec: Arc<dyn ChunkCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(mut self, config: FetchConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pipeline_size(mut self, size: usize) -> Self {
        self.config.pipeline_size = size;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn decode_concurrency(mut self, limit: usize) -> Self {
        self.config.decode_concurrency = limit;
        self
    }

    pub fn strict_decode(mut self, strict: bool) -> Self {
        self.config.strict_decode = strict;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn build(self) -> Result<ParallelFetcher> {
        let store = self
            .store
            .ok_or_else(|| ClientError::Config("store is required".to_string()))?;
        self.config.validate()?;

        Ok(ParallelFetcher {
            store,
            codec: self.codec,
            config: self.config,
            retry: self.retry,
        })
    }
}

impl Default for ParallelFetcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_partition_selection_parsing() {
        assert_eq!("all".parse::<PartitionSelection>().unwrap(), PartitionSelection::All);
        assert_eq!(
            " 0, 1,2 ".parse::<PartitionSelection>().unwrap(),
            PartitionSelection::Ids(vec![0, 1, 2])
        );
        assert!("0,x".parse::<PartitionSelection>().is_err());
        assert!("".parse::<PartitionSelection>().is_err());
    }

    #[test]
    fn test_plan_splits_partitions_into_pipeline_groups() {
        let fetcher = ParallelFetcher::builder()
            .store(Arc::new(MemoryStore::new()))
            .pipeline_size(4)
            .build()
            .unwrap();
        let keys = KeySpace::new("p");
        let groups = fetcher.plan(&keys, &BTreeSet::from([3, 1]), 10);

        let shape: Vec<(u32, u32, usize)> = groups
            .iter()
            .map(|g| (g.partition, g.first_batch, g.keys.len()))
            .collect();
        assert_eq!(
            shape,
            vec![(1, 0, 4), (1, 4, 4), (1, 8, 2), (3, 0, 4), (3, 4, 4), (3, 8, 2)]
        );
        assert_eq!(groups[4].keys[0], keys.key(3, 4));
    }

    #[tokio::test]
    async fn test_fetch_of_missing_dataset_is_empty_not_error() {
        let fetcher = ParallelFetcher::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        let result = fetcher.fetch("nothing:here", &[0, 1], 3).await.unwrap();
        assert_eq!(result.requested, 6);
        assert_eq!(result.present, 0);
        assert_eq!(result.absent, 6);
        assert!(result.table.is_empty());

        let all = fetcher.fetch_all("nothing:here", 3).await.unwrap();
        assert_eq!(all.requested, 0);
    }

    #[tokio::test]
    async fn test_rejects_zero_batches_per_partition() {
        let fetcher = ParallelFetcher::builder()
            .store(Arc::new(MemoryStore::new()))
            .build()
            .unwrap();
        assert!(matches!(
            fetcher.fetch("p", &[0], 0).await,
            Err(ClientError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_undecodable_chunk_is_reported_or_fatal_in_strict_mode() {
        let memory = Arc::new(MemoryStore::new());
        memory
            .set("bad:{part=00000}:batch=00000", Bytes::from_static(b"garbage"))
            .await
            .unwrap();

        let lenient = ParallelFetcher::builder()
            .store(memory.clone())
            .build()
            .unwrap();
        let result = lenient.fetch("bad", &[0], 1).await.unwrap();
        assert_eq!(result.present, 1);
        assert_eq!(result.decode_failures.len(), 1);
        assert_eq!(result.decode_failures[0].id, ChunkId::new(0, 0));
        assert!(!result.is_complete());

        let strict = ParallelFetcher::builder()
            .store(memory)
            .strict_decode(true)
            .build()
            .unwrap();
        assert!(matches!(
            strict.fetch("bad", &[0], 1).await,
            Err(ClientError::Decode { partition: 0, batch: 0, .. })
        ));
    }
}
