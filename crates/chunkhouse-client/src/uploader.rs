//! Streaming Uploader
//!
//! Pushes every chunk of a dataset into the store with two independent
//! bounds:
//!
//! - **Admission** (`concurrency_limit`): a semaphore permit is taken before a
//!   write task is spawned and released when the write finishes, so at most
//!   that many writes talk to the store at once.
//! - **Drain** (`drain_batch_size`): spawned task handles are collected until
//!   that many are pending, then awaited as a group before more are issued.
//!   Memory for pending tasks stays O(drain_batch_size) however many batches
//!   the source yields.
//!
//! ## Flow
//!
//! ```text
//! batches ──► key + encode ──► permit ──► spawn(set with retry)
//!                                              │
//!                         pending handles ◄────┘
//!                               │ len == drain_batch_size
//!                               ▼
//!                         join_all, tally, continue
//! ```
//!
//! Encoding happens before a permit is taken, so no CPU work runs while
//! holding an I/O slot.
//!
//! ## Failure
//!
//! Each write runs under the retry policy. The first write that still fails
//! records its error as soon as it happens; the loop checks for it before
//! encoding and again after every permit, so nothing new is spawned. Writes
//! already in flight finish, and the first recorded error is returned. Chunks already written stay in place;
//! keys are deterministic, so re-running the upload overwrites them.

use crate::config::{ChunkhouseConfig, UploadConfig};
use crate::error::{ClientError, Result};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::StoreClient;
use chunkhouse_core::{validate_shape, ArrowIpcCodec, Batch, ChunkCodec, ChunkId, Dataset, KeySpace};
use chunkhouse_observability::metrics::{
    BYTES_WRITTEN_TOTAL, CHUNKS_WRITTEN_TOTAL, UPLOAD_ERRORS_TOTAL,
};
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

/// Progress callback, invoked once per chunk written.
pub trait UploadObserver: Send + Sync {
    fn on_chunk_written(&self, id: ChunkId, bytes: usize);
}

impl<F> UploadObserver for F
where
    F: Fn(ChunkId, usize) + Send + Sync,
{
    fn on_chunk_written(&self, id: ChunkId, bytes: usize) {
        self(id, bytes)
    }
}

/// Totals of a finished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub chunks_written: u64,
    pub bytes_written: u64,
    pub rows_written: u64,
    /// Most task handles held at once; never above `drain_batch_size`.
    pub peak_pending: usize,
    pub elapsed: Duration,
}

struct Written {
    bytes: usize,
    rows: usize,
}

pub struct StreamingUploader {
    store: Arc<dyn StoreClient>,
    codec: Arc<dyn ChunkCodec>,
    config: UploadConfig,
    retry: RetryPolicy,
    observer: Option<Arc<dyn UploadObserver>>,
}

impl std::fmt::Debug for StreamingUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingUploader")
            .field("endpoint", &self.store.endpoint())
            .field("config", &self.config)
            .field("retry", &self.retry)
            .finish()
    }
}

impl StreamingUploader {
    pub fn builder() -> StreamingUploaderBuilder {
        StreamingUploaderBuilder::new()
    }

    pub fn config(&self) -> &UploadConfig {
        &self.config
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Upload a whole dataset under `prefix`.
    pub async fn upload(&self, dataset: &Dataset, prefix: &str) -> Result<UploadReport> {
        info!(
            prefix,
            partitions = dataset.partition_count(),
            batches_per_partition = dataset.batches_per_partition(),
            rows = dataset.total_rows(),
            "Starting upload"
        );
        self.upload_batches(prefix, dataset.batches().iter().cloned())
            .await
    }

    /// Upload tagged batches from any source, in the order it yields them.
    pub async fn upload_batches(
        &self,
        prefix: &str,
        batches: impl IntoIterator<Item = Batch>,
    ) -> Result<UploadReport> {
        let started = Instant::now();
        let keys = KeySpace::new(prefix);
        let gate = Arc::new(Semaphore::new(self.config.concurrency_limit));
        let failure = Arc::new(FirstFailure::default());
        let drain_size = self.config.drain_batch_size;

        let mut pending: Vec<JoinHandle<Option<Written>>> = Vec::with_capacity(drain_size);
        let mut report = UploadReport {
            chunks_written: 0,
            bytes_written: 0,
            rows_written: 0,
            peak_pending: 0,
            elapsed: Duration::ZERO,
        };

        for batch in batches {
            if failure.is_set() {
                break;
            }
            match self.submit(&keys, &gate, &failure, batch).await {
                Ok(Some(handle)) => pending.push(handle),
                Ok(None) => break,
                Err(e) => {
                    failure.record(e);
                    break;
                }
            }
            report.peak_pending = report.peak_pending.max(pending.len());

            if pending.len() >= drain_size {
                debug!(prefix, pending = pending.len(), "Draining write group");
                Self::drain(&mut pending, &mut report, &failure).await;
            }
        }
        Self::drain(&mut pending, &mut report, &failure).await;
        report.elapsed = started.elapsed();

        if let Some(e) = failure.take() {
            UPLOAD_ERRORS_TOTAL.with_label_values(&[e.kind()]).inc();
            error!(
                prefix,
                chunks_written = report.chunks_written,
                error = %e,
                "Upload aborted"
            );
            return Err(e);
        }

        CHUNKS_WRITTEN_TOTAL
            .with_label_values(&[prefix])
            .inc_by(report.chunks_written);
        BYTES_WRITTEN_TOTAL
            .with_label_values(&[prefix])
            .inc_by(report.bytes_written);
        info!(
            prefix,
            chunks = report.chunks_written,
            bytes = report.bytes_written,
            rows = report.rows_written,
            peak_pending = report.peak_pending,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Upload complete"
        );
        Ok(report)
    }

    /// Encode one batch, wait for admission, and spawn its write.
    ///
    /// Returns `None` when another write failed while this one waited for a
    /// permit.
    async fn submit(
        &self,
        keys: &KeySpace,
        gate: &Arc<Semaphore>,
        failure: &Arc<FirstFailure>,
        batch: Batch,
    ) -> Result<Option<JoinHandle<Option<Written>>>> {
        validate_shape(
            batch.id.partition.saturating_add(1),
            batch.id.batch.saturating_add(1),
        )?;
        let key = keys.chunk_key(batch.id);
        let payload = self.codec.encode(&batch.data)?;
        let rows = batch.num_rows();
        let id = batch.id;

        let permit = Arc::clone(gate)
            .acquire_owned()
            .await
            .map_err(|e| ClientError::Internal(format!("admission gate closed: {e}")))?;
        if failure.is_set() {
            debug!(key = %key, "Not issuing write after failure");
            return Ok(None);
        }

        let store = Arc::clone(&self.store);
        let retry = self.retry.clone();
        let observer = self.observer.clone();
        let failure = Arc::clone(failure);

        Ok(Some(tokio::spawn(async move {
            let _permit = permit;
            let bytes = payload.len();
            if let Err(e) = run_with_retry(&retry, "set", || store.set(&key, payload.clone())).await {
                failure.record(e);
                return None;
            }
            if let Some(observer) = observer {
                observer.on_chunk_written(id, bytes);
            }
            Some(Written { bytes, rows })
        })))
    }

    async fn drain(
        pending: &mut Vec<JoinHandle<Option<Written>>>,
        report: &mut UploadReport,
        failure: &FirstFailure,
    ) {
        for outcome in join_all(pending.drain(..)).await {
            match outcome {
                Ok(Some(written)) => {
                    report.chunks_written += 1;
                    report.bytes_written += written.bytes as u64;
                    report.rows_written += written.rows as u64;
                }
                Ok(None) => {}
                Err(e) => failure.record(ClientError::from(e)),
            }
        }
    }
}

/// The first error of an upload, in the order errors actually happen.
///
/// Write tasks record into it as they fail; the submit loop polls it so no
/// new write is issued once it is set.
#[derive(Debug, Default)]
struct FirstFailure {
    set: AtomicBool,
    error: Mutex<Option<ClientError>>,
}

impl FirstFailure {
    fn record(&self, error: ClientError) {
        let Ok(mut slot) = self.error.lock() else {
            self.set.store(true, Ordering::SeqCst);
            return;
        };
        if slot.is_none() {
            *slot = Some(error);
        } else {
            debug!(error = %error, "Later write failure ignored");
        }
        self.set.store(true, Ordering::SeqCst);
    }

    fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    fn take(&self) -> Option<ClientError> {
        if !self.is_set() {
            return None;
        }
        let taken = self.error.lock().ok().and_then(|mut slot| slot.take());
        Some(taken.unwrap_or_else(|| {
            ClientError::Internal("upload failure slot poisoned".to_string())
        }))
    }
}

/// Builder for [`StreamingUploader`].
///
/// ```ignore
/// let uploader = StreamingUploader::builder()
///     .store(store)
///     .concurrency_limit(256)
///     .drain_batch_size(100)
///     .retry_policy(RetryPolicy::default())
///     .build()?;
/// ```
pub struct StreamingUploaderBuilder {
    store: Option<Arc<dyn StoreClient>>,
    codec: Arc<dyn ChunkCodec>,
    config: UploadConfig,
    retry: RetryPolicy,
    observer: Option<Arc<dyn UploadObserver>>,
}

impl StreamingUploaderBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            codec: Arc::new(ArrowIpcCodec::default()),
            config: UploadConfig::default(),
            retry: RetryPolicy::default(),
            observer: None,
        }
    }

    /// Codec compression, upload bounds and retry policy from a loaded file.
    pub fn from_config(config: &ChunkhouseConfig) -> Self {
        Self::new()
            .codec(Arc::new(ArrowIpcCodec::new(config.compression)))
            .config(config.upload)
            .retry_policy(RetryPolicy::from(&config.retry))
    }

    /// Set the store handle (required).
    pub fn store(mut self, store: Arc<dyn StoreClient>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the chunk codec (default: Arrow IPC with zstd).
    pub fn codec(mut self, codec: Arc<dyn ChunkCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(mut self, config: UploadConfig) -> Self {
        self.config = config;
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.config.concurrency_limit = limit;
        self
    }

    pub fn drain_batch_size(mut self, size: usize) -> Self {
        self.config.drain_batch_size = size;
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn observer(mut self, observer: Arc<dyn UploadObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<StreamingUploader> {
        let store = self
            .store
            .ok_or_else(|| ClientError::Config("store is required".to_string()))?;
        self.config.validate()?;

        Ok(StreamingUploader {
            store,
            codec: self.codec,
            config: self.config,
            retry: self.retry,
            observer: self.observer,
        })
    }
}

impl Default for StreamingUploaderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use arrow::array::Int64Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn dataset(partitions: u32, batches: u32) -> Dataset {
        let schema = Arc::new(Schema::new(vec![Field::new("id64", DataType::Int64, false)]));
        let source = (0..i64::from(partitions * batches)).map(|i| {
            RecordBatch::try_new(schema.clone(), vec![Arc::new(Int64Array::from(vec![i, i]))])
                .unwrap()
        });
        Dataset::from_record_batches(source, batches).unwrap()
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_build_requires_store_and_valid_limits() {
        assert!(matches!(
            StreamingUploader::builder().build(),
            Err(ClientError::Config(_))
        ));
        let store: Arc<dyn StoreClient> = Arc::new(MemoryStore::new());
        assert!(StreamingUploader::builder()
            .store(store)
            .drain_batch_size(0)
            .build()
            .is_err());
    }

    #[tokio::test]
    async fn test_writes_every_chunk_under_its_key() {
        let memory = Arc::new(MemoryStore::new());
        let uploader = StreamingUploader::builder()
            .store(memory.clone())
            .drain_batch_size(4)
            .build()
            .unwrap();

        let report = uploader.upload(&dataset(3, 5), "unit:up").await.unwrap();
        assert_eq!(report.chunks_written, 15);
        assert_eq!(report.rows_written, 30);
        assert!(report.peak_pending <= 4);
        assert_eq!(memory.len(), 15);
        assert!(memory.contains_key("unit:up:{part=00002}:batch=00004"));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let memory = Arc::new(MemoryStore::new());
        memory.fail_next_sets(2);
        let uploader = StreamingUploader::builder()
            .store(memory.clone())
            .retry_policy(fast_retry())
            .build()
            .unwrap();

        let report = uploader.upload(&dataset(1, 4), "unit:retry").await.unwrap();
        assert_eq!(report.chunks_written, 4);
        assert_eq!(memory.len(), 4);
    }

    #[tokio::test]
    async fn test_rejected_write_aborts_upload() {
        let memory = Arc::new(MemoryStore::new());
        memory.reject_writes(Some("NOAUTH"));
        let uploader = StreamingUploader::builder()
            .store(memory.clone())
            .retry_policy(fast_retry())
            .drain_batch_size(2)
            .build()
            .unwrap();

        let err = uploader.upload(&dataset(4, 4), "unit:reject").await.unwrap_err();
        assert!(matches!(err, ClientError::Write { .. }));
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn test_observer_sees_every_chunk() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let observer = move |_id: ChunkId, _bytes: usize| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        let uploader = StreamingUploader::builder()
            .store(Arc::new(MemoryStore::new()))
            .observer(Arc::new(observer))
            .build()
            .unwrap();

        uploader.upload(&dataset(2, 3), "unit:obs").await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
