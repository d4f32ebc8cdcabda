//! Shared helpers for the client integration tests.

#![allow(dead_code)]

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use bytes::Bytes;
use chunkhouse_client::{FetchOutcome, MemoryStore, Result, StoreClient, Topology};
use chunkhouse_core::{Dataset, PARTITION_COLUMN};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Tracks how many calls of one kind are running at once.
#[derive(Debug, Default)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    total: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.total.fetch_add(1, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }
}

/// [`MemoryStore`] wrapper recording concurrency of writes and multi-gets.
#[derive(Debug)]
pub struct CountingStore {
    pub inner: Arc<MemoryStore>,
    pub sets: Gauge,
    pub multi_gets: Gauge,
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self::from_shared(Arc::new(inner))
    }

    /// Count calls against a store the test keeps its own handle to.
    pub fn from_shared(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            sets: Gauge::default(),
            multi_gets: Gauge::default(),
        }
    }
}

#[async_trait]
impl StoreClient for CountingStore {
    fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    fn topology(&self) -> Topology {
        self.inner.topology()
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.sets.enter();
        let result = self.inner.set(key, value).await;
        self.sets.exit();
        result
    }

    async fn multi_get(&self, keys: &[String]) -> Result<Vec<FetchOutcome>> {
        self.multi_gets.enter();
        let result = self.inner.multi_get(keys).await;
        self.multi_gets.exit();
        result
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        self.inner.delete(keys).await
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        self.inner.scan(pattern).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub fn schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(PARTITION_COLUMN, DataType::Int64, false),
        Field::new("id", DataType::Int64, false),
        Field::new("name", DataType::Utf8, true),
        Field::new("score", DataType::Float64, true),
    ]))
}

/// One batch of `rows` rows whose ids start at `first_id`.
pub fn record_batch(partition: i64, first_id: i64, rows: usize) -> RecordBatch {
    let ids: Vec<i64> = (first_id..first_id + rows as i64).collect();
    let names: Vec<Option<String>> = ids
        .iter()
        .map(|id| (id % 7 != 0).then(|| format!("row-{id}")))
        .collect();
    let scores: Vec<f64> = ids.iter().map(|id| *id as f64 * 0.5).collect();

    RecordBatch::try_new(
        schema(),
        vec![
            Arc::new(Int64Array::from(vec![partition; rows])),
            Arc::new(Int64Array::from(ids)),
            Arc::new(StringArray::from(names)),
            Arc::new(Float64Array::from(scores)),
        ],
    )
    .unwrap()
}

/// Dense dataset with distinct ids across every row.
pub fn dataset(partitions: u32, batches_per_partition: u32, rows_per_batch: usize) -> Dataset {
    let mut batches = Vec::new();
    let mut next_id = 0;
    for p in 0..partitions {
        for _ in 0..batches_per_partition {
            batches.push(record_batch(p as i64, next_id, rows_per_batch));
            next_id += rows_per_batch as i64;
        }
    }
    Dataset::from_record_batches(batches, batches_per_partition).unwrap()
}
