//! Chunkhouse Client - Streaming Upload and Parallel Fetch
//!
//! This crate moves chunked columnar datasets in and out of a Redis-compatible
//! key-value store. It handles connection setup for single endpoints and
//! clusters, bounded-concurrency writes, pipelined reads, retries with
//! backoff, and reassembly of partial data.
//!
//! # Examples
//!
//! ## Upload
//!
//! ```ignore
//! use chunkhouse_client::{store, ChunkhouseConfig, StreamingUploader};
//!
//! let config = ChunkhouseConfig::from_file("chunkhouse.toml")?;
//! let store = store::connect(&config.store).await?;
//!
//! let uploader = StreamingUploader::builder()
//!     .store(store.clone())
//!     .config(config.upload.clone())
//!     .build()?;
//!
//! let report = uploader.upload(&dataset, &config.key_prefix).await?;
//! println!("wrote {} chunks", report.chunks_written);
//! ```
//!
//! ## Fetch
//!
//! ```ignore
//! use chunkhouse_client::ParallelFetcher;
//!
//! let fetcher = ParallelFetcher::builder()
//!     .store(store.clone())
//!     .pipeline_size(64)
//!     .build()?;
//!
//! let assembled = fetcher.fetch("demo:v1", &[0, 1], 3).await?;
//! println!("{} of {} chunks present", assembled.present, assembled.requested);
//! store.close().await?;
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod fetcher;
pub mod retry;
pub mod store;
pub mod uploader;

pub use config::{ChunkhouseConfig, FetchConfig, RetryConfig, StoreConfig, UploadConfig};
pub use discovery::{discover_partitions, purge_by_scan, purge_dataset};
pub use error::{ClientError, Result};
pub use fetcher::{
    AssembledTable, DecodeFailure, ParallelFetcher, ParallelFetcherBuilder, PartitionSelection,
};
pub use retry::{gave_up_after_retries, run_with_retry, RetryPolicy};
pub use store::{connect, FetchOutcome, MemoryStore, RedisStore, StoreClient, StoreOptions, Topology};
pub use uploader::{StreamingUploader, StreamingUploaderBuilder, UploadObserver, UploadReport};
