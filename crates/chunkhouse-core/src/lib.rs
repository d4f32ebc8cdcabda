//! Chunkhouse Core - Keys, Datasets and Codecs
//!
//! This crate holds the store-independent half of chunkhouse: how a columnar
//! dataset is cut into chunks, what each chunk is called in a sharded
//! key-value store, how a chunk becomes bytes, and how a reassembled table is
//! checked against its source.
//!
//! # Examples
//!
//! ```
//! use chunkhouse_core::{ChunkId, KeySpace};
//!
//! let keys = KeySpace::new("demo:v1");
//! let id = ChunkId::new(1, 2);
//! assert_eq!(keys.chunk_key(id), "demo:v1:{part=00001}:batch=00002");
//! assert_eq!(keys.parse("demo:v1:{part=00001}:batch=00002"), Some(id));
//! ```

pub mod codec;
pub mod dataset;
pub mod error;
pub mod key;
pub mod table;
pub mod verify;

pub use codec::{ArrowIpcCodec, ChunkCodec, Compression};
pub use dataset::{Batch, BatchTagger, Dataset, PARTITION_COLUMN};
pub use error::{CoreError, Result};
pub use key::{hash_slot, hash_tag_of, validate_shape, ChunkId, KeySpace};
pub use table::Table;
pub use verify::{IntegrityVerifier, Mismatch, Verification};
