//! Chunk Key Scheme
//!
//! Every chunk of a dataset lives under a deterministic key built from the
//! dataset prefix, the partition id and the within-partition batch index:
//!
//! ```text
//! <prefix>:{part=PPPPP}:batch=BBBBB
//!          └──────────┘
//!           hash tag
//! ```
//!
//! ## Hash Tags
//!
//! A sharded store (Redis Cluster and compatible proxies) routes a key by the
//! bytes between the first `{` and the following `}` only. The tag embeds the
//! partition id and nothing else, so every batch of one partition lands in the
//! same slot and a partition can be read back with single-slot `MGET`s.
//!
//! ## Widths
//!
//! Partition ids and batch indices are zero-padded to 5 digits. Lexical and
//! numeric order coincide as long as ids stay below 100,000, which
//! [`validate_shape`] enforces.
//!
//! ## Example
//!
//! ```
//! use chunkhouse_core::key::KeySpace;
//!
//! let keys = KeySpace::new("demo:v1");
//! assert_eq!(keys.key(7, 3), "demo:v1:{part=00007}:batch=00003");
//! assert_eq!(keys.hash_tag(7), "{part=00007}");
//! ```

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Zero-padding width of the partition id inside the hash tag.
pub const PARTITION_WIDTH: usize = 5;

/// Zero-padding width of the batch index.
pub const BATCH_WIDTH: usize = 5;

/// Exclusive upper bound on partition ids (10^PARTITION_WIDTH).
pub const MAX_PARTITIONS: u32 = 100_000;

/// Exclusive upper bound on batch indices (10^BATCH_WIDTH).
pub const MAX_BATCHES_PER_PARTITION: u32 = 100_000;

/// Number of hash slots in a Redis Cluster.
pub const CLUSTER_SLOTS: u16 = 16_384;

/// Position of one chunk inside a dataset.
///
/// Ordering is `(partition, batch)`, which is the order chunks are encoded,
/// stored and reassembled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    pub partition: u32,
    pub batch: u32,
}

impl ChunkId {
    pub fn new(partition: u32, batch: u32) -> Self {
        Self { partition, batch }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition={} batch={}", self.partition, self.batch)
    }
}

/// Key builder for one dataset prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Brace-delimited routing tag for a partition, e.g. `{part=00007}`.
    pub fn hash_tag(&self, partition: u32) -> String {
        format!("{{part={:0width$}}}", partition, width = PARTITION_WIDTH)
    }

    /// Storage key of one chunk.
    ///
    /// Ids at or above 100,000 still render (with more digits) but break the
    /// lexical ordering; callers validate the shape with [`validate_shape`].
    pub fn key(&self, partition: u32, batch: u32) -> String {
        format!(
            "{}:{}:batch={:0width$}",
            self.prefix,
            self.hash_tag(partition),
            batch,
            width = BATCH_WIDTH
        )
    }

    pub fn chunk_key(&self, id: ChunkId) -> String {
        self.key(id.partition, id.batch)
    }

    /// All keys of one partition in batch order.
    pub fn partition_keys(&self, partition: u32, batches_per_partition: u32) -> Vec<String> {
        (0..batches_per_partition)
            .map(|batch| self.key(partition, batch))
            .collect()
    }

    /// Glob matching every chunk key under this prefix (Redis `SCAN MATCH`).
    ///
    /// Glob metacharacters in the prefix are escaped so they match literally.
    pub fn scan_pattern(&self) -> String {
        let mut escaped = String::with_capacity(self.prefix.len());
        for c in self.prefix.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                escaped.push('\\');
            }
            escaped.push(c);
        }
        format!("{escaped}:{{part=*}}:batch=*")
    }

    /// Recover the chunk position from a key produced by this key space.
    ///
    /// Returns `None` for keys of other prefixes or malformed keys.
    pub fn parse(&self, key: &str) -> Option<ChunkId> {
        let rest = key.strip_prefix(self.prefix.as_str())?;
        let rest = rest.strip_prefix(":{part=")?;
        let (partition, rest) = rest.split_once('}')?;
        let batch = rest.strip_prefix(":batch=")?;

        if partition.len() < PARTITION_WIDTH || batch.len() < BATCH_WIDTH {
            return None;
        }
        if !partition.bytes().all(|b| b.is_ascii_digit()) || !batch.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }

        Some(ChunkId {
            partition: partition.parse().ok()?,
            batch: batch.parse().ok()?,
        })
    }
}

/// Reject dataset shapes whose ids would not fit the fixed key widths.
pub fn validate_shape(partitions: u32, batches_per_partition: u32) -> Result<()> {
    if partitions > MAX_PARTITIONS {
        return Err(CoreError::InvalidShape(format!(
            "{partitions} partitions exceed the {PARTITION_WIDTH}-digit key width (max {MAX_PARTITIONS})"
        )));
    }
    if batches_per_partition > MAX_BATCHES_PER_PARTITION {
        return Err(CoreError::InvalidShape(format!(
            "{batches_per_partition} batches per partition exceed the {BATCH_WIDTH}-digit key width (max {MAX_BATCHES_PER_PARTITION})"
        )));
    }
    Ok(())
}

/// The substring a cluster routes on, following Redis hash-tag rules.
///
/// The tag is the content between the first `{` and the next `}` when that
/// content is non-empty; otherwise the whole key is routed.
pub fn hash_tag_of(key: &str) -> &str {
    if let Some(open) = key.find('{') {
        if let Some(len) = key[open + 1..].find('}') {
            if len > 0 {
                return &key[open + 1..open + 1 + len];
            }
        }
    }
    key
}

/// Redis Cluster hash slot of a key (CRC16/XMODEM of the hash tag, mod 16384).
///
/// Computed here so the core crate carries no store client dependency.
pub fn hash_slot(key: &str) -> u16 {
    crc16_xmodem(hash_tag_of(key).as_bytes()) % CLUSTER_SLOTS
}

fn crc16_xmodem(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= u16::from(byte) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}
