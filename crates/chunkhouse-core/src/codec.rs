//! Chunk Codec
//!
//! The pipeline treats a chunk payload as opaque bytes. [`ChunkCodec`] is the
//! boundary: one logical batch in, one byte payload out, and back.
//!
//! [`ArrowIpcCodec`] stores each chunk as a self-contained Arrow IPC stream
//! (schema message + one record batch), optionally with LZ4 or Zstd buffer
//! compression, so any Arrow reader can open a single value pulled from the
//! store.

use crate::error::{CoreError, Result};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::{IpcWriteOptions, StreamWriter};
use arrow::ipc::CompressionType;
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Serialize one batch to bytes and back.
///
/// Implementations must be deterministic enough that `decode(encode(b))`
/// yields batches equal to `b`.
pub trait ChunkCodec: Send + Sync {
    fn encode(&self, batch: &RecordBatch) -> Result<Bytes>;

    /// Decode a payload. A payload may hold more than one batch.
    fn decode(&self, payload: &[u8]) -> Result<Vec<RecordBatch>>;
}

/// IPC buffer compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[serde(alias = "uncompressed")]
    None,
    Lz4,
    #[default]
    Zstd,
}

impl Compression {
    fn ipc_type(self) -> Option<CompressionType> {
        match self {
            Compression::None => None,
            Compression::Lz4 => Some(CompressionType::LZ4_FRAME),
            Compression::Zstd => Some(CompressionType::ZSTD),
        }
    }

    pub(crate) fn write_options(self) -> Result<IpcWriteOptions> {
        Ok(IpcWriteOptions::default().try_with_compression(self.ipc_type())?)
    }
}

impl std::str::FromStr for Compression {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "uncompressed" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd),
            other => Err(CoreError::Codec(format!(
                "unknown compression '{other}' (expected zstd, lz4 or uncompressed)"
            ))),
        }
    }
}

/// Arrow IPC stream codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrowIpcCodec {
    compression: Compression,
}

impl ArrowIpcCodec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

impl ChunkCodec for ArrowIpcCodec {
    fn encode(&self, batch: &RecordBatch) -> Result<Bytes> {
        let options = self.compression.write_options()?;
        let mut writer =
            StreamWriter::try_new_with_options(Vec::new(), batch.schema().as_ref(), options)?;
        writer.write(batch)?;
        writer.finish()?;
        Ok(Bytes::from(writer.into_inner()?))
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<RecordBatch>> {
        if payload.is_empty() {
            return Err(CoreError::Codec("empty chunk payload".to_string()));
        }
        let reader = StreamReader::try_new(Cursor::new(payload), None)
            .map_err(|e| CoreError::Codec(format!("ipc reader init failed: {e}")))?;
        reader
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| CoreError::Codec(format!("ipc read failed: {e}")))
    }
}
