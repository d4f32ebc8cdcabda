//! Error Types for chunkhouse-core
//!
//! ## Error Categories
//!
//! ### Shape Errors
//! - `InvalidShape`: Dataset does not have dense partitions, a uniform schema, or
//!   the declared number of batches per partition; or ids overflow the key widths
//!
//! ### Codec Errors
//! - `Codec`: A chunk payload could not be encoded or decoded
//! - `Arrow`: Low-level Arrow failure (IPC reader/writer, concat)
//!
//! ### Integrity Errors
//! - `VerificationMismatch`: Two tables differ; carries the first point of divergence
//!
//! ## Usage
//! All fallible functions in this crate return `Result<T>`, aliased to
//! `Result<T, CoreError>`, so `?` works across Arrow and I/O calls.

use crate::verify::Mismatch;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Invalid dataset shape: {0}")]
    InvalidShape(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Verification mismatch: {0}")]
    VerificationMismatch(Mismatch),
}

pub type Result<T> = std::result::Result<T, CoreError>;
