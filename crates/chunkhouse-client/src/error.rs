//! Error types for chunkhouse client operations.
//!
//! This module defines every failure an upload, fetch, or store call can
//! surface. Errors are grouped by whether retrying can help, because the retry
//! policy consults [`ClientError::is_retryable`] and nothing else.
//!
//! ## Error Handling Strategy
//!
//! - **Retriable errors**: `TransientIo`, `Pipeline`
//! - **Caller errors**: `CrossSlot`, `Config`, `Unsupported`, `Closed`
//! - **Fatal errors**: `Connection`, `Write`, `Read`, `Decode` (strict mode), `Core`, `Internal`
//!
//! Absent keys are not errors. A fetch that finds fewer chunks than it asked
//! for succeeds and reports the shortfall in its counts.
//!
//! ## Examples
//!
//! ```ignore
//! use chunkhouse_client::ClientError;
//!
//! match uploader.upload(&dataset, "demo:v1").await {
//!     Ok(report) => println!("wrote {} chunks", report.chunks_written),
//!     Err(e) if e.is_retryable() => eprintln!("gave up after retries: {e}"),
//!     Err(e) => eprintln!("upload failed: {e}"),
//! }
//! ```

use chunkhouse_core::CoreError;
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Error type for chunkhouse client operations.
///
/// ## Error Categories
///
/// - **Lifecycle**: `Connection`, `Closed`
/// - **I/O**: `TransientIo`, `Write`, `Read`, `Pipeline`
/// - **Usage**: `CrossSlot`, `Unsupported`, `Config`
/// - **Payload**: `Decode`, `Core`
/// - **Unknown**: `Internal`
#[derive(Debug, Error)]
pub enum ClientError {
    /// Could not establish a handle to the store.
    ///
    /// Raised by `connect` when the URL is unusable, the TCP/TLS handshake
    /// fails or the initial `PING` is rejected.
    ///
    /// ## Resolution
    /// - Verify the store URL and that the server is reachable
    /// - Retry the connect step; nothing else retries it for you
    #[error("Failed to connect to {endpoint}: {message}")]
    Connection { endpoint: String, message: String },

    /// Timeout or transient network failure on one store call.
    ///
    /// Retried by the retry policy. Seeing it from an upload or fetch means
    /// every attempt failed.
    #[error("Transient I/O failure during {operation}: {message}")]
    TransientIo { operation: String, message: String },

    /// The store rejected a write (auth, quota, read-only replica, ...).
    ///
    /// Not retried. Aborts the upload that issued it.
    #[error("Write of '{key}' rejected: {message}")]
    Write { key: String, message: String },

    /// The store rejected a read (auth, ACL, wrong type, ...).
    ///
    /// Not retried. Aborts the fetch that issued it.
    #[error("Read of '{key}' rejected: {message}")]
    Read { key: String, message: String },

    /// A multi-get call failed as a whole.
    ///
    /// Distinct from individual absent keys, which are normal outcomes.
    /// Retried by the retry policy.
    #[error("Multi-get failed: {0}")]
    Pipeline(String),

    /// A multi-key call in cluster mode spans more than one hash tag.
    ///
    /// Split the keys per partition. Raised before any network traffic.
    #[error("Keys span more than one hash tag: '{first}' and '{other}'")]
    CrossSlot { first: String, other: String },

    /// A present payload could not be decoded.
    ///
    /// Reported per chunk on the fetch result; returned as an error only in
    /// strict decode mode.
    #[error("Failed to decode '{key}' (partition {partition}, batch {batch}): {message}")]
    Decode {
        key: String,
        partition: u32,
        batch: u32,
        message: String,
    },

    /// The handle was used after `close()`.
    #[error("Store handle is closed")]
    Closed,

    /// The store topology does not support the operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Invalid configuration or builder input.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from the dataset, key or codec layer.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Internal error that shouldn't normally occur (e.g. a panicked task).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether another attempt of the same call can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::TransientIo { .. } | ClientError::Pipeline(_)
        )
    }

    /// Short, stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Connection { .. } => "connection",
            ClientError::TransientIo { .. } => "transient_io",
            ClientError::Write { .. } => "write",
            ClientError::Read { .. } => "read",
            ClientError::Pipeline(_) => "pipeline",
            ClientError::CrossSlot { .. } => "cross_slot",
            ClientError::Decode { .. } => "decode",
            ClientError::Closed => "closed",
            ClientError::Unsupported(_) => "unsupported",
            ClientError::Config(_) => "config",
            ClientError::Core(_) => "core",
            ClientError::Internal(_) => "internal",
        }
    }

    pub(crate) fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        ClientError::TransientIo {
            operation: operation.into(),
            message: message.into(),
        }
    }
}

impl From<tokio::task::JoinError> for ClientError {
    fn from(e: tokio::task::JoinError) -> Self {
        ClientError::Internal(format!("task failed: {e}"))
    }
}
