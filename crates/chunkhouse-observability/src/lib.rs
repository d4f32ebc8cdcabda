//! Chunkhouse Observability
//!
//! Provides metrics and logging for chunkhouse.
//!
//! # Features
//!
//! - Prometheus collectors for uploads, fetches, retries and decode failures
//! - Structured logging with tracing
//!
//! # Usage
//!
//! ```no_run
//! use chunkhouse_observability::{init_tracing, metrics};
//!
//! init_tracing("info");
//! metrics::init();
//!
//! let text = metrics::gather_text().unwrap();
//! println!("{text}");
//! ```

pub mod metrics;

pub use metrics::{gather_text, init as init_metrics, REGISTRY};
use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG`, or `default_filter` when
/// it is unset. Later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Initialize all observability components
pub fn init() {
    metrics::init();
    init_tracing("info");
}
