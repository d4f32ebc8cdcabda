use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Upload Metrics
    // ============================================================================

    /// Total chunks written to the store
    pub static ref CHUNKS_WRITTEN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chunkhouse_chunks_written_total", "Total chunks written"),
        &["prefix"]
    ).expect("metric can be created");

    /// Total payload bytes written to the store
    pub static ref BYTES_WRITTEN_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chunkhouse_bytes_written_total", "Total chunk bytes written"),
        &["prefix"]
    ).expect("metric can be created");

    /// Uploads aborted, by error kind
    pub static ref UPLOAD_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chunkhouse_upload_errors_total", "Total aborted uploads"),
        &["error_type"]
    ).expect("metric can be created");

    // ============================================================================
    // Fetch Metrics
    // ============================================================================

    /// Chunks requested by fetches, by outcome (present, absent)
    pub static ref CHUNKS_FETCHED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chunkhouse_chunks_fetched_total", "Total chunks requested by outcome"),
        &["outcome"]
    ).expect("metric can be created");

    /// Payload bytes read back from the store
    pub static ref BYTES_FETCHED_TOTAL: IntCounter = IntCounter::new(
        "chunkhouse_bytes_fetched_total",
        "Total chunk bytes fetched"
    ).expect("metric can be created");

    /// Latency of one multi-get call
    pub static ref MULTI_GET_LATENCY: Histogram = Histogram::with_opts(
        HistogramOpts::new("chunkhouse_multi_get_latency_seconds", "Multi-get latency in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0])
    ).expect("metric can be created");

    /// Present chunks that failed to decode
    pub static ref DECODE_FAILURES_TOTAL: IntCounter = IntCounter::new(
        "chunkhouse_decode_failures_total",
        "Total chunks that failed to decode"
    ).expect("metric can be created");

    // ============================================================================
    // Store Metrics
    // ============================================================================

    /// Retries of store operations, by operation name
    pub static ref STORE_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("chunkhouse_store_retries_total", "Total retried store operations"),
        &["operation"]
    ).expect("metric can be created");
}

/// Initialize metrics registry
/// Can be called multiple times safely (idempotent)
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(CHUNKS_WRITTEN_TOTAL.clone()))
            .expect("chunks_written_total can be registered");
        REGISTRY
            .register(Box::new(BYTES_WRITTEN_TOTAL.clone()))
            .expect("bytes_written_total can be registered");
        REGISTRY
            .register(Box::new(UPLOAD_ERRORS_TOTAL.clone()))
            .expect("upload_errors_total can be registered");
        REGISTRY
            .register(Box::new(CHUNKS_FETCHED_TOTAL.clone()))
            .expect("chunks_fetched_total can be registered");
        REGISTRY
            .register(Box::new(BYTES_FETCHED_TOTAL.clone()))
            .expect("bytes_fetched_total can be registered");
        REGISTRY
            .register(Box::new(MULTI_GET_LATENCY.clone()))
            .expect("multi_get_latency can be registered");
        REGISTRY
            .register(Box::new(DECODE_FAILURES_TOTAL.clone()))
            .expect("decode_failures_total can be registered");
        REGISTRY
            .register(Box::new(STORE_RETRIES_TOTAL.clone()))
            .expect("store_retries_total can be registered");
    });
}

/// Render the registry in the Prometheus text exposition format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
