//! Prometheus metrics for the ingestion engine.
//!
//! The registry is exposed so an embedding process can scrape it; the
//! engine itself never serves HTTP.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all engine metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Admission metrics
pub static UPLOADS_ADMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_admitted_total",
        "Total upload requests granted a permit",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_DENIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_denied_total",
        "Total upload requests denied admission",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_PERMITS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "depot_active_upload_permits",
        "Currently held upload permits across all users",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_chunks_written_total", "Total chunks written to disk")
        .expect("metric creation failed")
});

pub static CHUNKS_SKIPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_chunks_skipped_total",
        "Total re-sent chunks skipped as already recorded",
    )
    .expect("metric creation failed")
});

pub static BYTES_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_written_total",
        "Total chunk bytes written to disk",
    )
    .expect("metric creation failed")
});

pub static CHUNK_INTEGRITY_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_chunk_integrity_failures_total",
        "Total chunks whose on-disk size did not match the received size",
    )
    .expect("metric creation failed")
});

// Commit and dedup metrics
pub static FILES_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_files_committed_total",
        "Total file records committed after a full chunked upload",
    )
    .expect("metric creation failed")
});

pub static FILES_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_files_deduplicated_total",
        "Total uploads settled by referencing an existing object",
    )
    .expect("metric creation failed")
});

pub static BYTES_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_deduplicated_total",
        "Total bytes saved through deduplication",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("depot_upload_errors_total", "Total upload errors by code"),
        &["error_code"],
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static ASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_assembly_duration_seconds",
            "Time taken to merge a chunk set into one file",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

pub static TRANSCODE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_transcode_duration_seconds",
            "Time taken by post-commit media processing per file",
        )
        .buckets(vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
    )
    .expect("metric creation failed")
});

pub static TRANSCODE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_transcode_failures_total",
        "Total files marked transfer-failed by the transcode pipeline",
    )
    .expect("metric creation failed")
});

// Sweep metrics
pub static SWEEP_DELETED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_sweep_deleted_total",
            "Total items removed by maintenance sweeps, by sweep type",
        ),
        &["sweep"],
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent: calls after the first are no-ops, so tests and embedding
/// binaries can both call it safely.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_ADMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_DENIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_PERMITS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_WRITTEN.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_SKIPPED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_WRITTEN.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_INTEGRITY_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILES_COMMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILES_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ASSEMBLY_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TRANSCODE_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TRANSCODE_FAILURES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SWEEP_DELETED.clone()))
            .expect("metric registration failed");
    });
}

/// Record an upload error by its stable code.
pub fn record_upload_error(code: &str) {
    UPLOAD_ERRORS.with_label_values(&[code]).inc();
}

/// Render the registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        tracing::warn!(error = %err, "failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
