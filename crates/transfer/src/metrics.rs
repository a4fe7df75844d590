//! Prometheus metrics for the transfer engine.

use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Task lifecycle
pub static TASKS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_tasks_created_total", "Total number of transfer tasks created")
        .expect("metric creation failed")
});

pub static TASKS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_tasks_completed_total",
        "Total number of transfer tasks completed, quick uploads included",
    )
    .expect("metric creation failed")
});

pub static TASKS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_tasks_failed_total", "Total number of transfer tasks failed")
        .expect("metric creation failed")
});

pub static TASKS_CANCELED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_tasks_canceled_total", "Total number of transfer tasks canceled")
        .expect("metric creation failed")
});

pub static QUICK_UPLOADS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_quick_uploads_total",
        "Total number of tasks finished by content-hash deduplication",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_TASKS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_active_tasks", "Number of transfer tasks not yet terminal")
        .expect("metric creation failed")
});

// Chunks
pub static CHUNKS_RECORDED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_chunks_recorded_total", "Total number of chunks recorded")
        .expect("metric creation failed")
});

pub static DUPLICATE_CHUNKS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_duplicate_chunks_total",
        "Total number of chunk uploads for an index already recorded",
    )
    .expect("metric creation failed")
});

pub static CHUNK_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_chunk_errors_total", "Total number of rejected or failed chunks")
        .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_bytes_received_total", "Total chunk bytes recorded")
        .expect("metric creation failed")
});

// Merge
pub static MERGE_LOCK_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_merge_lock_timeouts_total",
        "Total number of merge attempts that gave up waiting for the task lock",
    )
    .expect("metric creation failed")
});

pub static FINALIZE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_finalize_duration_seconds",
            "Time to assemble and record a merged file",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

/// Guard to ensure metrics are only registered once.
static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Idempotent; later calls are no-ops.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(TASKS_CREATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TASKS_COMPLETED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TASKS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TASKS_CANCELED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUICK_UPLOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_TASKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_RECORDED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DUPLICATE_CHUNKS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_ERRORS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_RECEIVED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(MERGE_LOCK_TIMEOUTS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FINALIZE_DURATION.clone()))
            .expect("metric registration failed");
    });
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String, prometheus::Error> {
    register_metrics();
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_render_includes_counters() {
        TASKS_CREATED.inc();
        let text = render().unwrap();
        assert!(text.contains("depot_tasks_created_total"));
        assert!(text.contains("depot_finalize_duration_seconds"));
    }
}
