//! Prometheus metrics for the sync engine.

use prometheus::{
    self, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Task metrics
pub static TASKS_PROCESSED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "twinstore_sync_tasks_total",
            "Sync tasks processed, by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

pub static TASK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "twinstore_sync_task_duration_seconds",
            "Time spent running one sync task until it completes, suspends or fails",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
    )
    .expect("metric creation failed")
});

pub static RETRIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "twinstore_sync_retries_total",
            "In-line retries of store operations, by operation",
        ),
        &["op"],
    )
    .expect("metric creation failed")
});

// Copy metrics
pub static BYTES_COPIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "twinstore_sync_bytes_copied_total",
        "Bytes written to destination replicas",
    )
    .expect("metric creation failed")
});

pub static PARTS_COPIED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "twinstore_sync_parts_copied_total",
        "Parts copied into multipart sessions",
    )
    .expect("metric creation failed")
});

pub static FINALIZES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "twinstore_sync_finalizes_total",
        "Chunked copies composed at the destination",
    )
    .expect("metric creation failed")
});

// Failure handling
pub static DEAD_LETTERS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "twinstore_sync_dead_letters_total",
            "Tasks moved to the dead-letter table, by failure class",
        ),
        &["class"],
    )
    .expect("metric creation failed")
});

pub static REDRIVES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "twinstore_sync_redrives_total",
        "Dead-lettered tasks put back on the queue",
    )
    .expect("metric creation failed")
});

pub static PARKED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "twinstore_sync_parked_total",
        "Dead-lettered tasks parked for operator attention",
    )
    .expect("metric creation failed")
});

pub static QUEUE_DEPTH: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "twinstore_sync_queue_depth",
        "Work items in the queue at the last reaper sweep",
    )
    .expect("metric creation failed")
});

// Verification
pub static VERIFY_MISMATCHES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "twinstore_verify_mismatches_total",
            "Replica mismatches found by the verifier, by object kind",
        ),
        &["kind"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(TASKS_PROCESSED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(TASK_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RETRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_COPIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PARTS_COPIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FINALIZES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(DEAD_LETTERS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(REDRIVES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(PARKED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(QUEUE_DEPTH.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(VERIFY_MISMATCHES.clone()))
            .expect("metric registration failed");
    });
}

/// Helper to count a task outcome.
pub fn record_task_outcome(outcome: &str) {
    TASKS_PROCESSED.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // This would panic if any metric creation failed
        register_metrics();
        register_metrics();
        record_task_outcome("copied");
        assert!(
            REGISTRY
                .gather()
                .iter()
                .any(|family| family.get_name() == "twinstore_sync_tasks_total")
        );
    }
}
