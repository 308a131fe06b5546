//! Metrics Module - Prometheus Instrumentation
//!
//! Scoped to the dispatch pipeline (C1/C2/C8/C9) and the cache flush path
//! (C5/C6/C7): watermarks, queue depths, and flush duration/volume. Follows
//! the same lazy_static registry + helper-function shape the rest of this
//! codebase uses for metrics, just with a narrower catalog.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Instant;

const FLUSH_DURATION_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0];

lazy_static! {
    /// Global Prometheus registry for this process.
    pub static ref REGISTRY: Registry = Registry::new();

    // ---- Watermarks (§3 of spec) ----
    pub static ref LATEST_PROCESSED_HEIGHT: IntGauge = IntGauge::new(
        "indexer_latest_processed_height",
        "Highest block height whose indexing task has completed"
    ).unwrap();

    pub static ref LATEST_BUFFERED_HEIGHT: IntGauge = IntGauge::new(
        "indexer_latest_buffered_height",
        "Highest block height currently admitted into the height queue"
    ).unwrap();

    pub static ref LATEST_FINALISED_HEIGHT: IntGauge = IntGauge::new(
        "indexer_latest_finalised_height",
        "Highest block height deemed irreversible by the upstream chain source"
    ).unwrap();

    // ---- Pipeline backlog (C1 / C2) ----
    pub static ref HEIGHT_QUEUE_SIZE: IntGauge = IntGauge::new(
        "indexer_height_queue_size",
        "Number of heights currently buffered in the FIFO height queue"
    ).unwrap();

    pub static ref TASK_RUNNER_BACKLOG: IntGauge = IntGauge::new(
        "indexer_task_runner_backlog",
        "Number of indexing tasks queued in the ordered task runner"
    ).unwrap();

    pub static ref BLOCKS_DISCARDED_STALE: IntCounter = IntCounter::new(
        "indexer_blocks_discarded_stale_total",
        "Blocks discarded by the fetch loop's staleness check after a queue flush"
    ).unwrap();

    pub static ref BLOCKS_INDEXED: IntCounter = IntCounter::new(
        "indexer_blocks_indexed_total",
        "Total blocks successfully indexed"
    ).unwrap();

    // ---- Flush path (C5 / C6 / C7) ----
    pub static ref FLUSH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "indexer_flush_duration_seconds",
            "Wall-clock time spent inside one store cache flush transaction"
        ).buckets(FLUSH_DURATION_BUCKETS.to_vec())
    ).unwrap();

    pub static ref FLUSH_RECORDS_WRITTEN: IntCounter = IntCounter::new(
        "indexer_flush_records_written_total",
        "Total entity/metadata versions written across all flushes"
    ).unwrap();

    pub static ref FLUSH_COUNT: IntCounter = IntCounter::new(
        "indexer_flush_count_total",
        "Total number of completed store cache flushes"
    ).unwrap();

    pub static ref FLUSH_FAILURES: IntCounter = IntCounter::new(
        "indexer_flush_failures_total",
        "Total number of flushes that rolled back"
    ).unwrap();
}

/// Register every metric declared above with [`REGISTRY`]. Call once at
/// startup before serving `/metrics`.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    REGISTRY.register(Box::new(LATEST_PROCESSED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(LATEST_BUFFERED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(LATEST_FINALISED_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(HEIGHT_QUEUE_SIZE.clone()))?;
    REGISTRY.register(Box::new(TASK_RUNNER_BACKLOG.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_DISCARDED_STALE.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_INDEXED.clone()))?;
    REGISTRY.register(Box::new(FLUSH_DURATION_SECONDS.clone()))?;
    REGISTRY.register(Box::new(FLUSH_RECORDS_WRITTEN.clone()))?;
    REGISTRY.register(Box::new(FLUSH_COUNT.clone()))?;
    REGISTRY.register(Box::new(FLUSH_FAILURES.clone()))?;
    Ok(())
}

/// Render the registry in Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_default()
}

/// RAII-ish stopwatch used to time a flush and record it on drop-free call sites
/// (the caller records explicitly, mirroring how the rest of the codebase times
/// things without hiding the observation behind a `Drop` impl).
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

pub fn set_watermarks(processed: u64, buffered: u64, finalised: u64) {
    LATEST_PROCESSED_HEIGHT.set(processed as i64);
    LATEST_BUFFERED_HEIGHT.set(buffered as i64);
    LATEST_FINALISED_HEIGHT.set(finalised as i64);
}

pub fn record_flush(duration_secs: f64, records_written: u64) {
    FLUSH_DURATION_SECONDS.observe(duration_secs);
    FLUSH_RECORDS_WRITTEN.inc_by(records_written);
    FLUSH_COUNT.inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_renders_without_init_panicking() {
        // Exercising gather before init is a legitimate state (e.g. a health
        // check hit before the registry is populated) and must not panic.
        let _ = gather_metrics();
    }

    #[test]
    fn stopwatch_reports_nonnegative_elapsed() {
        let sw = Stopwatch::new();
        assert!(sw.elapsed_secs() >= 0.0);
    }
}
