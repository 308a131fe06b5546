//! C8: Base block dispatcher.
//!
//! Height-watermark bookkeeping and the pre/post-block hooks shared by any
//! concrete dispatch strategy. Holds a non-owning handle to C7 (§9:
//! composition, not cyclic ownership - the controller owns the caches, the
//! dispatcher only asks it to flush).

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::cache::StoreCacheController;
use crate::dispatch::height_queue::HeightQueue;
use crate::error::{IndexerError, Result};
use crate::events::EventSink;
use crate::handler::ProcessBlockResponse;
use crate::metrics;

/// A monotone height watermark. `None` ("unset") is represented internally
/// as `-1` so the common case (compare-and-advance) is a single atomic op.
struct Watermark(AtomicI64);

impl Watermark {
    fn new() -> Self {
        Self(AtomicI64::new(-1))
    }

    fn get(&self) -> Option<u64> {
        match self.0.load(Ordering::SeqCst) {
            -1 => None,
            h => Some(h as u64),
        }
    }

    fn set(&self, height: u64) {
        self.0.store(height as i64, Ordering::SeqCst);
    }
}

/// Should the controller be asked to flush after this block, per the
/// block-count cadence half of C7's flush-boundary decision (§4.7); the
/// record-count half is asked separately via the controller itself.
pub struct FlushCadence {
    pub block_interval: Option<u64>,
}

/// Height bookkeeping plus pre/post-block hooks, shared by every concrete
/// dispatch strategy (currently only C9).
pub struct BaseBlockDispatcher {
    pub(crate) queue: Arc<HeightQueue>,
    controller: Arc<StoreCacheController>,
    events: Arc<dyn EventSink>,
    cadence: FlushCadence,
    latest_processed_height: Watermark,
    latest_buffered_height: Watermark,
    latest_finalised_height: Watermark,
}

impl BaseBlockDispatcher {
    pub fn new(
        queue: Arc<HeightQueue>,
        controller: Arc<StoreCacheController>,
        events: Arc<dyn EventSink>,
        cadence: FlushCadence,
    ) -> Self {
        Self {
            queue,
            controller,
            events,
            cadence,
            latest_processed_height: Watermark::new(),
            latest_buffered_height: Watermark::new(),
            latest_finalised_height: Watermark::new(),
        }
    }

    pub fn latest_processed_height(&self) -> Option<u64> {
        self.latest_processed_height.get()
    }

    pub fn latest_buffered_height(&self) -> Option<u64> {
        self.latest_buffered_height.get()
    }

    pub fn latest_finalised_height(&self) -> Option<u64> {
        self.latest_finalised_height.get()
    }

    pub fn set_buffered_height(&self, height: u64) {
        self.latest_buffered_height.set(height);
        metrics::set_watermarks(
            self.latest_processed_height().unwrap_or(0),
            height,
            self.latest_finalised_height().unwrap_or(0),
        );
    }

    pub fn set_finalised_height(&self, height: u64) {
        self.latest_finalised_height.set(height);
        metrics::set_watermarks(
            self.latest_processed_height().unwrap_or(0),
            self.latest_buffered_height().unwrap_or(0),
            height,
        );
    }

    /// §4.8 `flushQueue`: truncate the height queue and pin the buffered
    /// watermark. Per the open question in §9, this does *not* also clear
    /// the indexing backlog (C2) - callers that want that must call it
    /// themselves (C9's `flush_queue` does).
    pub fn flush_queue(&self, height: u64) {
        self.queue.flush();
        self.set_buffered_height(height);
    }

    /// §4.8 `preProcessBlock`: assert strictly-increasing height and emit a
    /// progress event. The assertion failing is a programmer error (§7): it
    /// means a height reached indexing out of order, which should never
    /// happen given C1's FIFO discipline and C2's concurrency-1 execution.
    pub fn pre_process_block(&self, height: u64) -> Result<()> {
        if let Some(processed) = self.latest_processed_height.get() {
            if height <= processed {
                return Err(IndexerError::programmer(format!(
                    "pre_process_block({}) is not after latest_processed_height {}",
                    height, processed
                )));
            }
        }
        self.events.emit("progress", json!({ "height": height }));
        Ok(())
    }

    /// §4.8 `postProcessBlock`: forward dynamic-datasource additions (logged
    /// only - actual dynamic datasource registration is out of scope, §1),
    /// advance the processed watermark, and flush if either flush predicate
    /// is met.
    pub async fn post_process_block(&self, height: u64, response: ProcessBlockResponse) -> Result<()> {
        if !response.dynamic_datasources.is_empty() {
            self.events.emit(
                "dynamic-datasources",
                json!({ "height": height, "datasources": response.dynamic_datasources }),
            );
        }

        self.latest_processed_height.set(height);
        metrics::set_watermarks(
            self.latest_processed_height().unwrap_or(0),
            self.latest_buffered_height().unwrap_or(0),
            self.latest_finalised_height().unwrap_or(0),
        );

        let cadence_due = self
            .cadence
            .block_interval
            .map(|interval| interval > 0 && height % interval == 0)
            .unwrap_or(false);
        let record_count_due = self.controller.should_flush_by_record_count().await;

        if cadence_due || record_count_due {
            self.controller.flush().await?;
        }
        Ok(())
    }
}
