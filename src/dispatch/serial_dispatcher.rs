//! C9: Serial block dispatcher.
//!
//! The concrete two-stage pipeline: an upstream height queue (C1, inherited
//! via [`BaseBlockDispatcher`]) feeds a batched fetch step, whose results
//! are submitted as one C2 task per block.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::json;
use tracing::{error, warn};

use crate::chain::BlockSource;
use crate::dispatch::base_dispatcher::BaseBlockDispatcher;
use crate::dispatch::task_runner::{BoxedTask, OrderedTaskRunner};
use crate::error::{IndexerError, Result};
use crate::events::EventSink;
use crate::fatal::FatalSender;
use crate::handler::BlockHandler;
use crate::metrics;

/// Concrete pipeline: `enqueueBlocks` appends to C1 and (idempotently)
/// starts the fetch loop; `flushQueue`/`onApplicationShutdown` are the two
/// cancellation primitives (§5).
pub struct SerialBlockDispatcher<B> {
    base: Arc<BaseBlockDispatcher>,
    task_runner: Arc<OrderedTaskRunner>,
    block_source: Arc<dyn BlockSource<B>>,
    handler: Arc<dyn BlockHandler<B>>,
    events: Arc<dyn EventSink>,
    fatal: FatalSender,
    batch_size: usize,
    fetching: Arc<AtomicBool>,
    is_shutdown: Arc<AtomicBool>,
    /// Lets `&self` methods obtain an owned `Arc<Self>` to hand to
    /// `tokio::spawn`, without forcing every caller of `enqueue_blocks` to
    /// hold and pass around an `Arc` themselves.
    self_ref: Weak<Self>,
}

impl<B: Send + Sync + 'static> SerialBlockDispatcher<B> {
    pub fn new(
        base: Arc<BaseBlockDispatcher>,
        block_source: Arc<dyn BlockSource<B>>,
        handler: Arc<dyn BlockHandler<B>>,
        events: Arc<dyn EventSink>,
        fatal: FatalSender,
        batch_size: usize,
    ) -> Arc<Self> {
        let task_runner = OrderedTaskRunner::new(batch_size * 3);
        Arc::new_cyclic(|weak| Self {
            base,
            task_runner,
            block_source,
            handler,
            events,
            fatal,
            batch_size,
            fetching: Arc::new(AtomicBool::new(false)),
            is_shutdown: Arc::new(AtomicBool::new(false)),
            self_ref: weak.clone(),
        })
    }

    /// §4.9 `enqueueBlocks`.
    pub fn enqueue_blocks(&self, heights: Vec<u64>, latest_buffered_height: Option<u64>) -> Result<()> {
        if heights.is_empty() {
            if let Some(h) = latest_buffered_height {
                self.base.set_buffered_height(h);
            }
            return Ok(());
        }

        self.base.queue.put_many(&heights)?;
        let buffered = latest_buffered_height.unwrap_or_else(|| *heights.last().expect("checked non-empty above"));
        self.base.set_buffered_height(buffered);
        self.start_fetch_loop();
        Ok(())
    }

    /// §4.9 `flushQueue`: cancels both the pending heights (C1) and the
    /// indexing backlog (C2) - the pairing the open question in §9 calls
    /// out as a discipline other C1 clients must also follow.
    pub fn flush_queue(&self, height: u64) {
        self.base.flush_queue(height);
        self.task_runner.flush();
    }

    /// §4.9 `onApplicationShutdown`: hard cancellation. The fetch loop
    /// checks `is_shutdown` at every yield point and exits promptly.
    pub fn on_application_shutdown(&self) {
        self.is_shutdown.store(true, Ordering::SeqCst);
        self.task_runner.abort();
    }

    fn start_fetch_loop(&self) {
        if self
            .fetching
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return; // already running
        }
        let this = self
            .self_ref
            .upgrade()
            .expect("dispatcher still alive while its own fetch loop is starting");
        tokio::spawn(async move {
            this.run_fetch_loop().await;
            this.fetching.store(false, Ordering::SeqCst);
        });
    }

    async fn run_fetch_loop(self: Arc<Self>) {
        loop {
            if self.is_shutdown.load(Ordering::SeqCst) {
                return;
            }

            let n = self.batch_size.min(self.task_runner.free_space());
            let heights = if n == 0 { Vec::new() } else { self.base.queue.take_many(n) };

            if heights.is_empty() {
                if self.base.queue.peek().is_some() {
                    // C2 is full; nothing to take yet. Yield briefly (§5:
                    // the loop spins with a 1 ms delay rather than pulling
                    // heights off C1 it cannot push downstream).
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    continue;
                }
                return; // nothing buffered, nothing in flight: idle out
            }

            let pre = self.base.latest_buffered_height();
            let min_height = *heights.iter().min().expect("heights checked non-empty above");

            let blocks = match self.block_source.fetch_blocks_batches(&heights).await {
                Ok(blocks) => blocks,
                Err(e) => {
                    error!(error = %e, "block fetch failed, terminating pipeline");
                    let _ = self.fatal.send(Some(IndexerError::Fetch(e.to_string())));
                    return;
                }
            };

            // Staleness check (§4.9, §5): a concurrent `flush_queue` while
            // the fetch was in flight rewinds the buffered watermark or
            // empties/advances C1 past what we took. Either signal means
            // this batch belongs to a height range that's been cancelled.
            let stale = pre > self.base.latest_buffered_height()
                || self.base.queue.peek().map(|h| h < min_height).unwrap_or(false);
            if stale {
                warn!(min_height, "discarding stale fetched batch");
                metrics::BLOCKS_DISCARDED_STALE.inc_by(heights.len() as u64);
                continue;
            }

            let mut ordered: Vec<B> = blocks;
            ordered.sort_by_key(|b| self.block_source.block_height(b));

            let mut tasks: Vec<BoxedTask> = Vec::with_capacity(ordered.len());
            for block in ordered {
                let height = self.block_source.block_height(&block);
                let this = self.clone();
                tasks.push(Box::pin(async move {
                    this.base.pre_process_block(height)?;
                    let response = this
                        .handler
                        .index_block(&block)
                        .await
                        .map_err(|e| IndexerError::Handler {
                            height,
                            source: e.to_string(),
                        })?;
                    this.base.post_process_block(height, response).await?;
                    metrics::BLOCKS_INDEXED.inc();
                    Ok(())
                }));
            }

            match self.task_runner.put_many(tasks) {
                Ok(outcomes) => {
                    let fatal = self.fatal.clone();
                    let is_shutdown = self.is_shutdown.clone();
                    tokio::spawn(async move {
                        for outcome in outcomes {
                            if let Ok(Err(e)) = outcome.await {
                                if !is_shutdown.load(Ordering::SeqCst) {
                                    error!(error = %e, "indexing task failed, terminating pipeline");
                                    let _ = fatal.send(Some(e));
                                }
                                break;
                            }
                        }
                    });
                }
                Err(e) => {
                    let _ = self.fatal.send(Some(e));
                    return;
                }
            }

            let queue_size = self.base.queue.size();
            metrics::HEIGHT_QUEUE_SIZE.set(queue_size as i64);
            metrics::TASK_RUNNER_BACKLOG.set(self.task_runner.size() as i64);
            self.events.emit("queue-size", json!({ "size": queue_size }));
        }
    }
}
