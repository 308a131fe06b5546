//! Manual smoke-test binary for the dispatch pipeline and store cache.
//!
//! Wires a fabricated [`BlockSource`]/[`BlockHandler`] pair and an in-memory
//! repository to [`SerialBlockDispatcher`], enqueues a run of heights, and
//! waits for the pipeline to drain or report a fatal error. Not part of the
//! library surface - a real host process supplies its own chain client and
//! indexing logic instead of these stand-ins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use indexer_core::{
    entity_handle, BaseBlockDispatcher, BlockHandler, BlockSource, CachedEntityModel,
    CachedMetadataModel, Entity, EntitySchema, EventSink, FlushCadence, HeightQueue, IndexerError,
    MemoryRepository, ProcessBlockResponse, Repository, Result, SerialBlockDispatcher,
    StoreCacheController,
};
use indexer_core::telemetry::{init_tracing, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(about = "Smoke-test harness for the indexer dispatch pipeline")]
struct Args {
    /// Number of fabricated blocks to index, starting at height 1.
    #[arg(long, default_value_t = 50)]
    blocks: u64,

    /// Batch size for both the fetch loop and the underlying queue capacity.
    #[arg(long, default_value_t = 8)]
    batch_size: usize,

    /// Flush after this many flushable records accumulate.
    #[arg(long, default_value_t = 20)]
    flush_record_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DemoBlock {
    height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BlockSummary {
    height: u64,
    seen_at_height: u64,
}

impl Entity for BlockSummary {
    fn id(&self) -> String {
        self.height.to_string()
    }
}

const BLOCK_SUMMARIES: EntitySchema = EntitySchema::new("block_summaries");

/// Fabricates blocks instead of fetching them from a real chain - the seam
/// a host process replaces with its own RPC client.
struct DemoChain;

#[async_trait]
impl BlockSource<DemoBlock> for DemoChain {
    async fn fetch_blocks_batches(&self, heights: &[u64]) -> Result<Vec<DemoBlock>> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(heights.iter().map(|&height| DemoBlock { height }).collect())
    }

    fn block_height(&self, block: &DemoBlock) -> u64 {
        block.height
    }
}

/// Writes one summary row per block into the C5 cache it holds a handle to.
struct DemoIndexer {
    summaries: indexer_core::EntityHandle<BlockSummary>,
    blocks_indexed: Arc<AtomicU64>,
}

#[async_trait]
impl BlockHandler<DemoBlock> for DemoIndexer {
    async fn index_block(&self, block: &DemoBlock) -> Result<ProcessBlockResponse> {
        let mut cache = self.summaries.lock().await;
        cache.set(
            block.height.to_string(),
            BlockSummary {
                height: block.height,
                seen_at_height: block.height,
            },
            block.height,
        )?;
        self.blocks_indexed.fetch_add(1, Ordering::Relaxed);
        Ok(ProcessBlockResponse::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(TelemetryConfig::default())?;
    indexer_core::metrics::init_metrics().map_err(|e| IndexerError::Config(e.to_string()))?;

    let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());

    let metadata = Arc::new(AsyncMutex::new(CachedMetadataModel::new([
        "processedBlockCount".to_string(),
    ])));
    let mut controller = StoreCacheController::new(repo.clone(), metadata.clone(), args.flush_record_threshold);

    let summaries = entity_handle(CachedEntityModel::<BlockSummary>::new(
        BLOCK_SUMMARIES,
        false,
        500,
        Duration::from_secs(3600),
    ));
    controller.register(summaries.clone());
    let controller = Arc::new(controller);

    let capacity = args.batch_size * 3;
    let queue = Arc::new(HeightQueue::new(capacity));
    let events: Arc<dyn EventSink> = Arc::new(indexer_core::events::TracingEventSink);
    let base = Arc::new(BaseBlockDispatcher::new(
        queue,
        controller.clone(),
        events.clone(),
        FlushCadence { block_interval: Some(10) },
    ));

    let (fatal_tx, mut fatal_rx) = indexer_core::fatal::channel();
    let blocks_indexed = Arc::new(AtomicU64::new(0));
    let handler: Arc<dyn BlockHandler<DemoBlock>> = Arc::new(DemoIndexer {
        summaries: summaries.clone(),
        blocks_indexed: blocks_indexed.clone(),
    });
    let dispatcher = SerialBlockDispatcher::new(
        base.clone(),
        Arc::new(DemoChain),
        handler,
        events,
        fatal_tx,
        args.batch_size,
    );

    let heights: Vec<u64> = (1..=args.blocks).collect();
    let latest = heights.last().copied();
    dispatcher.enqueue_blocks(heights, latest)?;

    loop {
        if base.latest_processed_height() >= latest {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            err = indexer_core::fatal::wait_for_fatal(&mut fatal_rx) => {
                return Err(err);
            }
        }
    }

    controller.flush().await?;
    let processed = base.latest_processed_height();
    let indexed = blocks_indexed.load(Ordering::Relaxed);
    info!(?processed, indexed, "{}", indexer_core::metrics::gather_metrics());

    Ok(())
}
