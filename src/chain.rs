//! Downward interface the dispatch pipeline consumes from the chain client
//! (§6 External Interfaces). The network-specific RPC client itself is out
//! of scope; this is only the seam C9 calls through.

use async_trait::async_trait;

use crate::error::Result;

/// Batched block retrieval, keyed by height. Implementations must return
/// blocks in the same order as `heights` was given.
#[async_trait]
pub trait BlockSource<B>: Send + Sync {
    async fn fetch_blocks_batches(&self, heights: &[u64]) -> Result<Vec<B>>;

    /// Pure projection from a fetched block to its height.
    fn block_height(&self, block: &B) -> u64;
}
