//! User-handler dispatch seam (§6). Dynamic handler loading itself is out
//! of scope; the core only needs somewhere to call into indexing logic and
//! something to read its response back.

use async_trait::async_trait;

use crate::error::Result;

/// Dynamic-datasource additions and any other per-block derived state a
/// handler wants to hand back to the dispatcher (e.g. proof-of-indexing
/// input). Dynamic datasource *discovery* beyond this hook point is out of
/// scope (§1 Non-goals); `dynamic_datasources` here is just the list of
/// opaque descriptors the dispatcher forwards on.
#[derive(Debug, Clone, Default)]
pub struct ProcessBlockResponse {
    pub dynamic_datasources: Vec<String>,
}

/// One block's worth of indexing logic, invoked once per block by a C2
/// task. May itself read/write through the store handed to it separately
/// by the caller (the core does not constrain how a handler reaches C5/C6).
#[async_trait]
pub trait BlockHandler<B>: Send + Sync {
    async fn index_block(&self, block: &B) -> Result<ProcessBlockResponse>;
}
