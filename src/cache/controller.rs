//! C7: Store cache controller.
//!
//! Owns every per-entity C5 instance plus the singleton C6, decides when a
//! flush boundary has been crossed, and coordinates the one atomic flush
//! transaction all of them share (§4.7). Composition, not cyclic ownership,
//! with the dispatcher (§9): C8/C9 hold a non-owning handle to this
//! controller and call `flush`/`should_flush`, they never reach into the
//! per-entity caches directly.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::entity_model::{CachedEntityModel, Entity};
use crate::cache::metadata_model::CachedMetadataModel;
use crate::error::Result;
use crate::metrics;
use crate::storage::repository::{Repository, RepositoryTx};

/// Type-erased flush capability, so C7 can hold one heterogeneous list of
/// C5 instances without knowing each entity's concrete payload type.
#[async_trait]
pub trait FlushableModel: Send {
    fn is_flushable(&self) -> bool;
    fn flushable_record_count(&self) -> usize;
    async fn flush(&mut self, tx: &mut dyn RepositoryTx) -> Result<u64>;
}

#[async_trait]
impl<E: Entity> FlushableModel for CachedEntityModel<E> {
    fn is_flushable(&self) -> bool {
        CachedEntityModel::is_flushable(self)
    }

    fn flushable_record_count(&self) -> usize {
        CachedEntityModel::flushable_record_count(self)
    }

    async fn flush(&mut self, tx: &mut dyn RepositoryTx) -> Result<u64> {
        CachedEntityModel::flush(self, tx).await
    }
}

/// Shared handle to one registered C5 instance. Handler code clones this
/// and locks it per call; the controller only ever touches it during a
/// flush (§5: single-writer per entity type, reads only during flush).
pub type EntityHandle<E> = Arc<AsyncMutex<CachedEntityModel<E>>>;

pub fn entity_handle<E: Entity>(model: CachedEntityModel<E>) -> EntityHandle<E> {
    Arc::new(AsyncMutex::new(model))
}

struct RegisteredModel(Arc<AsyncMutex<dyn FlushableModel>>);

/// Coordinates flush timing and the single shared transaction across every
/// registered model.
pub struct StoreCacheController {
    repo: Arc<dyn Repository>,
    models: Vec<RegisteredModel>,
    metadata: Arc<AsyncMutex<CachedMetadataModel>>,
    flush_record_threshold: usize,
    flush_lock: AsyncMutex<()>,
}

impl StoreCacheController {
    pub fn new(
        repo: Arc<dyn Repository>,
        metadata: Arc<AsyncMutex<CachedMetadataModel>>,
        flush_record_threshold: usize,
    ) -> Self {
        Self {
            repo,
            models: Vec::new(),
            metadata,
            flush_record_threshold,
            flush_lock: AsyncMutex::new(()),
        }
    }

    /// Registers one C5 instance for flush participation. Entities are
    /// flushed in registration order, metadata always last, so watermarks
    /// advanced by C8 after a flush reflect fully-committed data.
    pub fn register<E: Entity>(&mut self, model: EntityHandle<E>) {
        let erased: Arc<AsyncMutex<dyn FlushableModel>> = model;
        self.models.push(RegisteredModel(erased));
    }

    /// Sum of every registered model's `flushableRecordCounter`, the
    /// record-count half of C7's flush-boundary decision (§4.7).
    pub async fn total_flushable_records(&self) -> usize {
        let mut total = 0;
        for m in &self.models {
            total += m.0.lock().await.flushable_record_count();
        }
        total += self.metadata.lock().await.flushable_record_count();
        total
    }

    pub async fn should_flush_by_record_count(&self) -> bool {
        self.total_flushable_records().await > self.flush_record_threshold
    }

    /// Atomic flush procedure (§4.7): one transaction, every flushable
    /// model in registration order, metadata last, commit or roll back as
    /// one unit. Concurrent callers serialise on `flush_lock` so no second
    /// flush can start before the prior one finishes.
    pub async fn flush(&self) -> Result<()> {
        let _guard = self.flush_lock.lock().await;
        let stopwatch = metrics::Stopwatch::new();

        let mut tx = self.repo.begin().await?;
        let mut total_written = 0u64;

        let result: Result<()> = async {
            for m in &self.models {
                let mut guard = m.0.lock().await;
                if guard.is_flushable() {
                    total_written += guard.flush(tx.as_mut()).await?;
                }
            }
            let mut metadata = self.metadata.lock().await;
            if metadata.is_flushable() {
                total_written += metadata.flush(tx.as_mut()).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                metrics::record_flush(stopwatch.elapsed_secs(), total_written);
                Ok(())
            }
            Err(e) => {
                // Caches were already cleared by each model's `flush` before
                // this point, per the fire-and-clear design kept from the
                // source (§9): a rollback here cannot restore in-memory
                // state, so the caller must treat this as fatal.
                metrics::FLUSH_FAILURES.inc();
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryRepository;
    use crate::storage::repository::EntitySchema;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Account {
        id: String,
        balance: i64,
    }

    impl Entity for Account {
        fn id(&self) -> String {
            self.id.clone()
        }
    }

    const ACCOUNTS: EntitySchema = EntitySchema::new("accounts");

    #[tokio::test]
    async fn flush_commits_entity_and_metadata_writes_together() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let metadata = Arc::new(AsyncMutex::new(CachedMetadataModel::new(["processedBlockCount".to_string()])));
        let mut controller = StoreCacheController::new(repo.clone(), metadata.clone(), 1000);

        let accounts = entity_handle(CachedEntityModel::<Account>::new(ACCOUNTS, false, 100, Duration::from_secs(60)));
        {
            let mut guard = accounts.lock().await;
            guard.set("a", Account { id: "a".into(), balance: 1 }, 1).unwrap();
        }
        controller.register(accounts.clone());
        metadata.lock().await.set_increment("processedBlockCount", 5.0).unwrap();

        controller.flush().await.unwrap();

        assert!(!accounts.lock().await.is_flushable());
        assert!(!metadata.lock().await.is_flushable());
        let found = repo.find_by_pk(ACCOUNTS, "a").await.unwrap().unwrap();
        assert_eq!(found.data["balance"], 1);
    }

    #[tokio::test]
    async fn should_flush_by_record_count_respects_threshold() {
        let repo: Arc<dyn Repository> = Arc::new(MemoryRepository::new());
        let metadata = Arc::new(AsyncMutex::new(CachedMetadataModel::new([])));
        let mut controller = StoreCacheController::new(repo, metadata, 1);

        let accounts = entity_handle(CachedEntityModel::<Account>::new(ACCOUNTS, false, 100, Duration::from_secs(60)));
        controller.register(accounts.clone());
        assert!(!controller.should_flush_by_record_count().await);

        accounts
            .lock()
            .await
            .set("a", Account { id: "a".into(), balance: 1 }, 1)
            .unwrap();
        accounts
            .lock()
            .await
            .set("b", Account { id: "b".into(), balance: 2 }, 1)
            .unwrap();
        assert!(controller.should_flush_by_record_count().await);
    }
}
