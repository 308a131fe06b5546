//! Block dispatch pipeline and historical write-through entity cache for a
//! chain indexer runtime.
//!
//! Two halves, independently usable:
//!
//! - [`dispatch`]: a bounded height queue (C1) feeding an ordered task
//!   runner (C2), wired together by a base dispatcher (C8) and the
//!   concrete serial fetch/index strategy (C9).
//! - [`cache`]: per-entity write-through caches (C5) and a singleton
//!   metadata cache (C6), coordinated by a store cache controller (C7)
//!   that owns the one flush transaction all of them share.
//!
//! [`chain`], [`handler`], [`events`], [`fatal`] are the seams a host
//! process plugs in: a block source, per-block indexing logic, a
//! notification sink, and a channel for unrecoverable errors.

pub mod cache;
pub mod chain;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod fatal;
pub mod handler;
pub mod metrics;
pub mod storage;
pub mod telemetry;

pub use cache::{entity_handle, CachedEntityModel, CachedMetadataModel, Entity, EntityHandle, Page, StoreCacheController};
pub use chain::BlockSource;
pub use config::{CacheConfig, DatabaseConfig, IndexerConfig};
pub use dispatch::{BaseBlockDispatcher, FlushCadence, HeightQueue, OrderedTaskRunner, SerialBlockDispatcher};
pub use error::{IndexerError, Result};
pub use events::EventSink;
pub use handler::{BlockHandler, ProcessBlockResponse};
pub use storage::{EntityRow, EntitySchema, MemoryRepository, PostgresRepository, Repository, RepositoryTx};
