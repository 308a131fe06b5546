//! Error taxonomy for the dispatch pipeline and store cache (§7).
//! Replaces the earlier ad hoc `Box<dyn std::error::Error>` with a
//! typed enum so callers (and tests) can match on error kind instead of
//! string-sniffing.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Debug, Clone, Error)]
pub enum IndexerError {
    /// `fetch_blocks_batches` failed. The fetch loop logs and terminates the
    /// process unless it is already shutting down.
    #[error("block fetch failed: {0}")]
    Fetch(String),

    /// The user-supplied `BlockHandler::index_block` returned an error.
    /// Carries the height so the caller can log it alongside the handler
    /// name.
    #[error("indexing failed at height {height}: {source}")]
    Handler { height: u64, source: String },

    /// A precondition was violated by the caller: `put_many` beyond free
    /// space, `bulkUpdate` with a `fields` subset, a non-monotone `set`,
    /// etc. Per §7, these indicate a bug, not a runtime condition. Methods
    /// that can hit this return `Result` so tests can assert on it, but
    /// non-test callers are expected to `.expect()`/`.unwrap()` them - the
    /// whole point is to fail loudly rather than limp along.
    #[error("programmer error: {0}")]
    Programmer(String),

    /// A flush transaction failed and was rolled back. Because caches are
    /// cleared optimistically before the DB commit (§4.5, §9), this is
    /// unrecoverable in-process and must be surfaced as fatal.
    #[error("flush failed: {0}")]
    Flush(String),

    /// The repository (storage backend) returned an error outside of a
    /// flush (e.g. a cache-miss lookup).
    #[error("repository error: {0}")]
    Repository(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    /// True for error kinds that §7 marks as fatal (process should exit):
    /// fetch failures, handler failures, and flush failures. Stale batches
    /// and cache-programmer errors are handled locally / not meant to be
    /// recovered from in production respectively, but are not part of the
    /// fatal-channel contract - a cache-programmer error should panic at the
    /// call site rather than travel through the channel.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexerError::Fetch(_) | IndexerError::Handler { .. } | IndexerError::Flush(_)
        )
    }

    pub fn programmer(msg: impl Into<String>) -> Self {
        IndexerError::Programmer(msg.into())
    }
}

impl From<sqlx::Error> for IndexerError {
    fn from(e: sqlx::Error) -> Self {
        IndexerError::Repository(e.to_string())
    }
}

impl From<Box<dyn std::error::Error>> for IndexerError {
    fn from(e: Box<dyn std::error::Error>) -> Self {
        IndexerError::Config(e.to_string())
    }
}
