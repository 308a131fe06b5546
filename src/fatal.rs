//! Fatal-error channel (§9 re-architecture guidance: replace the source's
//! global logger / `process.exit` with an injected telemetry sink and a
//! fatal-error channel surfaced to the host). A fetch failure, a handler
//! failure, or a flush failure all end up here; the host process decides
//! what "terminate" means (exit code, supervisor restart, span event).

use tokio::sync::watch;

use crate::error::IndexerError;

pub type FatalSender = watch::Sender<Option<IndexerError>>;
pub type FatalReceiver = watch::Receiver<Option<IndexerError>>;

/// A fresh channel with no fatal error recorded yet.
pub fn channel() -> (FatalSender, FatalReceiver) {
    watch::channel(None)
}

/// Blocks until a fatal error is reported, then returns it. Intended for a
/// host task that `select!`s this against its own shutdown signal.
pub async fn wait_for_fatal(rx: &mut FatalReceiver) -> IndexerError {
    loop {
        if rx.changed().await.is_err() {
            // Sender dropped without ever reporting a fatal error - the
            // pipeline shut down cleanly instead.
            std::future::pending::<()>().await;
        }
        if let Some(err) = rx.borrow_and_update().clone() {
            return err;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_fatal_resolves_once_an_error_is_sent() {
        let (tx, mut rx) = channel();
        tx.send(Some(IndexerError::Fetch("boom".into()))).unwrap();
        let err = wait_for_fatal(&mut rx).await;
        assert!(matches!(err, IndexerError::Fetch(_)));
    }
}
