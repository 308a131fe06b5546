//! Fire-and-forget event sink (§6): queue-size and progress notifications
//! emitted by the dispatcher. Never awaited by the caller, never fatal.

use serde_json::Value;
use tracing::info;

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);
}

/// Default sink: routes events through structured logging instead of a
/// real transport, so the pipeline has somewhere to emit even with no
/// websocket/metrics consumer wired up.
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: &str, payload: Value) {
        info!(event, %payload, "dispatch event");
    }
}

/// Discards every event. Useful in tests that don't care about the
/// progress/queue-size stream.
#[derive(Debug, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: &str, _payload: Value) {}
}
