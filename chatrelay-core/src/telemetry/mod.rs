//! Telemetry primitives for relayed streams.
//! By default, no telemetry is emitted unless a sink is installed via `set_telemetry_sink`.

pub mod keys;
pub mod types;
#[cfg(test)]
pub mod test_span;

pub use keys::*;
pub use types::*;

use std::sync::Arc;

use once_cell::sync::OnceCell;

/// Implement this to receive one record per finished stream.
///
/// Requirements:
/// - Implementations must be thread-safe (`Send + Sync`) and `'static`.
/// - `record` **may** be called from any thread; implementations should avoid panicking.
/// - Keep overhead minimal; this runs at the end of every request.
pub trait TelemetrySink: Send + Sync + 'static {
    fn record(&self, trace: RelayTrace);
}

static TELEMETRY_SINK: OnceCell<Arc<dyn TelemetrySink>> = OnceCell::new();

/// Install a global telemetry sink. Returns `false` if a sink is already installed.
///
/// This is a write-once global for the process lifetime (backed by `OnceCell`).
pub fn set_telemetry_sink(sink: Arc<dyn TelemetrySink>) -> bool {
    TELEMETRY_SINK.set(sink).is_ok()
}

/// Emit a telemetry record if a sink is installed.
#[inline]
pub(crate) fn emit(trace: RelayTrace) {
    if let Some(sink) = TELEMETRY_SINK.get() {
        sink.record(trace);
    }
}
