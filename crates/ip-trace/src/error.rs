//! Error types for the ip-trace library

use thiserror::Error;

/// Errors raised inside the correlation engine.
///
/// None of these escape the best-effort entry points (`TraceIngestor::ingest`,
/// `CallLifecycleTracker::resolve_address`, `RecordSink::append`); they are
/// logged there and the caller sees degraded data instead.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Failed to parse SIP trace message: {0}")]
    Parse(String),

    #[error("Address resolution failed for {destination}: {reason}")]
    Resolution { destination: String, reason: String },

    #[error("Address resolution for {destination} timed out after {timeout_ms}ms")]
    ResolutionTimeout { destination: String, timeout_ms: u64 },

    #[error("No addresses returned for {0}")]
    NoAddress(String),

    #[error("Trace handler panicked: {0}")]
    HandlerPanic(String),

    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TraceError>;
