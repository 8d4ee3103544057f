//! Error types for the load tester

use thiserror::Error;

use rvoip_ip_trace::TraceError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to read configuration file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration JSON: {0}")]
    ConfigParse(#[from] serde_json::Error),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Call setup failed: {reason}")]
    CallSetupFailed { reason: String },

    #[error("Operation {operation} timed out after {duration_ms}ms")]
    OperationTimeout { operation: String, duration_ms: u64 },

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("SIP message error: {0}")]
    Sip(#[from] rvoip_sip_core::Error),

    #[error("SIP transport error: {0}")]
    Transport(#[from] rvoip_sip_transport::Error),

    #[error("Media socket error: {0}")]
    Media(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;
