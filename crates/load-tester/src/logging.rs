//! Tracing subscriber for the load tester binary
//!
//! Everything comes from the `LogSettings` section; `RUST_LOG` directives,
//! when present, refine the configured level per target.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LogSettings;
use crate::error::{DriverError, Result};

/// Subscriber options resolved from [`LogSettings`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogOptions {
    pub level: Level,
    pub json: bool,
    pub file_info: bool,
    pub log_spans: bool,
}

impl TryFrom<&LogSettings> for LogOptions {
    type Error = DriverError;

    fn try_from(settings: &LogSettings) -> Result<Self> {
        Ok(Self {
            level: parse_log_level(&settings.log_level)?,
            json: settings.json_logs,
            file_info: settings.file_info,
            log_spans: settings.log_spans,
        })
    }
}

impl LogOptions {
    /// Call and transaction spans are only reported once they close.
    fn span_events(&self) -> FmtSpan {
        if self.log_spans {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env_lossy()
    }
}

/// Installs the global subscriber. Fails if one is already set.
pub fn setup_logging(options: &LogOptions) -> Result<()> {
    let subscriber = fmt()
        .with_env_filter(options.filter())
        .with_span_events(options.span_events())
        .with_file(options.file_info)
        .with_line_number(options.file_info)
        .with_target(!options.json);

    let installed = if options.json {
        subscriber.json().flatten_event(true).try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| DriverError::Logging(e.to_string()))
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level.trim()).map_err(|_| DriverError::Config(format!("Invalid log level: {}", level)))
}

pub fn log_welcome(app_name: &str, version: &str) {
    tracing::info!("Starting {} v{}", app_name, version);
}
