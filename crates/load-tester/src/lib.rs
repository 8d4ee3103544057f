//! SIP load tester
//!
//! Places a configurable number of sequential calls and records, for each
//! one, every IP address observed in its signaling and media. Rows land in a
//! CSV file through [`rvoip_ip_trace::CsvFileSink`].
//!
//! The pieces:
//!
//! - [`config`]: `appsettings.json` loading and validation
//! - [`logging`]: tracing subscriber setup
//! - [`driver`]: the sequential call loop and the [`CallPlacer`] seam
//! - [`network`]: places real calls over UDP with the rvoip SIP transport
//! - [`simulated`]: a scripted placer for dry runs that never touch the network
//! - [`uac`]: request construction and dialog state shared by both placers

pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod network;
pub mod simulated;
pub mod uac;

pub use config::{AppConfig, LogSettings, SipSettings, TraceSettings, TransportSettings};
pub use driver::{with_timeout, CallOutcome, CallPlacer, DriverSettings, DriverStats, LoadDriver};
pub use error::{DriverError, Result};
pub use logging::{setup_logging, LogOptions};
pub use network::{NetworkSettings, SipPlacer};
pub use simulated::{ScriptSettings, ScriptedPlacer};
