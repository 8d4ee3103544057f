//! Load tester configuration
//!
//! Read from an `appsettings.json` file with PascalCase keys:
//!
//! ```json
//! {
//!   "SipSettings": {
//!     "SipDomain": "pbx.example.com",
//!     "Username": "1001",
//!     "Password": "secret",
//!     "ExternalDomain": "sip.example.net",
//!     "CallCount": 100,
//!     "CallDelayMs": 5000
//!   },
//!   "LogSettings": { "LogDirectory": "logs", "FileInfo": true },
//!   "TraceSettings": { "SettleTimeoutMs": 5000 },
//!   "TransportSettings": { "BindAddress": "0.0.0.0:5060" }
//! }
//! ```
//!
//! Only `SipSettings.SipDomain` and `SipSettings.ExternalDomain` are required;
//! everything else has a default.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DriverError, Result};

fn default_call_count() -> usize {
    100
}

fn default_call_delay_ms() -> u64 {
    5000
}

/// Account and destination settings.
#[derive(Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SipSettings {
    pub sip_domain: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub external_domain: String,
    #[serde(default = "default_call_count")]
    pub call_count: usize,
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,
}

// Keep the password out of logs
impl fmt::Debug for SipSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SipSettings")
            .field("sip_domain", &self.sip_domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("external_domain", &self.external_domain)
            .field("call_count", &self.call_count)
            .field("call_delay_ms", &self.call_delay_ms)
            .finish()
    }
}

/// Output and log formatting settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct LogSettings {
    pub log_directory: String,
    pub log_level: String,
    pub json_logs: bool,
    /// Source file and line on every event
    pub file_info: bool,
    /// Span open/close events
    pub log_spans: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            log_directory: "logs".to_string(),
            log_level: "info".to_string(),
            json_logs: false,
            file_info: false,
            log_spans: false,
        }
    }
}

/// Timeouts and queue sizes around each call.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TraceSettings {
    pub resolve_timeout_ms: u64,
    pub call_timeout_secs: u64,
    pub hangup_delay_ms: u64,
    pub cleanup_delay_ms: u64,
    /// Bound on waiting for queued trace events before a call is finished
    pub settle_timeout_ms: u64,
    pub channel_capacity: usize,
}

impl Default for TraceSettings {
    fn default() -> Self {
        Self {
            resolve_timeout_ms: 5000,
            call_timeout_secs: 60,
            hangup_delay_ms: 2000,
            cleanup_delay_ms: 500,
            settle_timeout_ms: 5000,
            channel_capacity: 1024,
        }
    }
}

impl TraceSettings {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn hangup_delay(&self) -> Duration {
        Duration::from_millis(self.hangup_delay_ms)
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.cleanup_delay_ms)
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

/// Local SIP/RTP endpoint used when calls go out over the network.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct TransportSettings {
    /// UDP address the SIP transport binds to
    pub bind_address: String,
    /// IP advertised in Via, Contact and SDP; defaults to the local
    /// address of the route toward the destination
    pub public_address: Option<String>,
    /// Port dialed on the resolved destination
    pub remote_port: u16,
    /// UDP port for the RTP socket, 0 for any
    pub rtp_port: u16,
    /// Wait for a final response to INVITE or BYE
    pub transaction_timeout_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5060".to_string(),
            public_address: None,
            remote_port: 5060,
            rtp_port: 0,
            transaction_timeout_ms: 32_000,
        }
    }
}

impl TransportSettings {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind_address
            .trim()
            .parse()
            .map_err(|_| DriverError::Config(format!("Invalid TransportSettings.BindAddress: {}", self.bind_address)))
    }

    pub fn public_ip(&self) -> Result<Option<IpAddr>> {
        self.public_address
            .as_deref()
            .map(str::trim)
            .filter(|addr| !addr.is_empty())
            .map(|addr| {
                addr.parse()
                    .map_err(|_| DriverError::Config(format!("Invalid TransportSettings.PublicAddress: {}", addr)))
            })
            .transpose()
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppConfig {
    pub sip_settings: SipSettings,
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub trace_settings: TraceSettings,
    #[serde(default)]
    pub transport_settings: TransportSettings,
}

impl AppConfig {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| DriverError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: AppConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sip_settings.external_domain.trim().is_empty() {
            return Err(DriverError::Config("SipSettings.ExternalDomain must not be empty".to_string()));
        }
        if self.sip_settings.call_count == 0 {
            return Err(DriverError::Config("SipSettings.CallCount must be greater than zero".to_string()));
        }
        if self.log_settings.log_directory.trim().is_empty() {
            return Err(DriverError::Config("LogSettings.LogDirectory must not be empty".to_string()));
        }
        if self.trace_settings.channel_capacity == 0 {
            return Err(DriverError::Config("TraceSettings.ChannelCapacity must be greater than zero".to_string()));
        }
        self.transport_settings.bind_addr()?;
        self.transport_settings.public_ip()?;
        Ok(())
    }

    /// Request URI dialed for every call.
    pub fn target_uri(&self) -> String {
        format!("sip:{}", self.sip_settings.external_domain.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{
        "SipSettings": {
            "SipDomain": "pbx.example.com",
            "Username": "1001",
            "Password": "hunter2",
            "ExternalDomain": "sip.example.net"
        },
        "LogSettings": { "LogDirectory": "out" }
    }"#;

    #[test]
    fn test_defaults_applied() {
        let config = AppConfig::from_json(MINIMAL).unwrap();
        assert_eq!(config.sip_settings.call_count, 100);
        assert_eq!(config.sip_settings.call_delay_ms, 5000);
        assert_eq!(config.log_settings.log_directory, "out");
        assert_eq!(config.log_settings.log_level, "info");
        assert_eq!(config.trace_settings.call_timeout(), Duration::from_secs(60));
        assert_eq!(config.trace_settings.settle_timeout(), Duration::from_secs(5));
        assert!(!config.log_settings.file_info);
        assert_eq!(config.transport_settings.remote_port, 5060);
        assert_eq!(config.target_uri(), "sip:sip.example.net");
    }

    #[test]
    fn test_optional_sections_override_defaults() {
        let text = MINIMAL.replace(
            "\"LogSettings\": { \"LogDirectory\": \"out\" }",
            r#""LogSettings": { "LogDirectory": "out", "FileInfo": true, "LogSpans": true },
            "TraceSettings": { "SettleTimeoutMs": 250 },
            "TransportSettings": { "BindAddress": "127.0.0.1:0", "PublicAddress": "203.0.113.9", "RemotePort": 5080 }"#,
        );
        let config = AppConfig::from_json(&text).unwrap();
        assert!(config.log_settings.file_info);
        assert!(config.log_settings.log_spans);
        assert_eq!(config.trace_settings.settle_timeout(), Duration::from_millis(250));
        assert_eq!(config.transport_settings.bind_addr().unwrap(), "127.0.0.1:0".parse().unwrap());
        assert_eq!(config.transport_settings.remote_port, 5080);
        assert_eq!(config.transport_settings.public_ip().unwrap(), Some("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn test_password_is_redacted() {
        let config = AppConfig::from_json(MINIMAL).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn test_validation_errors() {
        let empty_domain = MINIMAL.replace("sip.example.net", " ");
        assert!(matches!(AppConfig::from_json(&empty_domain), Err(DriverError::Config(_))));

        let zero_calls = MINIMAL.replace("\"ExternalDomain\"", "\"CallCount\": 0, \"ExternalDomain\"");
        assert!(matches!(AppConfig::from_json(&zero_calls), Err(DriverError::Config(_))));

        assert!(matches!(AppConfig::from_json("{}"), Err(DriverError::ConfigParse(_))));

        let bad_bind = MINIMAL.replace(
            "\"LogSettings\"",
            "\"TransportSettings\": { \"BindAddress\": \"nowhere\" }, \"LogSettings\"",
        );
        assert!(matches!(AppConfig::from_json(&bad_bind), Err(DriverError::Config(_))));

        let bad_public = MINIMAL.replace(
            "\"LogSettings\"",
            "\"TransportSettings\": { \"PublicAddress\": \"pbx.local\" }, \"LogSettings\"",
        );
        assert!(matches!(AppConfig::from_json(&bad_public), Err(DriverError::Config(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::from_file("/nonexistent/appsettings.json").unwrap_err();
        assert!(matches!(err, DriverError::ConfigRead { .. }));
    }
}
