//! Sequential call driver
//!
//! Places `call_count` calls one after another. Each call follows the same
//! sequence: resolve the destination, seed a record under a fresh call id,
//! place the call through a [`CallPlacer`], wait for the trace queues to
//! drain, then finish the call so its row (and any orphans) reach the sink.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rvoip_ip_trace::{CallContext, CallLifecycleTracker, CallTraceHandle, TraceHandle};

use crate::config::AppConfig;
use crate::error::{DriverError, Result};

/// How a placed call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    /// Answered and hung up normally
    Answered,
    /// Final non-2xx response from the far end
    Rejected { status: u16 },
    /// Failed locally before a final response
    Failed { reason: String },
}

/// Places one call and reports every SIP message through `trace`.
#[async_trait]
pub trait CallPlacer: Send + Sync {
    async fn place_call(&self, context: &CallContext, target_uri: &str, trace: CallTraceHandle) -> Result<CallOutcome>;
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub destination_domain: String,
    pub target_uri: String,
    pub call_count: usize,
    pub call_delay: Duration,
    pub call_timeout: Duration,
    pub cleanup_delay: Duration,
    /// Upper bound on waiting for queued trace events before finishing a call
    pub settle_timeout: Duration,
}

impl DriverSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            destination_domain: config.sip_settings.external_domain.trim().to_string(),
            target_uri: config.target_uri(),
            call_count: config.sip_settings.call_count,
            call_delay: Duration::from_millis(config.sip_settings.call_delay_ms),
            call_timeout: config.trace_settings.call_timeout(),
            cleanup_delay: config.trace_settings.cleanup_delay(),
            settle_timeout: config.trace_settings.settle_timeout(),
        }
    }
}

/// Totals for a driver run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    pub attempted: u64,
    pub answered: u64,
    pub rejected: u64,
    pub failed: u64,
    pub timed_out: u64,
    /// Rows handed to the sink, orphans included
    pub rows: u64,
}

pub struct LoadDriver {
    settings: DriverSettings,
    tracker: Arc<CallLifecycleTracker>,
    trace: TraceHandle,
    placer: Arc<dyn CallPlacer>,
}

impl LoadDriver {
    pub fn new(
        settings: DriverSettings,
        tracker: Arc<CallLifecycleTracker>,
        trace: TraceHandle,
        placer: Arc<dyn CallPlacer>,
    ) -> Self {
        Self {
            settings,
            tracker,
            trace,
            placer,
        }
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    /// Runs every configured call in sequence.
    pub async fn run(&self) -> DriverStats {
        let mut stats = DriverStats::default();
        let total = self.settings.call_count;

        info!(
            calls = total,
            target = %self.settings.target_uri,
            "Starting load run"
        );

        for index in 0..total {
            info!("Starting call {} of {}...", index + 1, total);
            self.run_call(&mut stats).await;

            if index + 1 < total && !self.settings.call_delay.is_zero() {
                tokio::time::sleep(self.settings.call_delay).await;
            }
        }

        info!(
            attempted = stats.attempted,
            answered = stats.answered,
            rejected = stats.rejected,
            failed = stats.failed,
            timed_out = stats.timed_out,
            rows = stats.rows,
            "Load run complete"
        );
        stats
    }

    async fn run_call(&self, stats: &mut DriverStats) {
        let resolved = self.tracker.resolve_address(&self.settings.destination_domain).await;
        let call_id = Uuid::new_v4().to_string();
        let context = self
            .tracker
            .start_call(&call_id, &self.settings.destination_domain, &resolved);
        let trace = self.trace.for_call(context.clone());

        stats.attempted += 1;
        let placed = with_timeout(
            "place_call",
            self.settings.call_timeout,
            self.placer.place_call(&context, &self.settings.target_uri, trace),
        )
        .await;

        match placed {
            Ok(CallOutcome::Answered) => {
                debug!(call_id = %call_id, "Call answered");
                stats.answered += 1;
            }
            Ok(CallOutcome::Rejected { status }) => {
                info!(call_id = %call_id, status, "Call rejected");
                stats.rejected += 1;
            }
            Ok(CallOutcome::Failed { reason }) => {
                warn!(call_id = %call_id, reason = %reason, "Call failed");
                stats.failed += 1;
            }
            Err(DriverError::OperationTimeout { .. }) => {
                warn!(call_id = %call_id, "Call timed out");
                stats.timed_out += 1;
            }
            Err(e) => {
                error!(call_id = %call_id, error = %e, "Call could not be placed");
                stats.failed += 1;
            }
        }

        // Late provisional and media events still need to land on the record
        if !self.settings.cleanup_delay.is_zero() {
            tokio::time::sleep(self.settings.cleanup_delay).await;
        }
        if !self.trace.settle(self.settings.settle_timeout).await {
            warn!(call_id = %call_id, pending = self.trace.pending(), "Trace queues not drained before finish");
        }

        stats.rows += self.tracker.finish_call(&call_id) as u64;
    }
}

/// Runs `future` with a deadline, mapping expiry to `OperationTimeout`.
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            error!(
                operation = operation_name,
                timeout_ms = timeout.as_millis(),
                "Operation timed out"
            );
            Err(DriverError::OperationTimeout {
                operation: operation_name.to_string(),
                duration_ms: timeout.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_expires() {
        let result: Result<()> = with_timeout("sleepy", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        match result {
            Err(DriverError::OperationTimeout { operation, duration_ms }) => {
                assert_eq!(operation, "sleepy");
                assert_eq!(duration_ms, 50);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_with_timeout_passes_result_through() {
        let value = with_timeout("quick", Duration::from_secs(1), async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);

        let err: Result<()> = with_timeout("failing", Duration::from_secs(1), async {
            Err(DriverError::CallSetupFailed { reason: "no route".into() })
        })
        .await;
        assert!(matches!(err, Err(DriverError::CallSetupFailed { .. })));
    }

    #[test]
    fn test_settings_from_config() {
        let config = AppConfig::from_json(
            r#"{"SipSettings": {"SipDomain": "pbx", "ExternalDomain": " far.example.org ", "CallCount": 3, "CallDelayMs": 10}}"#,
        )
        .unwrap();
        let settings = DriverSettings::from_config(&config);
        assert_eq!(settings.destination_domain, "far.example.org");
        assert_eq!(settings.target_uri, "sip:far.example.org");
        assert_eq!(settings.call_count, 3);
        assert_eq!(settings.call_delay, Duration::from_millis(10));
        assert_eq!(settings.settle_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_settle_timeout_comes_from_trace_settings() {
        let config = AppConfig::from_json(
            r#"{"SipSettings": {"SipDomain": "pbx", "ExternalDomain": "far.example.org"},
                "TraceSettings": {"SettleTimeoutMs": 1500}}"#,
        )
        .unwrap();
        assert_eq!(DriverSettings::from_config(&config).settle_timeout, Duration::from_millis(1500));
    }
}
