//! Call lifecycle tracking
//!
//! The load driver brackets every call with [`CallLifecycleTracker::start_call`]
//! and [`CallLifecycleTracker::finish_call`]. Starting a call seeds its record
//! and returns a [`CallContext`] that travels with the call's trace events;
//! finishing it detaches the record, writes it to the sink and sweeps any
//! other record that accumulated evidence under an identifier nobody
//! finished (typically the SIP Call-ID chosen by the protocol engine).
//! Records that never gathered evidence and belong to no call in progress
//! are discarded by the same sweep.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashSet;
use tracing::{debug, info, warn};

use crate::error::{Result, TraceError};
use crate::record::{CallRecord, RecordSeed, NOT_AVAILABLE};
use crate::sink::RecordSink;
use crate::store::CallRecordStore;

/// Default bound on a single destination lookup.
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Explicit per-call context threaded from start to finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    /// Tracking identifier chosen by the driver
    pub call_id: String,
    pub destination_domain: String,
    pub resolved_destination_ip: String,
    pub started_at: DateTime<Utc>,
}

impl CallContext {
    pub fn new(
        call_id: impl Into<String>,
        destination_domain: impl Into<String>,
        resolved_destination_ip: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            destination_domain: destination_domain.into(),
            resolved_destination_ip: resolved_destination_ip.into(),
            started_at: Utc::now(),
        }
    }

    /// Defaults for records created on behalf of this call.
    pub fn seed(&self) -> RecordSeed {
        RecordSeed::new(self.destination_domain.clone(), self.resolved_destination_ip.clone())
    }
}

/// Host name lookup used ahead of dialing.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the operating system via `tokio::net::lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| TraceError::Resolution {
                destination: host.to_string(),
                reason: e.to_string(),
            })?;
        Ok(addrs.map(|sa| sa.ip()).collect())
    }
}

/// Reduces a dial string to the host part.
///
/// Strips `sip:`/`sips:` schemes, any `user@` part, URI parameters and a
/// trailing port. Bracketed and bare IPv6 literals are kept intact.
pub fn destination_host(destination: &str) -> &str {
    let mut host = destination.trim();
    for scheme in ["sips:", "sip:"] {
        if host.get(..scheme.len()).is_some_and(|prefix| prefix.eq_ignore_ascii_case(scheme)) {
            host = &host[scheme.len()..];
            break;
        }
    }
    if let Some((_, after)) = host.rsplit_once('@') {
        host = after;
    }
    if let Some(idx) = host.find([';', '?']) {
        host = &host[..idx];
    }

    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    if host.parse::<IpAddr>().is_ok() {
        return host;
    }
    host.split(':').next().unwrap_or(host)
}

/// Start/finish bookkeeping around the record store.
pub struct CallLifecycleTracker {
    store: Arc<CallRecordStore>,
    sink: Arc<dyn RecordSink>,
    resolver: Arc<dyn AddressResolver>,
    resolve_timeout: Duration,
    // started and not yet finished
    active: DashSet<String>,
}

impl CallLifecycleTracker {
    pub fn new(store: Arc<CallRecordStore>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            store,
            sink,
            resolver: Arc::new(SystemResolver),
            resolve_timeout: DEFAULT_RESOLVE_TIMEOUT,
            active: DashSet::new(),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn AddressResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<CallRecordStore> {
        &self.store
    }

    /// Resolves `destination` to its first address, or [`NOT_AVAILABLE`].
    pub async fn resolve_address(&self, destination: &str) -> String {
        match self.try_resolve(destination).await {
            Ok(ip) => {
                debug!(destination = %destination, ip = %ip, "Resolved destination");
                ip.to_string()
            }
            Err(e) => {
                warn!(destination = %destination, error = %e, "Failed to resolve IP for {}", destination);
                NOT_AVAILABLE.to_string()
            }
        }
    }

    async fn try_resolve(&self, destination: &str) -> Result<IpAddr> {
        let host = destination_host(destination);
        if host.is_empty() {
            return Err(TraceError::NoAddress(destination.to_string()));
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }

        let addrs = tokio::time::timeout(self.resolve_timeout, self.resolver.lookup(host))
            .await
            .map_err(|_| TraceError::ResolutionTimeout {
                destination: destination.to_string(),
                timeout_ms: self.resolve_timeout.as_millis() as u64,
            })??;

        addrs
            .into_iter()
            .next()
            .ok_or_else(|| TraceError::NoAddress(destination.to_string()))
    }

    /// Seeds the record for a call about to be placed.
    pub fn start_call(
        &self,
        call_id: &str,
        destination_domain: &str,
        resolved_ip: &str,
    ) -> Arc<CallContext> {
        let context = Arc::new(CallContext::new(call_id, destination_domain, resolved_ip));
        self.active.insert(call_id.to_string());
        if !self.store.seed(call_id, &context.seed()) {
            debug!(call_id = %call_id, "Record already existed at call start");
        }
        context
    }

    /// Finalizes a call and sweeps orphaned records.
    ///
    /// Always writes exactly one row for `call_id`, using a placeholder when
    /// no record exists. Returns the total number of rows handed to the sink.
    pub fn finish_call(&self, call_id: &str) -> usize {
        self.active.remove(call_id);
        let record = self.store.remove(call_id).unwrap_or_else(|| {
            debug!(call_id = %call_id, "No record at finish, logging placeholder");
            CallRecord::placeholder(call_id)
        });
        self.sink.append(&record);

        1 + self.sweep_orphans(call_id)
    }

    // Every other record with evidence is relabelled under the finishing call
    // and flushed. Unrelated concurrent calls can end up in this call's rows.
    // Empty records are dropped unless their call is still in progress.
    fn sweep_orphans(&self, call_id: &str) -> usize {
        let mut flushed = 0;
        let mut discarded = 0;
        for (key, snapshot) in self.store.snapshot() {
            if key == call_id {
                continue;
            }
            if !snapshot.has_evidence() {
                if !self.active.contains(&key) && self.store.remove(&key).is_some() {
                    discarded += 1;
                }
                continue;
            }
            if let Some(mut orphan) = self.store.remove(&key) {
                orphan.call_id = format!("{}_sip_{}", call_id, key);
                self.sink.append(&orphan);
                flushed += 1;
            }
        }
        if flushed > 0 {
            info!(call_id = %call_id, orphans = flushed, "Flushed orphaned call records");
        }
        if discarded > 0 {
            debug!(call_id = %call_id, discarded = discarded, "Discarded call records without evidence");
        }
        flushed
    }
}
