//! # RVoIP IP Trace
//!
//! Per-call network address correlation for SIP load testing.
//!
//! While a load driver places calls through a SIP stack, this crate listens
//! to the stack's trace hooks (messages arrive as `rvoip_sip_core::Message`
//! values or raw wire text), works out which call each message belongs to,
//! pulls every address it can find out of Contact, Route/Record-Route and Via
//! headers, SDP bodies and media packet sources, and writes one CSV row per
//! call when the call finishes.
//!
//! ## Components
//!
//! - [`extract`]: stateless address extraction and validation
//! - [`store`]: concurrent map of call id to [`CallRecord`]
//! - [`ingest`]: channel fan-in from trace hooks into the store
//! - [`lifecycle`]: start/finish of calls, destination resolution, orphan sweep
//! - [`sink`]: append-only CSV output with a fixed schema
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use rvoip_ip_trace::prelude::*;
//!
//! let store = Arc::new(CallRecordStore::new());
//! let sink = Arc::new(MemorySink::new());
//! let tracker = CallLifecycleTracker::new(store.clone(), sink.clone());
//! let ingestor = TraceIngestor::new(store.clone());
//!
//! let ctx = tracker.start_call("abc", "sip.example.com", "203.0.113.1");
//! ingestor.ingest(&TraceEvent::Signaling(SignalingTrace {
//!     direction: TraceDirection::InboundResponse,
//!     local: None,
//!     remote: Some("203.0.113.3:5060".parse().unwrap()),
//!     payload: "SIP/2.0 200 OK\r\nCall-ID: abc\r\nContact: <sip:x@203.0.113.2:5060>\r\nContent-Length: 0\r\n\r\n".into(),
//!     context: Some(ctx),
//! }));
//! tracker.finish_call("abc");
//!
//! let row = &sink.records()[0];
//! assert_eq!(row.call_status, Some(CallStatus::Success));
//! assert!(row.all_detected_ips.contains("203.0.113.2"));
//! ```

pub mod error;
pub mod extract;
pub mod ingest;
pub mod lifecycle;
pub mod message;
pub mod record;
pub mod sink;
pub mod store;

pub use error::{Result, TraceError};
pub use ingest::{CallTraceHandle, IngestStats, IngestTask, MediaType, TraceEvent, TraceHandle, TraceIngestor};
pub use lifecycle::{AddressResolver, CallContext, CallLifecycleTracker, SystemResolver};
pub use message::{parse_wire, MessageKind, SipMessageView, TraceDirection};
pub use record::{CallDelta, CallRecord, CallStatus, RecordSeed};
pub use sink::{CsvFileSink, MemorySink, RecordSink};
pub use store::CallRecordStore;

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        extract::{extract_from_session_description, extract_from_text},
        ingest::{MediaTrace, SignalingTrace, TracePayload},
        record::{NOT_AVAILABLE, UNKNOWN_CALL_ID, UNKNOWN_DOMAIN},
        sink::CSV_HEADER,
        AddressResolver, CallContext, CallLifecycleTracker, CallRecord, CallRecordStore, CallStatus,
        CallTraceHandle, CsvFileSink, IngestStats, MediaType, MemorySink, RecordSink, SipMessageView,
        TraceDirection, TraceError, TraceEvent, TraceHandle, TraceIngestor,
    };
}
