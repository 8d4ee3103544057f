//! Trace event ingestion
//!
//! The protocol engine reports every message it sends or receives through
//! four signaling hooks (inbound/outbound × request/response) plus a media
//! packet hook. Each hook feeds its own bounded channel; a single ingestion
//! task drains all five and folds the events into the [`CallRecordStore`].
//!
//! ```text
//!  engine hooks                     TraceIngestor task
//!  ─────────────                    ──────────────────
//!  request in   ──► mpsc ──┐
//!  response in  ──► mpsc ──┤
//!  request out  ──► mpsc ──┼──► select! ──► extract ──► CallRecordStore
//!  response out ──► mpsc ──┤
//!  media packet ──► mpsc ──┘
//! ```
//!
//! Senders never block the engine: a full channel drops the event and bumps
//! the `dropped` counter. A failure while processing one event is logged and
//! counted, and ingestion carries on with the next one.

use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rvoip_sip_core::{Message, Request, Response};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TraceError};
use crate::extract::{endpoint_address, extract_from_session_description, extract_from_text};
use crate::lifecycle::CallContext;
use crate::message::{SipMessageView, TraceDirection};
use crate::record::{CallDelta, ResponseSummary, UNKNOWN_CALL_ID};
use crate::store::CallRecordStore;

/// Default capacity of each of the five trace channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Message payload as delivered by the engine.
#[derive(Debug, Clone)]
pub enum TracePayload {
    Message(Message),
    /// Raw wire text, parsed during ingestion
    Raw(String),
}

impl TracePayload {
    fn view(&self) -> Result<SipMessageView> {
        match self {
            TracePayload::Message(message) => Ok(SipMessageView::from(message)),
            TracePayload::Raw(raw) => SipMessageView::parse(raw),
        }
    }
}

impl From<Message> for TracePayload {
    fn from(message: Message) -> Self {
        TracePayload::Message(message)
    }
}

impl From<Request> for TracePayload {
    fn from(request: Request) -> Self {
        TracePayload::Message(Message::Request(request))
    }
}

impl From<Response> for TracePayload {
    fn from(response: Response) -> Self {
        TracePayload::Message(Message::Response(response))
    }
}

impl From<String> for TracePayload {
    fn from(raw: String) -> Self {
        TracePayload::Raw(raw)
    }
}

impl From<&str> for TracePayload {
    fn from(raw: &str) -> Self {
        TracePayload::Raw(raw.to_string())
    }
}

/// One signaling message observed on the wire.
#[derive(Debug, Clone)]
pub struct SignalingTrace {
    pub direction: TraceDirection,
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
    pub payload: TracePayload,
    /// Call the event was emitted for, when the emitter knows it
    pub context: Option<Arc<CallContext>>,
}

/// Kind of media stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Audio,
    Video,
    Text,
    Other,
}

/// One media packet received from a remote endpoint.
///
/// Media packets carry no SIP call identifier, so the emitter supplies the
/// identifier of the call it is handling.
#[derive(Debug, Clone)]
pub struct MediaTrace {
    pub call_id: String,
    pub remote: Option<SocketAddr>,
    pub media_type: MediaType,
    pub packet_len: usize,
}

/// Any event the ingestor understands.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    Signaling(SignalingTrace),
    Media(MediaTrace),
}

/// Snapshot of the ingestion counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Signaling events folded into a record
    pub processed: u64,
    /// Media events that matched an active record
    pub media: u64,
    /// Events whose processing failed
    pub failed: u64,
    /// Events dropped because a channel was full
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct IngestCounters {
    processed: AtomicU64,
    media: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    // accepted by a channel vs. fully handled by the task
    enqueued: AtomicU64,
    handled: AtomicU64,
}

impl IngestCounters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            processed: self.processed.load(Ordering::Relaxed),
            media: self.media.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Builds the delta a signaling message contributes to its call record.
pub fn build_delta(message: &SipMessageView, remote: Option<&SocketAddr>) -> CallDelta {
    let mut delta = CallDelta {
        remote_ip: remote.map(endpoint_address),
        ..Default::default()
    };

    for contact in &message.contacts {
        delta.contact_ips.extend(extract_from_text(contact));
    }
    if !message.routes.is_empty() {
        delta.record_route_ips = extract_from_text(&message.routes.join(", "));
    }
    if !message.vias.is_empty() {
        delta.via_header_ips = extract_from_text(&message.vias.join(", "));
    }
    if let Some(body) = message.body.as_deref() {
        delta.sdp_media_ips = extract_from_session_description(body);
    }

    delta.server_header = message.server.clone().filter(|s| !s.is_empty());
    delta.user_agent = message.user_agent.clone().filter(|s| !s.is_empty());
    delta.response = message
        .status()
        .map(|(code, reason)| ResponseSummary::new(code, reason));

    delta
}

/// Folds trace events into the call record store.
#[derive(Debug)]
pub struct TraceIngestor {
    store: Arc<CallRecordStore>,
    counters: Arc<IngestCounters>,
}

impl TraceIngestor {
    pub fn new(store: Arc<CallRecordStore>) -> Self {
        Self {
            store,
            counters: Arc::new(IngestCounters::default()),
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }

    /// Processes one event. Never fails; problems are logged and counted.
    pub fn ingest(&self, event: &TraceEvent) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match event {
            TraceEvent::Signaling(trace) => self.process_signaling(trace).map(|_| ()),
            TraceEvent::Media(trace) => {
                self.process_media(trace);
                Ok(())
            }
        }))
        .unwrap_or_else(|payload| {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(TraceError::HandlerPanic(reason))
        });

        if let Err(e) = outcome {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            match event {
                TraceEvent::Signaling(trace) => {
                    warn!(direction = %trace.direction, error = %e, "Error processing SIP trace event")
                }
                TraceEvent::Media(trace) => {
                    warn!(call_id = %trace.call_id, error = %e, "Error processing media trace event")
                }
            }
        }
    }

    fn process_signaling(&self, trace: &SignalingTrace) -> Result<usize> {
        let message = trace.payload.view()?;

        let call_id = message.effective_call_id().unwrap_or(UNKNOWN_CALL_ID);
        let seed = trace
            .context
            .as_ref()
            .map(|ctx| ctx.seed())
            .unwrap_or_default();

        let delta = build_delta(&message, trace.remote.as_ref());

        let unique = {
            let mut record = self.store.get_or_create(call_id, &seed);
            record.apply(&delta);
            record.all_detected_ips.len()
        };

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        debug!(
            direction = %trace.direction,
            call_id = %call_id,
            unique_ips = unique,
            "{} - Call {}: Found {} unique IPs",
            trace.direction,
            call_id,
            unique
        );
        Ok(unique)
    }

    fn process_media(&self, trace: &MediaTrace) -> bool {
        let Some(remote) = trace.remote.as_ref() else {
            trace!(call_id = %trace.call_id, "Media packet without remote endpoint");
            return false;
        };

        let delta = CallDelta {
            rtp_ips: vec![endpoint_address(remote)],
            ..Default::default()
        };

        match self.store.merge(&trace.call_id, &delta) {
            Some(_) => {
                self.counters.media.fetch_add(1, Ordering::Relaxed);
                trace!(
                    call_id = %trace.call_id,
                    media_type = ?trace.media_type,
                    bytes = trace.packet_len,
                    "RTP IP discovered for call {}: {}",
                    trace.call_id,
                    remote.ip()
                );
                true
            }
            None => {
                debug!(call_id = %trace.call_id, "Media packet for unknown call discarded");
                false
            }
        }
    }

    /// Starts the ingestion task and returns the handle engines send through.
    pub fn spawn(self, capacity: usize) -> (TraceHandle, IngestTask) {
        let capacity = capacity.max(1);
        let (request_in_tx, mut request_in_rx) = mpsc::channel::<SignalingTrace>(capacity);
        let (response_in_tx, mut response_in_rx) = mpsc::channel::<SignalingTrace>(capacity);
        let (request_out_tx, mut request_out_rx) = mpsc::channel::<SignalingTrace>(capacity);
        let (response_out_tx, mut response_out_rx) = mpsc::channel::<SignalingTrace>(capacity);
        let (media_tx, mut media_rx) = mpsc::channel::<MediaTrace>(capacity);

        let counters = self.counters.clone();
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let ingestor = Arc::new(self);
        let worker = ingestor.clone();

        let join = tokio::spawn(async move {
            info!("Trace ingestion started");
            let handle_event = |event: TraceEvent| {
                worker.ingest(&event);
                worker.counters.handled.fetch_add(1, Ordering::Release);
            };

            // A closed channel disables its branch; once all five are closed
            // the loop ends through `else`.
            let mut open = [true; 5];
            loop {
                let next = tokio::select! {
                    t = request_in_rx.recv(), if open[0] => t.map(TraceEvent::Signaling).ok_or(0usize),
                    t = response_in_rx.recv(), if open[1] => t.map(TraceEvent::Signaling).ok_or(1usize),
                    t = request_out_rx.recv(), if open[2] => t.map(TraceEvent::Signaling).ok_or(2usize),
                    t = response_out_rx.recv(), if open[3] => t.map(TraceEvent::Signaling).ok_or(3usize),
                    m = media_rx.recv(), if open[4] => m.map(TraceEvent::Media).ok_or(4usize),
                    _ = stop.notified() => break,
                    else => break,
                };
                match next {
                    Ok(event) => handle_event(event),
                    Err(closed) => {
                        open[closed] = false;
                        if open.iter().all(|o| !o) {
                            break;
                        }
                    }
                }
            }

            // Drain whatever was queued before the stop request
            while let Ok(t) = request_in_rx.try_recv() {
                handle_event(TraceEvent::Signaling(t));
            }
            while let Ok(t) = response_in_rx.try_recv() {
                handle_event(TraceEvent::Signaling(t));
            }
            while let Ok(t) = request_out_rx.try_recv() {
                handle_event(TraceEvent::Signaling(t));
            }
            while let Ok(t) = response_out_rx.try_recv() {
                handle_event(TraceEvent::Signaling(t));
            }
            while let Ok(m) = media_rx.try_recv() {
                handle_event(TraceEvent::Media(m));
            }

            let stats = worker.stats();
            info!(
                processed = stats.processed,
                media = stats.media,
                failed = stats.failed,
                dropped = stats.dropped,
                "Trace ingestion stopped"
            );
        });

        let handle = TraceHandle {
            request_in: request_in_tx,
            response_in: response_in_tx,
            request_out: request_out_tx,
            response_out: response_out_tx,
            media: media_tx,
            counters,
        };

        (handle, IngestTask { join, shutdown, ingestor })
    }
}

/// Running ingestion task.
#[derive(Debug)]
pub struct IngestTask {
    join: JoinHandle<()>,
    shutdown: Arc<Notify>,
    ingestor: Arc<TraceIngestor>,
}

impl IngestTask {
    pub fn stats(&self) -> IngestStats {
        self.ingestor.stats()
    }

    /// Stops the task after draining queued events.
    pub async fn shutdown(self) -> IngestStats {
        self.shutdown.notify_one();
        self.join().await
    }

    /// Waits for the task to end once every [`TraceHandle`] is dropped.
    pub async fn join(self) -> IngestStats {
        if let Err(e) = self.join.await {
            error!(error = %e, "Trace ingestion task failed");
        }
        self.ingestor.stats()
    }
}

/// Sending side of the five trace channels; cheap to clone.
#[derive(Debug, Clone)]
pub struct TraceHandle {
    request_in: mpsc::Sender<SignalingTrace>,
    response_in: mpsc::Sender<SignalingTrace>,
    request_out: mpsc::Sender<SignalingTrace>,
    response_out: mpsc::Sender<SignalingTrace>,
    media: mpsc::Sender<MediaTrace>,
    counters: Arc<IngestCounters>,
}

impl TraceHandle {
    /// Binds the handle to one call so its events carry that call's context.
    pub fn for_call(&self, context: Arc<CallContext>) -> CallTraceHandle {
        CallTraceHandle {
            handle: self.clone(),
            context,
        }
    }

    pub fn on_request_in(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.signaling(TraceDirection::InboundRequest, local, remote, message.into(), None)
    }

    pub fn on_response_in(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.signaling(TraceDirection::InboundResponse, local, remote, message.into(), None)
    }

    pub fn on_request_out(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.signaling(TraceDirection::OutboundRequest, local, remote, message.into(), None)
    }

    pub fn on_response_out(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.signaling(TraceDirection::OutboundResponse, local, remote, message.into(), None)
    }

    /// Reports a received media packet for `call_id`.
    pub fn on_media_packet(&self, call_id: &str, remote: Option<SocketAddr>, media_type: MediaType, packet: &[u8]) -> bool {
        let trace = MediaTrace {
            call_id: call_id.to_string(),
            remote,
            media_type,
            packet_len: packet.len(),
        };
        match self.media.try_send(trace) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.record_send_failure("media", e.to_string(), matches!(e, mpsc::error::TrySendError::Full(_)));
                false
            }
        }
    }

    /// Routes a signaling event to the channel of its direction.
    pub fn signaling(
        &self,
        direction: TraceDirection,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
        payload: TracePayload,
        context: Option<Arc<CallContext>>,
    ) -> bool {
        let channel = match direction {
            TraceDirection::InboundRequest => &self.request_in,
            TraceDirection::InboundResponse => &self.response_in,
            TraceDirection::OutboundRequest => &self.request_out,
            TraceDirection::OutboundResponse => &self.response_out,
        };
        let trace = SignalingTrace {
            direction,
            local,
            remote,
            payload,
            context,
        };
        match channel.try_send(trace) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                let full = matches!(e, mpsc::error::TrySendError::Full(_));
                self.record_send_failure(&direction.to_string(), e.to_string(), full);
                false
            }
        }
    }

    fn record_send_failure(&self, channel: &str, reason: String, full: bool) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        if full {
            warn!(channel = channel, "Trace channel full, event dropped");
        } else {
            debug!(channel = channel, reason = %reason, "Trace channel closed, event dropped");
        }
    }

    /// Events accepted by a channel but not yet applied to the store.
    pub fn pending(&self) -> usize {
        let handled = self.counters.handled.load(Ordering::Acquire);
        let enqueued = self.counters.enqueued.load(Ordering::Relaxed);
        enqueued.saturating_sub(handled) as usize
    }

    /// Waits until every accepted event has been applied or `timeout` elapses.
    ///
    /// Returns true when nothing is left in flight.
    pub async fn settle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.pending() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Trace handle bound to one call's [`CallContext`].
#[derive(Debug, Clone)]
pub struct CallTraceHandle {
    handle: TraceHandle,
    context: Arc<CallContext>,
}

impl CallTraceHandle {
    pub fn context(&self) -> &CallContext {
        &self.context
    }

    pub fn on_request_in(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.emit(TraceDirection::InboundRequest, local, remote, message.into())
    }

    pub fn on_response_in(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.emit(TraceDirection::InboundResponse, local, remote, message.into())
    }

    pub fn on_request_out(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.emit(TraceDirection::OutboundRequest, local, remote, message.into())
    }

    pub fn on_response_out(&self, local: Option<SocketAddr>, remote: Option<SocketAddr>, message: impl Into<TracePayload>) -> bool {
        self.emit(TraceDirection::OutboundResponse, local, remote, message.into())
    }

    /// Reports a media packet against this call's tracking identifier.
    pub fn on_media_packet(&self, remote: Option<SocketAddr>, media_type: MediaType, packet: &[u8]) -> bool {
        self.handle
            .on_media_packet(&self.context.call_id, remote, media_type, packet)
    }

    fn emit(&self, direction: TraceDirection, local: Option<SocketAddr>, remote: Option<SocketAddr>, payload: TracePayload) -> bool {
        self.handle
            .signaling(direction, local, remote, payload, Some(self.context.clone()))
    }
}
