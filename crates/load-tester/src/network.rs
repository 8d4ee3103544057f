//! Network call placer
//!
//! Places each call over UDP with the rvoip SIP transport: an INVITE offering
//! PCMU and PCMA, the final response and its ACK, a hold period streaming
//! silence to the answered media address, then BYE. Every message sent or
//! received goes to the call's [`CallTraceHandle`], and so does every RTP
//! packet arriving on the call's media socket.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use rvoip_ip_trace::{CallContext, CallTraceHandle, MediaType};
use rvoip_sip_core::builder::SimpleResponseBuilder;
use rvoip_sip_core::types::headers::{HeaderAccess, HeaderName};
use rvoip_sip_core::{Message, Method, Request, Response, StatusCode};
use rvoip_sip_transport::{Transport, TransportEvent, UdpTransport};

use crate::config::AppConfig;
use crate::driver::{CallOutcome, CallPlacer};
use crate::error::Result;
use crate::simulated::silence_packet;
use crate::uac::{media_target, session_description, UacDialog};

const EVENT_CAPACITY: usize = 256;
const MAX_DATAGRAM: usize = 2048;
const T1: Duration = Duration::from_millis(500);
const T2: Duration = Duration::from_secs(4);
const PACKET_INTERVAL: Duration = Duration::from_millis(20);
const SAMPLES_PER_PACKET: u32 = 160;
const DEFAULT_USERNAME: &str = "loadtest";

#[derive(Debug, Clone)]
pub struct NetworkSettings {
    pub bind_addr: SocketAddr,
    /// Advertised instead of the local address when set
    pub public_ip: Option<IpAddr>,
    pub remote_port: u16,
    pub rtp_port: u16,
    pub transaction_timeout: Duration,
    pub hangup_delay: Duration,
    pub username: String,
    pub user_agent: String,
}

impl NetworkSettings {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let transport = &config.transport_settings;
        let username = config.sip_settings.username.trim();
        Ok(Self {
            bind_addr: transport.bind_addr()?,
            public_ip: transport.public_ip()?,
            remote_port: transport.remote_port,
            rtp_port: transport.rtp_port,
            transaction_timeout: transport.transaction_timeout(),
            hangup_delay: config.trace_settings.hangup_delay(),
            username: if username.is_empty() { DEFAULT_USERNAME } else { username }.to_string(),
            user_agent: format!("rvoip-load-tester/{}", env!("CARGO_PKG_VERSION")),
        })
    }
}

/// How a wait for a final response ended.
enum Awaited {
    Final(Response),
    TimedOut,
    Closed,
}

/// RTP socket for one call. The receive loop stops when this is dropped.
struct MediaSession {
    socket: Arc<UdpSocket>,
    receiver: JoinHandle<()>,
}

impl Drop for MediaSession {
    fn drop(&mut self) {
        self.receiver.abort();
    }
}

pub struct SipPlacer {
    settings: NetworkSettings,
    transport: UdpTransport,
    events: Mutex<mpsc::Receiver<TransportEvent>>,
    local: SocketAddr,
}

impl SipPlacer {
    pub async fn bind(settings: NetworkSettings) -> Result<Self> {
        let (transport, events) = UdpTransport::bind(settings.bind_addr, Some(EVENT_CAPACITY)).await?;
        let local = transport.local_addr()?;
        info!(local = %local, "SIP transport ready");
        Ok(Self {
            settings,
            transport,
            events: Mutex::new(events),
            local,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub async fn close(&self) -> Result<()> {
        self.transport.close().await?;
        Ok(())
    }

    /// Address the far end should reach us on for `destination`.
    async fn advertised_ip(&self, destination: SocketAddr) -> Result<IpAddr> {
        if let Some(ip) = self.settings.public_ip {
            return Ok(ip);
        }
        if !self.local.ip().is_unspecified() {
            return Ok(self.local.ip());
        }
        // Bound to a wildcard: ask the routing table which interface reaches the destination
        let unspecified = SocketAddr::new(self.local.ip(), 0);
        let route = UdpSocket::bind(unspecified).await?;
        route.connect(destination).await?;
        Ok(route.local_addr()?.ip())
    }

    async fn open_media(&self, trace: CallTraceHandle) -> Result<MediaSession> {
        let socket = Arc::new(UdpSocket::bind(SocketAddr::new(self.settings.bind_addr.ip(), self.settings.rtp_port)).await?);
        let reader = socket.clone();
        let receiver = tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match reader.recv_from(&mut buf).await {
                    Ok((len, source)) => {
                        trace.on_media_packet(Some(source), MediaType::Audio, &buf[..len]);
                    }
                    Err(e) => {
                        debug!(error = %e, "Media socket closed");
                        break;
                    }
                }
            }
        });
        Ok(MediaSession { socket, receiver })
    }

    async fn send(&self, message: Message, destination: SocketAddr, trace: &CallTraceHandle) -> Result<()> {
        self.transport.send_message(message.clone(), destination).await?;
        match message {
            Message::Request(request) => trace.on_request_out(Some(self.local), Some(destination), request),
            Message::Response(response) => trace.on_response_out(Some(self.local), Some(destination), response),
        };
        Ok(())
    }

    /// Answers a request from the far end. Returns true when it hangs up our call.
    async fn answer_request(&self, request: &Request, source: SocketAddr, dialog: &UacDialog, trace: &CallTraceHandle) -> Result<bool> {
        let method = request.method();
        if method == Method::Ack {
            return Ok(false);
        }
        let status = match method {
            Method::Bye | Method::Options => StatusCode::Ok,
            _ => StatusCode::from_u16(501)?,
        };
        let response = SimpleResponseBuilder::response_from_request(request, status, None).build();
        self.send(Message::Response(response), source, trace).await?;

        let ours = request.call_id().map(|id| id.to_string()).as_deref() == Some(dialog.call_id());
        Ok(method == Method::Bye && ours)
    }

    /// Waits for the final response to `request`, retransmitting it on the
    /// UDP timer schedule until anything comes back.
    async fn await_final(
        &self,
        events: &mut mpsc::Receiver<TransportEvent>,
        dialog: &UacDialog,
        request: &Request,
        destination: SocketAddr,
        trace: &CallTraceHandle,
    ) -> Result<Awaited> {
        let method = request.method();
        let deadline = Instant::now() + self.settings.transaction_timeout;
        let mut interval = T1;
        let mut next_retransmit = Some(Instant::now() + interval);

        loop {
            let wake = next_retransmit.map_or(deadline, |at| at.min(deadline));
            let event = match timeout_at(wake, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Ok(Awaited::Closed),
                Err(_) if Instant::now() >= deadline => return Ok(Awaited::TimedOut),
                Err(_) => {
                    debug!(method = %method, interval_ms = interval.as_millis(), "Retransmitting request");
                    self.transport.send_message(Message::Request(request.clone()), destination).await?;
                    interval = (interval * 2).min(T2);
                    next_retransmit = Some(Instant::now() + interval);
                    continue;
                }
            };

            match event {
                TransportEvent::MessageReceived { message, source, .. } => match message {
                    Message::Response(response) => {
                        trace.on_response_in(Some(self.local), Some(source), response.clone());
                        if !answers(&response, dialog, &method) {
                            continue;
                        }
                        next_retransmit = None;
                        if response.status().as_u16() >= 200 {
                            return Ok(Awaited::Final(response));
                        }
                    }
                    Message::Request(incoming) => {
                        trace.on_request_in(Some(self.local), Some(source), incoming.clone());
                        self.answer_request(&incoming, source, dialog, trace).await?;
                    }
                },
                TransportEvent::Error { error } => warn!(error = %error, "SIP transport error"),
                TransportEvent::Closed => return Ok(Awaited::Closed),
                _ => {}
            }
        }
    }

    /// Keeps the answered call up for the hangup delay. Returns true when the
    /// far end hung up first.
    async fn hold(
        &self,
        events: &mut mpsc::Receiver<TransportEvent>,
        dialog: &UacDialog,
        ack: &Request,
        media: &MediaSession,
        remote_media: Option<SocketAddr>,
        destination: SocketAddr,
        trace: &CallTraceHandle,
    ) -> Result<bool> {
        let hangup = tokio::time::sleep(self.settings.hangup_delay);
        tokio::pin!(hangup);
        let mut ticker = tokio::time::interval(PACKET_INTERVAL);
        let mut sequence: u16 = 0;
        let mut timestamp: u32 = 0;

        loop {
            tokio::select! {
                _ = &mut hangup => return Ok(false),
                _ = ticker.tick() => {
                    let Some(target) = remote_media else { continue };
                    if let Err(e) = media.socket.send_to(&silence_packet(sequence, timestamp), target).await {
                        debug!(error = %e, target = %target, "Failed to send RTP");
                    }
                    sequence = sequence.wrapping_add(1);
                    timestamp = timestamp.wrapping_add(SAMPLES_PER_PACKET);
                }
                event = events.recv() => match event {
                    Some(TransportEvent::MessageReceived { message, source, .. }) => match message {
                        Message::Response(response) => {
                            trace.on_response_in(Some(self.local), Some(source), response.clone());
                            // 2xx retransmitted because our ACK was lost
                            if answers(&response, dialog, &Method::Invite) && (200..300).contains(&response.status().as_u16()) {
                                self.transport.send_message(Message::Request(ack.clone()), destination).await?;
                            }
                        }
                        Message::Request(request) => {
                            trace.on_request_in(Some(self.local), Some(source), request.clone());
                            if self.answer_request(&request, source, dialog, trace).await? {
                                info!(call_id = %dialog.call_id(), "Far end hung up");
                                return Ok(true);
                            }
                        }
                    },
                    Some(TransportEvent::Error { error }) => warn!(error = %error, "SIP transport error"),
                    Some(TransportEvent::Closed) | None => return Ok(false),
                    Some(_) => {}
                },
            }
        }
    }
}

/// True when `response` belongs to our dialog's `method` transaction.
fn answers(response: &Response, dialog: &UacDialog, method: &Method) -> bool {
    let same_call = response.call_id().map(|id| id.to_string()).as_deref() == Some(dialog.call_id());
    let same_method = response
        .raw_header_value(&HeaderName::CSeq)
        .and_then(|cseq| cseq.split_whitespace().last().map(str::to_string))
        .is_some_and(|m| m.eq_ignore_ascii_case(&method.to_string()));
    same_call && same_method
}

#[async_trait]
impl CallPlacer for SipPlacer {
    async fn place_call(&self, context: &CallContext, target_uri: &str, trace: CallTraceHandle) -> Result<CallOutcome> {
        let Ok(remote_ip) = context.resolved_destination_ip.parse::<IpAddr>() else {
            return Ok(CallOutcome::Failed {
                reason: format!("{} did not resolve", context.destination_domain),
            });
        };
        let destination = SocketAddr::new(remote_ip, self.settings.remote_port);
        let advertised = self.advertised_ip(destination).await?;
        let media = self.open_media(trace.clone()).await?;
        let rtp_port = media.socket.local_addr()?.port();

        let mut dialog = UacDialog::new(
            context.call_id.clone(),
            target_uri,
            SocketAddr::new(advertised, self.local.port()),
            &self.settings.username,
            &self.settings.user_agent,
        );

        let mut events = self.events.lock().await;
        // Leftovers from earlier calls, already past their transactions
        while let Ok(stale) = events.try_recv() {
            debug!(event = ?stale, "Discarding stale transport event");
        }

        let invite = dialog.invite(&session_description(advertised, rtp_port))?;
        info!(call_id = %dialog.call_id(), destination = %destination, "Sending INVITE");
        self.send(Message::Request(invite.clone()), destination, &trace).await?;

        let response = match self.await_final(&mut events, &dialog, &invite, destination, &trace).await? {
            Awaited::Final(response) => response,
            Awaited::TimedOut => {
                return Ok(CallOutcome::Failed {
                    reason: "no final response to INVITE".to_string(),
                })
            }
            Awaited::Closed => {
                return Ok(CallOutcome::Failed {
                    reason: "SIP transport closed".to_string(),
                })
            }
        };

        dialog.on_response(&response);
        let status = response.status().as_u16();
        let ack = dialog.ack(status)?;
        self.send(Message::Request(ack.clone()), destination, &trace).await?;
        if status >= 300 {
            info!(call_id = %dialog.call_id(), status, "Call rejected");
            return Ok(CallOutcome::Rejected { status });
        }

        let remote_media = media_target(&String::from_utf8_lossy(response.body()));
        if self.hold(&mut events, &dialog, &ack, &media, remote_media, destination, &trace).await? {
            return Ok(CallOutcome::Answered);
        }

        let bye = dialog.bye()?;
        self.send(Message::Request(bye.clone()), destination, &trace).await?;
        match self.await_final(&mut events, &dialog, &bye, destination, &trace).await? {
            Awaited::Final(response) if response.status().as_u16() >= 300 => {
                warn!(call_id = %dialog.call_id(), status = response.status().as_u16(), "BYE was refused");
            }
            Awaited::Final(_) => debug!(call_id = %dialog.call_id(), "Call hung up"),
            Awaited::TimedOut | Awaited::Closed => warn!(call_id = %dialog.call_id(), "BYE was not answered"),
        }
        Ok(CallOutcome::Answered)
    }
}
