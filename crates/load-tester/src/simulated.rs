//! Scripted call placer
//!
//! Plays a fixed UAC call flow through a [`CallTraceHandle`]: INVITE,
//! 100 Trying, 180 Ringing, a final response and, when answered, ACK, a burst
//! of RTP, BYE and its 200 OK. Messages are built with the sip-core builders
//! but nothing touches the network, so a dry run exercises ingestion,
//! correlation and the CSV output without a live PBX.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use rvoip_ip_trace::{CallContext, CallTraceHandle, MediaType};
use rvoip_sip_core::builder::{RecordRouteBuilderExt, SimpleResponseBuilder};
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Method, Request, Response, StatusCode, Uri};

use crate::driver::{CallOutcome, CallPlacer};
use crate::error::Result;
use crate::uac::{new_tag, session_description, UacDialog};

const RTP_HEADER_LEN: usize = 12;
const PCMU_FRAME_LEN: usize = 160;

#[derive(Debug, Clone)]
pub struct ScriptSettings {
    /// Our signaling address, advertised in Via and Contact
    pub local_addr: SocketAddr,
    /// Next hop every request is sent to
    pub proxy_addr: SocketAddr,
    /// Callee contact returned in 180/200
    pub callee_addr: SocketAddr,
    /// Address announced in the answer SDP and used as the RTP source
    pub media_addr: SocketAddr,
    /// Final response to the INVITE
    pub answer_status: u16,
    pub hangup_delay: Duration,
    pub rtp_packets: usize,
    pub username: String,
    pub user_agent: String,
    pub server_header: String,
    /// Generate a separate SIP Call-ID instead of reusing the tracking id
    pub independent_call_id: bool,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            local_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 5060),
            proxy_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 1)), 5060),
            callee_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5)), 5060),
            media_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 40000),
            answer_status: 200,
            hangup_delay: Duration::from_secs(2),
            rtp_packets: 5,
            username: "loadtest".to_string(),
            user_agent: format!("rvoip-load-tester/{}", env!("CARGO_PKG_VERSION")),
            server_header: "rvoip-scripted-uas".to_string(),
            independent_call_id: false,
        }
    }
}

pub struct ScriptedPlacer {
    settings: ScriptSettings,
}

impl ScriptedPlacer {
    pub fn new(settings: ScriptSettings) -> Self {
        Self { settings }
    }

    fn dialog(&self, call_id: String, target_uri: &str) -> UacDialog {
        let s = &self.settings;
        UacDialog::new(call_id, target_uri, s.local_addr, &s.username, &s.user_agent)
    }

    /// The far end's answer to `request`, as it would arrive back through the proxy.
    fn response(&self, request: &Request, status: u16, to_tag: Option<&str>, body: Option<&str>) -> Result<Response> {
        let s = &self.settings;
        let status = StatusCode::from_u16(status)?;
        let mut builder = SimpleResponseBuilder::response_from_request(request, status, None)
            .header(TypedHeader::Server(vec![s.server_header.clone()]));

        if let Some(tag) = to_tag {
            let to_uri = request
                .to()
                .map(|to| to.address().uri().to_string())
                .unwrap_or_default();
            builder = builder.to("", &to_uri, Some(tag));
        }

        if (101..300).contains(&status.as_u16()) && request.method() == Method::Invite {
            let proxy = Uri::from_str(&format!("sip:{};lr", s.proxy_addr))?;
            builder = builder
                .record_route_uri(proxy)
                .contact(&format!("sip:callee@{}", s.callee_addr), None);
        }

        if let Some(body) = body {
            builder = builder.content_type("application/sdp").body(body.to_string());
        }
        Ok(builder.build())
    }

    fn offer_sdp(&self) -> String {
        session_description(self.settings.local_addr.ip(), 49170)
    }

    fn answer_sdp(&self) -> String {
        session_description(self.settings.media_addr.ip(), self.settings.media_addr.port())
    }
}

#[async_trait]
impl CallPlacer for ScriptedPlacer {
    async fn place_call(&self, context: &CallContext, target_uri: &str, trace: CallTraceHandle) -> Result<CallOutcome> {
        let s = &self.settings;
        let local = Some(s.local_addr);
        let proxy = Some(s.proxy_addr);

        let call_id = if s.independent_call_id {
            format!("{}@{}", Uuid::new_v4().simple(), s.local_addr.ip())
        } else {
            context.call_id.clone()
        };
        let mut dialog = self.dialog(call_id, target_uri);
        debug!(call_id = %dialog.call_id(), target = %target_uri, "Placing scripted call");

        let invite = dialog.invite(&self.offer_sdp())?;
        trace.on_request_out(local, proxy, invite.clone());
        trace.on_response_in(local, proxy, self.response(&invite, 100, None, None)?);

        let to_tag = new_tag();

        if s.answer_status >= 300 {
            let rejection = self.response(&invite, s.answer_status, Some(&to_tag), None)?;
            dialog.on_response(&rejection);
            trace.on_response_in(local, proxy, rejection);
            trace.on_request_out(local, proxy, dialog.ack(s.answer_status)?);
            return Ok(CallOutcome::Rejected { status: s.answer_status });
        }

        trace.on_response_in(local, proxy, self.response(&invite, 180, Some(&to_tag), None)?);
        let answer = self.response(&invite, s.answer_status, Some(&to_tag), Some(&self.answer_sdp()))?;
        dialog.on_response(&answer);
        trace.on_response_in(local, proxy, answer);
        trace.on_request_out(local, Some(s.callee_addr), dialog.ack(s.answer_status)?);

        let packet = silence_packet(0, 0);
        for _ in 0..s.rtp_packets {
            trace.on_media_packet(Some(s.media_addr), MediaType::Audio, &packet);
        }

        tokio::time::sleep(s.hangup_delay).await;

        let bye = dialog.bye()?;
        trace.on_request_out(local, Some(s.callee_addr), bye.clone());
        trace.on_response_in(local, Some(s.callee_addr), self.response(&bye, 200, None, None)?);

        Ok(CallOutcome::Answered)
    }
}

/// Version 2, PT 0 (PCMU), followed by one 20ms frame of mu-law silence.
pub(crate) fn silence_packet(sequence: u16, timestamp: u32) -> Vec<u8> {
    let mut packet = vec![0u8; RTP_HEADER_LEN + PCMU_FRAME_LEN];
    packet[0] = 0x80;
    packet[2..4].copy_from_slice(&sequence.to_be_bytes());
    packet[4..8].copy_from_slice(&timestamp.to_be_bytes());
    packet[RTP_HEADER_LEN..].fill(0xFF);
    packet
}
