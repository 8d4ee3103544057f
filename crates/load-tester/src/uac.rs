//! Outgoing call dialog
//!
//! Builds the requests a calling user agent sends (INVITE, ACK, BYE) with the
//! sip-core request builder and tracks the dialog state learned from the
//! responses: remote tag and remote target.

use std::net::{IpAddr, SocketAddr};

use rvoip_sip_core::builder::SimpleRequestBuilder;
use rvoip_sip_core::types::headers::{HeaderAccess, HeaderName};
use rvoip_sip_core::types::TypedHeader;
use rvoip_sip_core::{Method, Request, Response};
use uuid::Uuid;

use crate::error::Result;

const BRANCH_MAGIC: &str = "z9hG4bK";
const MAX_FORWARDS: u32 = 70;

/// Offered payload types: PCMU and PCMA, both 8 kHz.
pub const OFFERED_CODECS: [(u8, &str); 2] = [(0, "PCMU/8000"), (8, "PCMA/8000")];

#[derive(Debug, Clone)]
pub struct UacDialog {
    call_id: String,
    target_uri: String,
    /// Address advertised in Via and Contact
    local: SocketAddr,
    username: String,
    user_agent: String,
    from_tag: String,
    to_tag: Option<String>,
    remote_target: Option<String>,
    invite_branch: String,
    cseq: u32,
}

impl UacDialog {
    pub fn new(call_id: impl Into<String>, target_uri: impl Into<String>, local: SocketAddr, username: &str, user_agent: &str) -> Self {
        Self {
            call_id: call_id.into(),
            target_uri: target_uri.into(),
            local,
            username: username.to_string(),
            user_agent: user_agent.to_string(),
            from_tag: new_tag(),
            to_tag: None,
            remote_target: None,
            invite_branch: new_branch(),
            cseq: 1,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to_tag.as_deref()
    }

    pub fn target_uri(&self) -> &str {
        &self.target_uri
    }

    fn local_uri(&self) -> String {
        format!("sip:{}@{}", self.username, self.local)
    }

    /// In-dialog requests go to the callee's Contact once it is known.
    fn request_uri(&self, method: &Method) -> &str {
        match (method, &self.remote_target) {
            (Method::Invite, _) | (_, None) => &self.target_uri,
            (_, Some(target)) => target,
        }
    }

    fn builder(&self, method: Method, cseq: u32, branch: &str) -> Result<SimpleRequestBuilder> {
        let uri = self.request_uri(&method).to_string();
        Ok(SimpleRequestBuilder::new(method, &uri)?
            .from("", &self.local_uri(), Some(&self.from_tag))
            .to("", &self.target_uri, self.to_tag.as_deref())
            .call_id(&self.call_id)
            .cseq(cseq)
            .via(&self.local.to_string(), "UDP", Some(branch))
            .max_forwards(MAX_FORWARDS)
            .header(TypedHeader::UserAgent(vec![self.user_agent.clone()])))
    }

    pub fn invite(&self, sdp: &str) -> Result<Request> {
        Ok(self
            .builder(Method::Invite, self.cseq, &self.invite_branch)?
            .contact(&self.local_uri(), None)
            .content_type("application/sdp")
            .body(sdp.to_string())
            .build())
    }

    /// ACK for the final INVITE response. A non-2xx ACK reuses the INVITE
    /// branch; a 2xx ACK is a new transaction.
    pub fn ack(&self, status: u16) -> Result<Request> {
        let branch = if (200..300).contains(&status) {
            new_branch()
        } else {
            self.invite_branch.clone()
        };
        Ok(self.builder(Method::Ack, self.cseq, &branch)?.build())
    }

    pub fn bye(&mut self) -> Result<Request> {
        self.cseq += 1;
        Ok(self.builder(Method::Bye, self.cseq, &new_branch())?.build())
    }

    /// Learns the remote tag and target from a response to our INVITE.
    pub fn on_response(&mut self, response: &Response) {
        if self.to_tag.is_none() {
            self.to_tag = response.to().and_then(|to| to.tag()).map(str::to_string);
        }
        if (200..300).contains(&response.status().as_u16()) {
            if let Some(target) = response
                .raw_header_value(&HeaderName::Contact)
                .and_then(|contact| contact_uri(&contact))
            {
                self.remote_target = Some(target);
            }
        }
    }
}

/// `<sip:bob@host:5060>;expires=60` -> `sip:bob@host:5060`
fn contact_uri(value: &str) -> Option<String> {
    let value = value.trim();
    let uri = match (value.find('<'), value.find('>')) {
        (Some(open), Some(close)) if open < close => &value[open + 1..close],
        _ => value.split(';').next().unwrap_or_default(),
    };
    let uri = uri.trim();
    (!uri.is_empty()).then(|| uri.to_string())
}

pub fn new_branch() -> String {
    format!("{}{}", BRANCH_MAGIC, Uuid::new_v4().simple())
}

pub fn new_tag() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_string()
}

/// Session description announcing one audio stream at `ip:port`.
pub fn session_description(ip: IpAddr, port: u16) -> String {
    let family = if ip.is_ipv6() { "IP6" } else { "IP4" };
    let payloads: Vec<String> = OFFERED_CODECS.iter().map(|(pt, _)| pt.to_string()).collect();

    let mut sdp = format!(
        "v=0\r\n\
         o=- 0 0 IN {family} {ip}\r\n\
         s=-\r\n\
         c=IN {family} {ip}\r\n\
         t=0 0\r\n\
         m=audio {port} RTP/AVP {payloads}\r\n",
        payloads = payloads.join(" "),
    );
    for (pt, encoding) in OFFERED_CODECS {
        sdp.push_str(&format!("a=rtpmap:{} {}\r\n", pt, encoding));
    }
    sdp
}

/// Media address announced by a session description: the connection address
/// plus the first audio port.
pub fn media_target(sdp: &str) -> Option<SocketAddr> {
    let mut ip: Option<IpAddr> = None;
    let mut port: Option<u16> = None;
    for line in sdp.lines().map(str::trim) {
        if let Some(rest) = line.strip_prefix("c=IN ") {
            ip = rest.split_whitespace().nth(1).and_then(|addr| addr.parse().ok()).or(ip);
        } else if let Some(rest) = line.strip_prefix("m=audio ") {
            port = port.or_else(|| rest.split_whitespace().next().and_then(|p| p.parse().ok()));
        }
    }
    match (ip, port) {
        (Some(ip), Some(port)) if port > 0 => Some(SocketAddr::new(ip, port)),
        _ => None,
    }
}
