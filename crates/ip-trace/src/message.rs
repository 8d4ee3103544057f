//! Trace message model
//!
//! The protocol engine that places calls hands over each message crossing the
//! wire as an `rvoip_sip_core::Message`. Ingestion only needs a handful of
//! fields from it, so every message is projected onto a [`SipMessageView`]:
//! the call identifier, the address-bearing header collections, the
//! Server/User-Agent values, the body and, for responses, the status line.
//!
//! Engines that only expose raw wire text go through [`parse_wire`], which
//! uses the sip-core parser and repairs traces it would otherwise reject.

use std::fmt;

use rvoip_sip_core::types::headers::{HeaderAccess, HeaderName};
use rvoip_sip_core::{Message, Request, Response};
use tracing::trace;

use crate::error::{Result, TraceError};

/// Which of the engine's four trace hooks produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceDirection {
    InboundRequest,
    InboundResponse,
    OutboundRequest,
    OutboundResponse,
}

impl fmt::Display for TraceDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TraceDirection::InboundRequest => "Incoming Request",
            TraceDirection::InboundResponse => "Incoming Response",
            TraceDirection::OutboundRequest => "Outgoing Request",
            TraceDirection::OutboundResponse => "Outgoing Response",
        };
        f.write_str(label)
    }
}

/// Start line of a traced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Request { method: String, uri: String },
    Response { status_code: u16, reason: String },
}

/// Address-relevant projection of one SIP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipMessageView {
    pub kind: MessageKind,
    pub call_id: Option<String>,
    /// Contact header values, one entry per header field
    pub contacts: Vec<String>,
    /// Route and Record-Route header values
    pub routes: Vec<String>,
    /// Via header values, topmost first
    pub vias: Vec<String>,
    pub server: Option<String>,
    pub user_agent: Option<String>,
    pub body: Option<String>,
}

impl SipMessageView {
    pub fn status(&self) -> Option<(u16, &str)> {
        match &self.kind {
            MessageKind::Response { status_code, reason } => Some((*status_code, reason.as_str())),
            MessageKind::Request { .. } => None,
        }
    }

    /// Call identifier with surrounding whitespace removed, if non-empty.
    pub fn effective_call_id(&self) -> Option<&str> {
        self.call_id.as_deref().map(str::trim).filter(|id| !id.is_empty())
    }

    /// Parses raw wire text and projects it.
    pub fn parse(raw: &str) -> Result<Self> {
        parse_wire(raw).map(|message| Self::from(&message))
    }

    fn project<H: HeaderAccess>(kind: MessageKind, call_id: Option<String>, headers: &H, body: &[u8]) -> Self {
        let values = |name: &HeaderName| -> Vec<String> {
            headers
                .raw_headers(name)
                .into_iter()
                .map(|v| String::from_utf8_lossy(&v).trim().to_string())
                .collect()
        };

        let mut routes = values(&HeaderName::RecordRoute);
        routes.extend(values(&HeaderName::Route));

        let body = String::from_utf8_lossy(body);
        Self {
            kind,
            call_id,
            contacts: values(&HeaderName::Contact),
            routes,
            vias: values(&HeaderName::Via),
            server: headers.raw_header_value(&HeaderName::Server),
            user_agent: headers.raw_header_value(&HeaderName::UserAgent),
            body: (!body.trim().is_empty()).then(|| body.into_owned()),
        }
    }
}

impl From<&Request> for SipMessageView {
    fn from(request: &Request) -> Self {
        let kind = MessageKind::Request {
            method: request.method().to_string(),
            uri: request.uri().to_string(),
        };
        let call_id = request.call_id().map(|id| id.to_string());
        Self::project(kind, call_id, request, request.body())
    }
}

impl From<&Response> for SipMessageView {
    fn from(response: &Response) -> Self {
        let kind = MessageKind::Response {
            status_code: response.status().as_u16(),
            reason: response.reason_phrase().to_string(),
        };
        let call_id = response.call_id().map(|id| id.to_string());
        Self::project(kind, call_id, response, response.body())
    }
}

impl From<&Message> for SipMessageView {
    fn from(message: &Message) -> Self {
        match message {
            Message::Request(request) => Self::from(request),
            Message::Response(response) => Self::from(response),
        }
    }
}

/// Parses raw SIP wire text with the sip-core parser.
///
/// Captured traces are often slightly off: bare LF line endings, vendor
/// lines without a colon, a missing or stale Content-Length. When the strict
/// parse fails the text is rebuilt from its well-formed header lines and
/// parsed once more.
pub fn parse_wire(raw: &str) -> Result<Message> {
    let strict = match rvoip_sip_core::parse_message(raw.as_bytes()) {
        Ok(message) => return Ok(message),
        Err(e) => e,
    };

    let repaired = repair(raw).ok_or_else(|| TraceError::Parse(strict.to_string()))?;
    rvoip_sip_core::parse_message(repaired.as_bytes()).map_err(|e| TraceError::Parse(e.to_string()))
}

fn repair(raw: &str) -> Option<String> {
    let (head, body) = match raw.find("\r\n\r\n") {
        Some(idx) => (&raw[..idx], &raw[idx + 4..]),
        None => match raw.find("\n\n") {
            Some(idx) => (&raw[..idx], &raw[idx + 2..]),
            None => (raw, ""),
        },
    };

    let mut lines = head.lines();
    let start = lines.next()?.trim();
    if start.is_empty() {
        return None;
    }

    let mut headers: Vec<String> = Vec::new();
    for line in lines {
        // folded continuation of the previous header
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.push(' ');
                last.push_str(line.trim());
            }
            continue;
        }

        let line = line.trim_end();
        match line.split_once(':') {
            Some((name, _)) if is_token(name.trim()) => {
                let name = name.trim();
                if !name.eq_ignore_ascii_case("content-length") && !name.eq_ignore_ascii_case("l") {
                    headers.push(line.to_string());
                }
            }
            _ if line.is_empty() => {}
            _ => trace!(line = %line, "Skipping malformed SIP header line"),
        }
    }

    let mut text = String::with_capacity(raw.len() + 32);
    text.push_str(start);
    text.push_str("\r\n");
    for header in &headers {
        text.push_str(header);
        text.push_str("\r\n");
    }
    text.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
    text.push_str(body);
    Some(text)
}

fn is_token(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric() || b"-.!%*_+`'~".contains(&b))
}
