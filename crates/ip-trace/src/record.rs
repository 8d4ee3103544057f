//! Per-call evidence records
//!
//! A [`CallRecord`] accumulates everything observed for one call identifier.
//! Category lists are append-only evidence trails (duplicates allowed); the
//! `all_detected_ips` set is the deduplicated union and only ever grows.
//! Updates arrive as [`CallDelta`] values so that concurrent merges for the
//! same call are plain set unions rather than last-write-wins overwrites.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;

/// Bucket used when a trace message carries no usable call identifier.
pub const UNKNOWN_CALL_ID: &str = "unknown";

/// Destination domain written for calls finished without any record.
pub const UNKNOWN_DOMAIN: &str = "Unknown";

/// Sentinel for an address that could not be resolved.
pub const NOT_AVAILABLE: &str = "N/A";

/// Status class of the most recent response seen for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    /// Any status below 300, provisional responses included
    Success,
    /// 3xx
    Redirection,
    /// 4xx
    ClientError,
    /// 5xx and above
    ServerError,
}

impl CallStatus {
    /// Classifies a SIP status code.
    pub fn from_status_code(code: u16) -> Self {
        match code {
            0..=299 => CallStatus::Success,
            300..=399 => CallStatus::Redirection,
            400..=499 => CallStatus::ClientError,
            _ => CallStatus::ServerError,
        }
    }

    /// Column value used in the CSV output.
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "Success",
            CallStatus::Redirection => "Redirection",
            CallStatus::ClientError => "Client Error",
            CallStatus::ServerError => "Server Error",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Destination defaults applied when a record is first created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordSeed {
    pub destination_domain: String,
    pub resolved_destination_ip: String,
}

impl RecordSeed {
    pub fn new(destination_domain: impl Into<String>, resolved_destination_ip: impl Into<String>) -> Self {
        Self {
            destination_domain: destination_domain.into(),
            resolved_destination_ip: resolved_destination_ip.into(),
        }
    }
}

/// Status line summary taken from a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseSummary {
    pub status: CallStatus,
    /// `"<code> <reason>"`, e.g. `"200 OK"`
    pub response_code: String,
}

impl ResponseSummary {
    pub fn new(status_code: u16, reason: &str) -> Self {
        let reason = reason.trim();
        let response_code = if reason.is_empty() {
            status_code.to_string()
        } else {
            format!("{} {}", status_code, reason)
        };
        Self {
            status: CallStatus::from_status_code(status_code),
            response_code,
        }
    }
}

/// Everything one trace event contributes to a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallDelta {
    /// Address of the event's remote endpoint
    pub remote_ip: Option<String>,
    pub contact_ips: Vec<String>,
    pub record_route_ips: Vec<String>,
    pub via_header_ips: Vec<String>,
    pub sdp_media_ips: Vec<String>,
    pub rtp_ips: Vec<String>,
    pub server_header: Option<String>,
    pub user_agent: Option<String>,
    pub response: Option<ResponseSummary>,
}

impl CallDelta {
    /// All addresses this delta adds to `all_detected_ips`, remote endpoint first.
    pub fn addresses(&self) -> impl Iterator<Item = &String> {
        self.remote_ip
            .iter()
            .chain(self.contact_ips.iter())
            .chain(self.record_route_ips.iter())
            .chain(self.via_header_ips.iter())
            .chain(self.sdp_media_ips.iter())
            .chain(self.rtp_ips.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.addresses().next().is_none()
            && self.server_header.is_none()
            && self.user_agent.is_none()
            && self.response.is_none()
    }
}

/// Accumulated evidence for one call identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub call_id: String,
    pub call_time: DateTime<Utc>,
    pub destination_domain: String,
    pub resolved_destination_ip: String,
    pub contact_ips: Vec<String>,
    pub record_route_ips: Vec<String>,
    pub via_header_ips: Vec<String>,
    pub sdp_media_ips: Vec<String>,
    pub rtp_ips: Vec<String>,
    pub all_detected_ips: IndexSet<String>,
    pub server_header: String,
    pub user_agent: String,
    pub call_status: Option<CallStatus>,
    pub response_code: String,
}

impl CallRecord {
    /// Creates an empty record stamped with the current time.
    pub fn new(call_id: impl Into<String>, seed: &RecordSeed) -> Self {
        Self {
            call_id: call_id.into(),
            call_time: Utc::now(),
            destination_domain: seed.destination_domain.clone(),
            resolved_destination_ip: seed.resolved_destination_ip.clone(),
            contact_ips: Vec::new(),
            record_route_ips: Vec::new(),
            via_header_ips: Vec::new(),
            sdp_media_ips: Vec::new(),
            rtp_ips: Vec::new(),
            all_detected_ips: IndexSet::new(),
            server_header: String::new(),
            user_agent: String::new(),
            call_status: None,
            response_code: String::new(),
        }
    }

    /// Stand-in row for a call that finished without any observed traffic.
    pub fn placeholder(call_id: impl Into<String>) -> Self {
        Self::new(call_id, &RecordSeed::new(UNKNOWN_DOMAIN, NOT_AVAILABLE))
    }

    /// Merges a delta into this record.
    ///
    /// Lists are appended, the detected set is unioned, and scalar fields are
    /// only overwritten by non-empty values.
    pub fn apply(&mut self, delta: &CallDelta) {
        self.contact_ips.extend(delta.contact_ips.iter().cloned());
        self.record_route_ips.extend(delta.record_route_ips.iter().cloned());
        self.via_header_ips.extend(delta.via_header_ips.iter().cloned());
        self.sdp_media_ips.extend(delta.sdp_media_ips.iter().cloned());
        for ip in &delta.rtp_ips {
            if !self.rtp_ips.contains(ip) {
                self.rtp_ips.push(ip.clone());
            }
        }

        for ip in delta.addresses() {
            if !self.all_detected_ips.contains(ip) {
                self.all_detected_ips.insert(ip.clone());
            }
        }

        if let Some(server) = delta.server_header.as_deref().filter(|s| !s.is_empty()) {
            self.server_header = server.to_string();
        }
        if let Some(agent) = delta.user_agent.as_deref().filter(|s| !s.is_empty()) {
            self.user_agent = agent.to_string();
        }
        if let Some(response) = &delta.response {
            self.call_status = Some(response.status);
            self.response_code = response.response_code.clone();
        }
    }

    /// Fills destination defaults that are still blank.
    pub fn seed_missing(&mut self, seed: &RecordSeed) {
        if self.destination_domain.is_empty() {
            self.destination_domain = seed.destination_domain.clone();
        }
        if self.resolved_destination_ip.is_empty() {
            self.resolved_destination_ip = seed.resolved_destination_ip.clone();
        }
    }

    /// Whether any address has been attributed to this call.
    pub fn has_evidence(&self) -> bool {
        !self.all_detected_ips.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn delta_with(remote: &str, contact: &[&str]) -> CallDelta {
        CallDelta {
            remote_ip: Some(remote.to_string()),
            contact_ips: contact.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(CallStatus::from_status_code(100), CallStatus::Success);
        assert_eq!(CallStatus::from_status_code(200), CallStatus::Success);
        assert_eq!(CallStatus::from_status_code(302), CallStatus::Redirection);
        assert_eq!(CallStatus::from_status_code(486), CallStatus::ClientError);
        assert_eq!(CallStatus::from_status_code(503), CallStatus::ServerError);
        assert_eq!(CallStatus::from_status_code(699), CallStatus::ServerError);
        assert_eq!(CallStatus::ClientError.to_string(), "Client Error");
    }

    #[test]
    fn test_response_summary() {
        let summary = ResponseSummary::new(486, "Busy Here");
        assert_eq!(summary.response_code, "486 Busy Here");
        assert_eq!(summary.status, CallStatus::ClientError);
        assert_eq!(ResponseSummary::new(200, "").response_code, "200");
    }

    #[test]
    fn test_apply_appends_and_unions() {
        let mut record = CallRecord::new("abc", &RecordSeed::new("sip.example.com", "203.0.113.1"));
        record.apply(&delta_with("203.0.113.3", &["203.0.113.2"]));
        record.apply(&delta_with("203.0.113.3", &["203.0.113.2"]));

        assert_eq!(record.contact_ips, vec!["203.0.113.2", "203.0.113.2"]);
        assert_eq!(
            record.all_detected_ips.iter().cloned().collect::<Vec<_>>(),
            vec!["203.0.113.3", "203.0.113.2"]
        );
        assert_eq!(record.resolved_destination_ip, "203.0.113.1");
    }

    #[test]
    fn test_scalars_only_overwritten_when_present() {
        let mut record = CallRecord::new("abc", &RecordSeed::default());
        record.apply(&CallDelta {
            server_header: Some("Kamailio".to_string()),
            user_agent: Some("softphone/1.0".to_string()),
            response: Some(ResponseSummary::new(180, "Ringing")),
            ..Default::default()
        });
        record.apply(&CallDelta {
            server_header: Some(String::new()),
            response: Some(ResponseSummary::new(200, "OK")),
            ..Default::default()
        });

        assert_eq!(record.server_header, "Kamailio");
        assert_eq!(record.user_agent, "softphone/1.0");
        assert_eq!(record.response_code, "200 OK");
        assert_eq!(record.call_status, Some(CallStatus::Success));
    }

    #[test]
    fn test_rtp_addresses_recorded_once() {
        let mut record = CallRecord::new("abc", &RecordSeed::default());
        let rtp = CallDelta { rtp_ips: vec!["198.51.100.4".to_string()], ..Default::default() };
        record.apply(&rtp);
        record.apply(&rtp);
        assert_eq!(record.rtp_ips, vec!["198.51.100.4"]);
        assert!(record.has_evidence());
    }

    #[test]
    fn test_placeholder_uses_sentinels() {
        let record = CallRecord::placeholder("zzz");
        assert_eq!(record.destination_domain, UNKNOWN_DOMAIN);
        assert_eq!(record.resolved_destination_ip, NOT_AVAILABLE);
        assert!(!record.has_evidence());
    }

    fn arb_delta() -> impl Strategy<Value = CallDelta> {
        let ip = (0u8..4, 0u8..4).prop_map(|(a, b)| format!("192.0.2.{}", a * 4 + b));
        (
            proptest::option::of(ip.clone()),
            proptest::collection::vec(ip.clone(), 0..4),
            proptest::collection::vec(ip.clone(), 0..4),
            proptest::collection::vec(ip, 0..4),
        )
            .prop_map(|(remote_ip, contact_ips, via_header_ips, sdp_media_ips)| CallDelta {
                remote_ip,
                contact_ips,
                via_header_ips,
                sdp_media_ips,
                ..Default::default()
            })
    }

    proptest! {
        #[test]
        fn prop_merge_is_commutative_and_idempotent(a in arb_delta(), b in arb_delta()) {
            let seed = RecordSeed::default();
            let mut ab = CallRecord::new("x", &seed);
            ab.apply(&a);
            ab.apply(&b);

            let mut ba = CallRecord::new("x", &seed);
            ba.apply(&b);
            ba.apply(&a);
            ba.apply(&a);

            // IndexSet equality ignores insertion order
            prop_assert_eq!(&ab.all_detected_ips, &ba.all_detected_ips);

            let expected: IndexSet<String> = a.addresses().chain(b.addresses()).cloned().collect();
            prop_assert_eq!(ab.all_detected_ips, expected);
        }
    }
}
