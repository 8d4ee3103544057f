//! Network address extraction
//!
//! Stateless helpers that pull address literals out of header renderings and
//! session descriptions. Validation is purely syntactic: a candidate is kept
//! when it parses as an `IpAddr`, nothing more.
//!
//! ```
//! use rvoip_ip_trace::extract::{extract_from_text, extract_from_session_description};
//!
//! let ips = extract_from_text("<sip:bob@203.0.113.2:5060>;expires=3600");
//! assert_eq!(ips, vec!["203.0.113.2".to_string()]);
//!
//! let sdp = "v=0\r\nc=IN IP4 198.51.100.7\r\nm=audio 4000 RTP/AVP 0\r\n";
//! assert_eq!(extract_from_session_description(sdp), vec!["198.51.100.7".to_string()]);
//! ```

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use indexmap::IndexSet;
use once_cell::sync::Lazy;
use regex::Regex;

// Dotted-quad shaped tokens; octet range is checked by the parser, not here
static IPV4_CANDIDATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9]{1,3}\.){3}[0-9]{1,3}\b").expect("valid IPv4 pattern"));

// IPv6 literals as they appear in SIP URIs and Via sent-by: [2001:db8::1]
static IPV6_BRACKETED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([0-9A-Fa-f:.]{2,45})\]").expect("valid IPv6 pattern"));

const CONNECTION_IP4: &str = "c=IN IP4 ";
const CONNECTION_IP6: &str = "c=IN IP6 ";

/// Returns true when `candidate` is a syntactically valid IPv4 or IPv6 literal.
pub fn is_valid_address(candidate: &str) -> bool {
    IpAddr::from_str(candidate).is_ok()
}

/// Renders the address part of a socket endpoint, unmapping `::ffff:a.b.c.d`.
pub fn endpoint_address(endpoint: &SocketAddr) -> String {
    endpoint.ip().to_canonical().to_string()
}

/// Extracts every valid address literal from `text`, in order of appearance.
///
/// Dotted-quad tokens are matched first and then parsed, so `999.999.1.1`
/// and `10.0.0` never come back. Bracketed IPv6 literals are recognised too.
/// Duplicates are kept; callers decide whether an evidence trail wants them.
pub fn extract_from_text(text: &str) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }

    let mut found: Vec<(usize, String)> = IPV4_CANDIDATE
        .find_iter(text)
        .filter(|m| is_valid_address(m.as_str()))
        .map(|m| (m.start(), m.as_str().to_string()))
        .collect();

    for caps in IPV6_BRACKETED.captures_iter(text) {
        if let Some(inner) = caps.get(1) {
            if let Ok(addr) = Ipv6Addr::from_str(inner.as_str()) {
                found.push((inner.start(), addr.to_string()));
            }
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    found.into_iter().map(|(_, ip)| ip).collect()
}

/// Extracts addresses from a session description body.
///
/// Connection lines (`c=IN IP4 <addr>` / `c=IN IP6 <addr>`) contribute their
/// third token directly; every line is also scanned with
/// [`extract_from_text`] so addresses in `o=`, `a=candidate` or `a=rtcp`
/// lines are caught as well. The two contributions are unioned, first
/// appearance wins.
pub fn extract_from_session_description(body: &str) -> Vec<String> {
    let mut ips: IndexSet<String> = IndexSet::new();
    if body.is_empty() {
        return Vec::new();
    }

    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with(CONNECTION_IP4) || line.starts_with(CONNECTION_IP6) {
            if let Some(token) = line.split_whitespace().nth(2) {
                // Multicast connection addresses carry a /ttl[/count] suffix
                let addr = token.split('/').next().unwrap_or(token);
                if let Ok(ip) = IpAddr::from_str(addr) {
                    ips.insert(ip.to_string());
                }
            }
        }

        ips.extend(extract_from_text(line));
    }

    ips.into_iter().collect()
}
