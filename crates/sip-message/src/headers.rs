//! # Typed header values
//!
//! The [`Headers`] block is the structured view of a message's header
//! section. Every header the dialog usage manager inspects or writes has a
//! typed field; anything else survives in [`Headers::other`] so that a
//! message can be forwarded or answered without loss.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MessageError, MessageResult};
use crate::method::Method;
use crate::name_addr::NameAddr;
use crate::param::Params;
use crate::parser;

/// RFC 3261 branch magic cookie
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// One Via entry: `SIP/2.0/UDP host:port;branch=...`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Via {
    pub transport: String,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Via {
    pub fn new(transport: impl Into<String>, host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            transport: transport.into(),
            host: host.into(),
            port,
            params: Params::new(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.params.get("branch")
    }

    pub fn set_branch(&mut self, branch: impl Into<String>) {
        self.params.set("branch", Some(branch.into()));
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.set_branch(branch);
        self
    }
}

impl fmt::Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0/{} {}", self.transport, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

impl FromStr for Via {
    type Err = MessageError;

    fn from_str(s: &str) -> MessageResult<Self> {
        parser::parse_complete(parser::via, s.trim()).ok_or_else(|| MessageError::parse("Via", s))
    }
}

/// CSeq: sequence number and method
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CSeq {
    pub seq: u32,
    pub method: Method,
}

impl CSeq {
    pub fn new(seq: u32, method: Method) -> Self {
        Self { seq, method }
    }
}

impl fmt::Display for CSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

/// A token with parameters.
///
/// Used for Event (`presence;id=7`), Subscription-State
/// (`active;expires=600`) and Content-Disposition (`session;handling=required`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub value: String,
    pub params: Params,
}

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            params: Params::new(),
        }
    }

    pub fn with_param(mut self, name: &str, value: impl Into<String>) -> Self {
        self.params.set(name, Some(value.into()));
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// Numeric parameter value, e.g. `expires` or `retry-after`
    pub fn param_u32(&self, name: &str) -> Option<u32> {
        self.params.get(name).and_then(|v| v.trim().parse().ok())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.params)
    }
}

impl FromStr for Token {
    type Err = MessageError;

    fn from_str(s: &str) -> MessageResult<Self> {
        parser::parse_complete(parser::token_with_params, s.trim())
            .ok_or_else(|| MessageError::parse("token", s))
    }
}

/// A media type such as `application/sdp`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MimeType {
    pub media_type: String,
    pub subtype: String,
    pub params: Params,
}

impl MimeType {
    pub fn new(media_type: impl Into<String>, subtype: impl Into<String>) -> Self {
        Self {
            media_type: media_type.into(),
            subtype: subtype.into(),
            params: Params::new(),
        }
    }

    /// Type and subtype match case-insensitively; parameters are ignored
    pub fn matches(&self, other: &MimeType) -> bool {
        self.media_type.eq_ignore_ascii_case(&other.media_type)
            && self.subtype.eq_ignore_ascii_case(&other.subtype)
    }

    /// Like [`MimeType::matches`] but honours `*` wildcards on either side
    pub fn accepts(&self, other: &MimeType) -> bool {
        let type_ok = self.media_type == "*"
            || other.media_type == "*"
            || self.media_type.eq_ignore_ascii_case(&other.media_type);
        let subtype_ok = self.subtype == "*"
            || other.subtype == "*"
            || self.subtype.eq_ignore_ascii_case(&other.subtype);
        type_ok && subtype_ok
    }
}

impl fmt::Display for MimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.media_type, self.subtype, self.params)
    }
}

impl FromStr for MimeType {
    type Err = MessageError;

    fn from_str(s: &str) -> MessageResult<Self> {
        parser::parse_complete(parser::mime_type, s.trim())
            .ok_or_else(|| MessageError::parse("media type", s))
    }
}

/// The structured header section of a SIP message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers {
    pub via: Vec<Via>,
    pub from: Option<NameAddr>,
    pub to: Option<NameAddr>,
    pub call_id: Option<String>,
    pub cseq: Option<CSeq>,
    pub max_forwards: Option<u32>,
    pub contact: Vec<NameAddr>,
    pub route: Vec<NameAddr>,
    pub record_route: Vec<NameAddr>,
    pub expires: Option<u32>,
    pub min_expires: Option<u32>,
    pub event: Option<Token>,
    pub subscription_state: Option<Token>,
    pub refer_to: Option<NameAddr>,
    pub require: Vec<String>,
    pub proxy_require: Vec<String>,
    pub supported: Vec<String>,
    pub unsupported: Vec<String>,
    pub allow: Vec<Method>,
    pub accept: Vec<MimeType>,
    pub accept_encoding: Vec<String>,
    pub accept_language: Vec<String>,
    pub content_type: Option<MimeType>,
    pub content_encoding: Vec<String>,
    pub content_language: Vec<String>,
    pub content_disposition: Option<Token>,
    pub retry_after: Option<u32>,
    pub sip_etag: Option<String>,
    pub sip_if_match: Option<String>,
    pub identity: Option<String>,
    pub identity_info: Option<String>,
    pub authorization: Vec<String>,
    pub proxy_authorization: Vec<String>,
    pub www_authenticate: Vec<String>,
    pub proxy_authenticate: Vec<String>,
    pub user_agent: Option<String>,
    /// Headers without a typed field, in arrival order
    pub other: Vec<(String, String)>,
}

impl Headers {
    pub fn from_tag(&self) -> Option<&str> {
        self.from.as_ref().and_then(NameAddr::tag)
    }

    pub fn to_tag(&self) -> Option<&str> {
        self.to.as_ref().and_then(NameAddr::tag)
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.via.first()
    }

    /// Branch of the topmost Via; the transaction identifier
    pub fn branch(&self) -> Option<&str> {
        self.via.first().and_then(Via::branch)
    }

    pub fn cseq_seq(&self) -> Option<u32> {
        self.cseq.as_ref().map(|c| c.seq)
    }

    pub fn cseq_method(&self) -> Option<&Method> {
        self.cseq.as_ref().map(|c| &c.method)
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event.as_ref().map(|e| e.value.as_str())
    }

    /// The `id` parameter of Event
    pub fn event_id(&self) -> Option<&str> {
        self.event.as_ref().and_then(|e| e.param("id"))
    }

    /// Extension header lookup, case-insensitive on the name
    pub fn extension(&self, name: &str) -> Option<&str> {
        self.other
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set_extension(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.other.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.other.push((name, value.into()));
    }

    /// Write the header section in wire order (used for tracing and sipfrag bodies)
    pub fn write_to(&self, f: &mut impl fmt::Write, body_len: usize) -> fmt::Result {
        for via in &self.via {
            write!(f, "Via: {}\r\n", via)?;
        }
        for route in &self.route {
            write!(f, "Route: {}\r\n", route)?;
        }
        for rr in &self.record_route {
            write!(f, "Record-Route: {}\r\n", rr)?;
        }
        if let Some(max) = self.max_forwards {
            write!(f, "Max-Forwards: {}\r\n", max)?;
        }
        if let Some(from) = &self.from {
            write!(f, "From: {}\r\n", from)?;
        }
        if let Some(to) = &self.to {
            write!(f, "To: {}\r\n", to)?;
        }
        if let Some(call_id) = &self.call_id {
            write!(f, "Call-ID: {}\r\n", call_id)?;
        }
        if let Some(cseq) = &self.cseq {
            write!(f, "CSeq: {}\r\n", cseq)?;
        }
        for contact in &self.contact {
            write!(f, "Contact: {}\r\n", contact)?;
        }
        write_optional(f, "Expires", &self.expires)?;
        write_optional(f, "Min-Expires", &self.min_expires)?;
        write_optional(f, "Event", &self.event)?;
        write_optional(f, "Subscription-State", &self.subscription_state)?;
        write_optional(f, "Refer-To", &self.refer_to)?;
        write_list(f, "Require", &self.require)?;
        write_list(f, "Proxy-Require", &self.proxy_require)?;
        write_list(f, "Supported", &self.supported)?;
        write_list(f, "Unsupported", &self.unsupported)?;
        write_list(f, "Allow", &self.allow)?;
        write_list(f, "Accept", &self.accept)?;
        write_list(f, "Accept-Encoding", &self.accept_encoding)?;
        write_list(f, "Accept-Language", &self.accept_language)?;
        write_optional(f, "Content-Disposition", &self.content_disposition)?;
        write_list(f, "Content-Encoding", &self.content_encoding)?;
        write_list(f, "Content-Language", &self.content_language)?;
        write_optional(f, "Retry-After", &self.retry_after)?;
        write_optional(f, "SIP-ETag", &self.sip_etag)?;
        write_optional(f, "SIP-If-Match", &self.sip_if_match)?;
        write_optional(f, "Identity", &self.identity)?;
        write_optional(f, "Identity-Info", &self.identity_info)?;
        for value in &self.authorization {
            write!(f, "Authorization: {}\r\n", value)?;
        }
        for value in &self.proxy_authorization {
            write!(f, "Proxy-Authorization: {}\r\n", value)?;
        }
        for value in &self.www_authenticate {
            write!(f, "WWW-Authenticate: {}\r\n", value)?;
        }
        for value in &self.proxy_authenticate {
            write!(f, "Proxy-Authenticate: {}\r\n", value)?;
        }
        write_optional(f, "User-Agent", &self.user_agent)?;
        for (name, value) in &self.other {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write_optional(f, "Content-Type", &self.content_type)?;
        write!(f, "Content-Length: {}\r\n", body_len)
    }
}

fn write_optional<T: fmt::Display>(
    f: &mut impl fmt::Write,
    name: &str,
    value: &Option<T>,
) -> fmt::Result {
    match value {
        Some(v) => write!(f, "{}: {}\r\n", name, v),
        None => Ok(()),
    }
}

fn write_list<T: fmt::Display>(f: &mut impl fmt::Write, name: &str, values: &[T]) -> fmt::Result {
    if values.is_empty() {
        return Ok(());
    }
    write!(f, "{}: ", name)?;
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{}", value)?;
    }
    f.write_str("\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_via_branch() {
        let via: Via = "SIP/2.0/UDP pc33.atlanta.example.com:5060;branch=z9hG4bK776asdhds"
            .parse()
            .unwrap();
        assert_eq!(via.transport, "UDP");
        assert_eq!(via.port, Some(5060));
        assert_eq!(via.branch(), Some("z9hG4bK776asdhds"));
    }

    #[test]
    fn test_subscription_state_token() {
        let state: Token = "active;expires=599".parse().unwrap();
        assert_eq!(state.value, "active");
        assert_eq!(state.param_u32("expires"), Some(599));
        assert_eq!(state.to_string(), "active;expires=599");
    }

    #[test]
    fn test_mime_wildcards() {
        let sdp: MimeType = "application/sdp".parse().unwrap();
        let any_app: MimeType = "application/*".parse().unwrap();
        let pidf: MimeType = "application/pidf+xml".parse().unwrap();
        assert!(any_app.accepts(&sdp));
        assert!(!sdp.matches(&pidf));
    }
}
