//! # SIP Requests and Responses
//!
//! [`Request`] and [`Response`] share the [`Headers`] block and carry a raw
//! body plus transport [`Metadata`]. The [`Message`] envelope is what the
//! transport layer hands to the dialog usage manager.
//!
//! [`Response::from_request`] implements the header copying rules of
//! RFC 3261 §8.2.6.2: Via, From, To, Call-ID and CSeq are taken verbatim from
//! the request, so the caller only has to add a To tag and whatever else the
//! response needs.

use std::fmt;
use std::net::SocketAddr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::headers::Headers;
use crate::method::Method;
use crate::status::StatusCode;
use crate::uri::Uri;

/// Trust level established for the sender of a request (RFC 4474)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityStrength {
    /// Only the From header vouches for the sender
    From,
    /// An Identity signature was verified
    Identity,
    /// An Identity header was present but did not verify
    FailedIdentity,
}

/// Security information attached to an inbound message before dispatch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityAttributes {
    /// Address-of-record the strength applies to
    pub identity: String,
    pub strength: IdentityStrength,
    /// Body arrived encrypted
    pub encrypted: bool,
    /// Body was encrypted and could not be decrypted
    pub decryption_failed: bool,
}

/// Transport-level facts about a message
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Where the message came from
    pub source: Option<SocketAddr>,
    /// Subject name of the TLS peer certificate, when received over TLS
    pub tls_peer: Option<String>,
    pub security: Option<SecurityAttributes>,
}

/// A SIP request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: Method,
    pub uri: Uri,
    pub headers: Headers,
    pub body: Bytes,
    #[serde(skip)]
    pub metadata: Metadata,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Headers::default(),
            body: Bytes::new(),
            metadata: Metadata::default(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id.as_deref()
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0\r\n", self.method, self.uri)?;
        self.headers.write_to(f, self.body.len())?;
        f.write_str("\r\n")?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }
}

/// A SIP response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: StatusCode,
    pub reason: String,
    pub headers: Headers,
    pub body: Bytes,
    #[serde(skip)]
    pub metadata: Metadata,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            reason: status.reason_phrase().to_string(),
            headers: Headers::default(),
            body: Bytes::new(),
            metadata: Metadata::default(),
        }
    }

    /// Build a response to `request` (RFC 3261 §8.2.6.2)
    pub fn from_request(request: &Request, status: StatusCode) -> Self {
        let mut response = Response::new(status);
        response.headers.via = request.headers.via.clone();
        response.headers.from = request.headers.from.clone();
        response.headers.to = request.headers.to.clone();
        response.headers.call_id = request.headers.call_id.clone();
        response.headers.cseq = request.headers.cseq.clone();
        // answered over the flow the request came in on
        response.metadata.source = request.metadata.source;
        response.metadata.tls_peer = request.metadata.tls_peer.clone();
        response
    }

    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers.call_id.as_deref()
    }

    /// Method of the request this response answers
    pub fn method(&self) -> Option<&Method> {
        self.headers.cseq_method()
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {} {}\r\n", self.status.as_u16(), self.reason)?;
        self.headers.write_to(f, self.body.len())?;
        f.write_str("\r\n")?;
        f.write_str(&String::from_utf8_lossy(&self.body))
    }
}

/// A parsed SIP message as delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Message {
    pub fn headers(&self) -> &Headers {
        match self {
            Message::Request(r) => &r.headers,
            Message::Response(r) => &r.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            Message::Request(r) => &mut r.headers,
            Message::Response(r) => &mut r.headers,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request(_))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.headers().call_id.as_deref()
    }

    /// Method of the request or of the request answered by the response
    pub fn method(&self) -> Option<&Method> {
        match self {
            Message::Request(r) => Some(&r.method),
            Message::Response(r) => r.method(),
        }
    }

    pub fn as_request(&self) -> Option<&Request> {
        match self {
            Message::Request(r) => Some(r),
            Message::Response(_) => None,
        }
    }

    pub fn as_response(&self) -> Option<&Response> {
        match self {
            Message::Response(r) => Some(r),
            Message::Request(_) => None,
        }
    }

    /// Short description for logs: `INVITE` or `180 (INVITE)`
    pub fn brief(&self) -> String {
        match self {
            Message::Request(r) => format!("{} {}", r.method, r.uri),
            Message::Response(r) => match r.method() {
                Some(m) => format!("{} ({})", r.status.as_u16(), m),
                None => r.status.as_u16().to_string(),
            },
        }
    }
}

impl From<Request> for Message {
    fn from(request: Request) -> Self {
        Message::Request(request)
    }
}

impl From<Response> for Message {
    fn from(response: Response) -> Self {
        Message::Response(response)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Request(r) => r.fmt(f),
            Message::Response(r) => r.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::{CSeq, Via};

    fn options() -> Request {
        let uri = "sip:carol@chicago.example.com".parse().unwrap();
        let mut req = Request::new(Method::Options, uri);
        let via =
            Via::new("UDP", "pc33.atlanta.example.com", None).with_branch("z9hG4bKhjhs8ass877");
        req.headers.via.push(via);
        req.headers.from = Some("<sip:alice@atlanta.example.com>;tag=1928301774".parse().unwrap());
        req.headers.to = Some("<sip:carol@chicago.example.com>".parse().unwrap());
        req.headers.call_id = Some("a84b4c76e66710".into());
        req.headers.cseq = Some(CSeq::new(63104, Method::Options));
        req
    }

    #[test]
    fn test_response_copies_transaction_headers() {
        let req = options();
        let resp = Response::from_request(&req, StatusCode::OK);
        assert_eq!(resp.headers.via, req.headers.via);
        assert_eq!(resp.headers.cseq, req.headers.cseq);
        assert_eq!(resp.method(), Some(&Method::Options));
        assert!(resp.headers.contact.is_empty());
    }

    #[test]
    fn test_display_renders_start_line_and_length() {
        let text = Message::from(options()).to_string();
        assert!(text.starts_with("OPTIONS sip:carol@chicago.example.com SIP/2.0\r\n"));
        assert!(text.contains("CSeq: 63104 OPTIONS\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }
}
