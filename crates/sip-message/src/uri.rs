//! # SIP URIs
//!
//! A deliberately small URI model: scheme, optional user part, host, port and
//! URI parameters. It covers everything the dialog layer reads from a URI
//! (scheme validation, `lr` for loose routing, the address-of-record) and
//! nothing more.
//!
//! ```rust
//! use sipdum_message::{Scheme, Uri};
//!
//! let uri: Uri = "sip:proxy.example.com:5070;lr".parse().unwrap();
//! assert_eq!(uri.scheme, Scheme::Sip);
//! assert_eq!(uri.port, Some(5070));
//! assert!(uri.is_loose_router());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MessageError, MessageResult};
use crate::param::Params;
use crate::parser;

/// URI scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scheme {
    Sip,
    Sips,
    Tel,
    Other(String),
}

impl Scheme {
    pub fn as_str(&self) -> &str {
        match self {
            Scheme::Sip => "sip",
            Scheme::Sips => "sips",
            Scheme::Tel => "tel",
            Scheme::Other(s) => s,
        }
    }

    /// Scheme names are case-insensitive
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "sip" => Scheme::Sip,
            "sips" => Scheme::Sips,
            "tel" => Scheme::Tel,
            other => Scheme::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A SIP, SIPS or TEL URI
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: Scheme,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub params: Params,
}

impl Uri {
    /// Create a `sip:` URI
    pub fn sip(user: Option<&str>, host: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Sip,
            user: user.map(str::to_string),
            host: host.into(),
            port: None,
            params: Params::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_param(mut self, name: &str, value: Option<&str>) -> Self {
        self.params.set(name, value.map(str::to_string));
        self
    }

    /// `true` when the URI carries the `lr` flag (RFC 3261 §16.4)
    pub fn is_loose_router(&self) -> bool {
        self.params.contains("lr")
    }

    /// Address-of-record form: `user@host` or `host`
    pub fn aor(&self) -> String {
        match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", self.params)
    }
}

impl FromStr for Uri {
    type Err = MessageError;

    fn from_str(s: &str) -> MessageResult<Self> {
        parser::parse_complete(parser::uri, s.trim()).ok_or_else(|| MessageError::parse("URI", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let uri: Uri = "sip:alice@atlanta.example.com;transport=tcp".parse().unwrap();
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host, "atlanta.example.com");
        assert_eq!(uri.params.get("transport"), Some("tcp"));
        assert_eq!(uri.to_string(), "sip:alice@atlanta.example.com;transport=tcp");
        assert_eq!(uri.aor(), "alice@atlanta.example.com");
    }

    #[test]
    fn test_other_schemes() {
        let tel: Uri = "tel:+1-212-555-0101".parse().unwrap();
        assert_eq!(tel.scheme, Scheme::Tel);
        assert_eq!(tel.host, "+1-212-555-0101");

        let mailto: Uri = "mailto:bob@example.com".parse().unwrap();
        assert_eq!(mailto.scheme, Scheme::Other("mailto".into()));
        assert!("no-scheme-here".parse::<Uri>().is_err());
    }
}
