//! Name-addr values: To, From, Contact, Route, Record-Route, Refer-To

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MessageError, MessageResult};
use crate::param::Params;
use crate::parser;
use crate::uri::Uri;

/// `"Display" <uri>;header-params`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: Uri,
    pub params: Params,
}

impl NameAddr {
    pub fn new(uri: Uri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Params::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// The `tag` header parameter (RFC 3261 §19.3)
    pub fn tag(&self) -> Option<&str> {
        self.params.get("tag").filter(|t| !t.is_empty())
    }

    pub fn set_tag(&mut self, tag: impl Into<String>) {
        self.params.set("tag", Some(tag.into()));
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.set_tag(tag);
        self
    }

    pub fn remove_tag(&mut self) {
        self.params.remove("tag");
    }
}

impl From<Uri> for NameAddr {
    fn from(uri: Uri) -> Self {
        NameAddr::new(uri)
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>{}", self.uri, self.params)
    }
}

impl FromStr for NameAddr {
    type Err = MessageError;

    fn from_str(s: &str) -> MessageResult<Self> {
        parser::parse_complete(parser::name_addr, s.trim())
            .ok_or_else(|| MessageError::parse("name-addr", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_angle_form_keeps_uri_and_header_params_apart() {
        let addr: NameAddr = "\"Bob\" <sip:bob@biloxi.example.com;lr>;tag=a6c85cf".parse().unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Bob"));
        assert!(addr.uri.is_loose_router());
        assert_eq!(addr.tag(), Some("a6c85cf"));
    }

    #[test]
    fn test_bare_addr_spec_params_belong_to_header() {
        let addr: NameAddr = "sip:carol@chicago.example.com;tag=xyz".parse().unwrap();
        assert!(addr.uri.params.is_empty());
        assert_eq!(addr.tag(), Some("xyz"));
    }

    #[test]
    fn test_unquoted_display_name() {
        let mut addr: NameAddr = "Alice <sip:alice@atlanta.example.com>".parse().unwrap();
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.tag(), None);
        addr.set_tag("88sja8x");
        assert_eq!(addr.to_string(), "\"Alice\" <sip:alice@atlanta.example.com>;tag=88sja8x");
    }
}
