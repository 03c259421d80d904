//! # SIP Methods
//!
//! The request methods of RFC 3261 and the extensions the dialog usage
//! manager routes (SUBSCRIBE/NOTIFY, REFER, PUBLISH, MESSAGE, INFO, PRACK,
//! UPDATE). Unknown methods are kept verbatim as [`Method::Extension`] so a
//! request can still be rejected with 405 and a correct Allow header.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MessageError, MessageResult};

/// SIP request method
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Register,
    Options,
    Subscribe,
    Notify,
    Refer,
    Publish,
    Message,
    Info,
    Prack,
    Update,
    /// Any other method token, kept verbatim
    Extension(String),
}

impl Method {
    /// The method name as it appears on the wire
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Register => "REGISTER",
            Method::Options => "OPTIONS",
            Method::Subscribe => "SUBSCRIBE",
            Method::Notify => "NOTIFY",
            Method::Refer => "REFER",
            Method::Publish => "PUBLISH",
            Method::Message => "MESSAGE",
            Method::Info => "INFO",
            Method::Prack => "PRACK",
            Method::Update => "UPDATE",
            Method::Extension(name) => name,
        }
    }

    /// Methods whose requests can establish a dialog (RFC 3261, RFC 6665, RFC 3515)
    pub fn creates_dialog(&self) -> bool {
        matches!(self, Method::Invite | Method::Subscribe | Method::Refer)
    }

    /// Methods that have a transaction of their own but never carry new CSeq numbers
    pub fn is_ack_or_cancel(&self) -> bool {
        matches!(self, Method::Ack | Method::Cancel)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = MessageError;

    /// Method names are case-sensitive (RFC 3261 §7.1)
    fn from_str(s: &str) -> MessageResult<Self> {
        let s = s.trim();
        if s.is_empty() || !s.chars().all(crate::parser::is_token_char) {
            return Err(MessageError::parse("method", s));
        }
        Ok(match s {
            "INVITE" => Method::Invite,
            "ACK" => Method::Ack,
            "BYE" => Method::Bye,
            "CANCEL" => Method::Cancel,
            "REGISTER" => Method::Register,
            "OPTIONS" => Method::Options,
            "SUBSCRIBE" => Method::Subscribe,
            "NOTIFY" => Method::Notify,
            "REFER" => Method::Refer,
            "PUBLISH" => Method::Publish,
            "MESSAGE" => Method::Message,
            "INFO" => Method::Info,
            "PRACK" => Method::Prack,
            "UPDATE" => Method::Update,
            other => Method::Extension(other.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_and_extension_methods() {
        assert_eq!("SUBSCRIBE".parse::<Method>().unwrap(), Method::Subscribe);
        assert_eq!("invite".parse::<Method>().unwrap(), Method::Extension("invite".into()));
        assert_eq!(Method::Extension("FOO".into()).to_string(), "FOO");
        assert!("BAD METHOD".parse::<Method>().is_err());
    }
}
