//! # sipdum-message
//!
//! The parsed SIP message model consumed by `sipdum-core`.
//!
//! Framing and full SIP grammar parsing belong to the transport layer; by the
//! time a message reaches the dialog usage manager every header it cares about
//! is already a typed value. This crate defines those typed values:
//!
//! - [`Method`] and [`StatusCode`]
//! - [`Uri`], [`NameAddr`] and their [`Params`]
//! - header values such as [`Via`], [`CSeq`], [`Token`] and [`MimeType`]
//! - [`Headers`], [`Request`], [`Response`] and the [`Message`] envelope
//!
//! Small `nom` parsers are provided for the values applications write by hand
//! (URIs, name-addrs, tokens), so that `"sip:bob@example.com".parse::<Uri>()`
//! works in configuration and tests.
//!
//! ## Example
//!
//! ```rust
//! use sipdum_message::{Method, NameAddr, Request, Response, StatusCode};
//!
//! let mut invite = Request::new(Method::Invite, "sip:bob@example.com".parse().unwrap());
//! invite.headers.from = Some("\"Alice\" <sip:alice@example.com>;tag=1928301774".parse().unwrap());
//! invite.headers.to = Some("<sip:bob@example.com>".parse::<NameAddr>().unwrap());
//! invite.headers.call_id = Some("a84b4c76e66710".to_string());
//!
//! let ringing = Response::from_request(&invite, StatusCode::RINGING);
//! assert_eq!(ringing.headers.call_id.as_deref(), Some("a84b4c76e66710"));
//! assert_eq!(ringing.headers.from_tag(), Some("1928301774"));
//! ```

pub mod error;
pub mod headers;
pub mod message;
pub mod method;
pub mod name_addr;
pub mod param;
pub mod parser;
pub mod sipfrag;
pub mod status;
pub mod uri;

pub use error::{MessageError, MessageResult};
pub use headers::{CSeq, Headers, MimeType, Token, Via};
pub use message::{IdentityStrength, Message, Metadata, Request, Response, SecurityAttributes};
pub use method::Method;
pub use name_addr::NameAddr;
pub use param::{Param, Params};
pub use status::StatusCode;
pub use uri::{Scheme, Uri};
