//! `message/sipfrag` bodies (RFC 3420)
//!
//! REFER subscriptions report progress of the referred request as a NOTIFY
//! whose body is a fragment starting with a status line. Only that status
//! line matters to the dialog layer.

use crate::parser;
use crate::status::StatusCode;

/// Status code carried by a sipfrag body, if its first line is a status line
pub fn sipfrag_status(body: &[u8]) -> Option<StatusCode> {
    let text = std::str::from_utf8(body).ok()?;
    let (_, code) = parser::status_line(text).ok()?;
    StatusCode::from_u16(code).ok()
}
