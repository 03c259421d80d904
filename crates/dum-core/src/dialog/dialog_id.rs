//! Dialog, dialog set and merged-request identifiers
//!
//! Identifiers are always expressed from the local point of view: the
//! "local tag" is the tag this user agent put in From (as UAC) or To (as
//! UAS). [`DialogSetId`] is what is known before the peer has answered, so it
//! is the key used to find the owning dialog set of any message.

use std::fmt;

use serde::{Deserialize, Serialize};

use sipdum_message::{Method, Request, Response};

/// Call-ID plus local tag
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DialogSetId {
    pub call_id: String,
    pub local_tag: String,
}

impl DialogSetId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
        }
    }

    /// Set of a request we send or of a response we receive (local tag in From)
    pub fn from_uac_request(request: &Request) -> Option<Self> {
        Some(Self::new(request.headers.call_id.as_deref()?, request.headers.from_tag()?))
    }

    pub fn from_uac_response(response: &Response) -> Option<Self> {
        Some(Self::new(response.headers.call_id.as_deref()?, response.headers.from_tag()?))
    }

    /// Set of an in-dialog request we receive (local tag in To)
    pub fn from_uas_request(request: &Request) -> Option<Self> {
        Some(Self::new(request.headers.call_id.as_deref()?, request.headers.to_tag()?))
    }
}

impl fmt::Display for DialogSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.call_id, self.local_tag)
    }
}

/// Call-ID plus local and remote tags
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    pub remote_tag: String,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<String>,
        local_tag: impl Into<String>,
        remote_tag: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    pub fn from_set(set: &DialogSetId, remote_tag: impl Into<String>) -> Self {
        Self::new(set.call_id.clone(), set.local_tag.clone(), remote_tag)
    }

    /// Dialog of a response to one of our requests
    pub fn from_uac_response(response: &Response) -> Option<Self> {
        let h = &response.headers;
        Some(Self::new(h.call_id.as_deref()?, h.from_tag()?, h.to_tag()?))
    }

    /// Dialog of a request we send inside an existing dialog
    pub fn from_uac_request(request: &Request) -> Option<Self> {
        let h = &request.headers;
        Some(Self::new(h.call_id.as_deref()?, h.from_tag()?, h.to_tag()?))
    }

    /// Dialog of a request the peer sends inside an existing dialog
    pub fn from_uas_request(request: &Request) -> Option<Self> {
        let h = &request.headers;
        Some(Self::new(h.call_id.as_deref()?, h.to_tag()?, h.from_tag()?))
    }

    pub fn dialog_set_id(&self) -> DialogSetId {
        DialogSetId::new(self.call_id.clone(), self.local_tag.clone())
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.call_id, self.local_tag, self.remote_tag)
    }
}

/// Identity of a tag-less request for merged-request detection (RFC 3261 §8.2.2.2)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MergedRequestKey {
    pub from_tag: String,
    pub call_id: String,
    pub cseq: u32,
    pub method: Method,
}

impl MergedRequestKey {
    pub fn from_request(request: &Request) -> Option<Self> {
        let h = &request.headers;
        let cseq = h.cseq.as_ref()?;
        Some(Self {
            from_tag: h.from_tag()?.to_string(),
            call_id: h.call_id.clone()?,
            cseq: cseq.seq,
            method: cseq.method.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sipdum_message::CSeq;

    fn in_dialog_request() -> Request {
        let mut req = Request::new(Method::Bye, "sip:bob@192.0.2.4".parse().unwrap());
        req.headers.call_id = Some("a84b4c76e66710".into());
        req.headers.from = Some("<sip:alice@atlanta.example.com>;tag=1928301774".parse().unwrap());
        req.headers.to = Some("<sip:bob@biloxi.example.com>;tag=a6c85cf".parse().unwrap());
        req.headers.cseq = Some(CSeq::new(231, Method::Bye));
        req
    }

    #[test]
    fn test_direction_swaps_tags() {
        let req = in_dialog_request();
        let ours = DialogId::from_uac_request(&req).unwrap();
        let theirs = DialogId::from_uas_request(&req).unwrap();
        assert_eq!(ours.local_tag, "1928301774");
        assert_eq!(theirs.local_tag, "a6c85cf");
        assert_eq!(theirs.remote_tag, "1928301774");
        assert_eq!(ours.dialog_set_id(), DialogSetId::from_uac_request(&req).unwrap());
        assert_eq!(theirs.dialog_set_id(), DialogSetId::from_uas_request(&req).unwrap());
    }

    #[test]
    fn test_ordering_is_lexicographic() {
        let a = DialogId::new("c1", "a", "z");
        let b = DialogId::new("c1", "b", "a");
        let c = DialogId::new("c2", "a", "a");
        assert!(a < b && b < c);
    }

    #[test]
    fn test_merged_key_requires_from_tag() {
        let mut req = in_dialog_request();
        let key = MergedRequestKey::from_request(&req).unwrap();
        assert_eq!(key.cseq, 231);
        req.headers.from.as_mut().unwrap().remove_tag();
        assert!(MergedRequestKey::from_request(&req).is_none());
    }
}
