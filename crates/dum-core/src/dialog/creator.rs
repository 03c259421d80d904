//! Initial request templates
//!
//! Every dialog set started locally keeps the request that started it. The
//! creator is what gets re-sent on authentication retries, what CANCEL is
//! built from and what lets a NOTIFY that overtakes its 2xx find the
//! subscription it belongs to.

use bytes::Bytes;

use sipdum_message::{Method, Request};

/// Which factory produced the initial request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatorKind {
    Invite,
    /// SUBSCRIBE, or an out-of-dialog REFER creating an implicit subscription
    Subscription,
    Registration,
    Publication,
    OutOfDialog,
}

/// The request that starts a locally initiated dialog set
#[derive(Debug, Clone)]
pub struct Creator {
    pub kind: CreatorKind,
    last_request: Request,
    initial_offer: Option<Bytes>,
}

impl Creator {
    pub fn new(kind: CreatorKind, request: Request) -> Self {
        let initial_offer =
            (kind == CreatorKind::Invite && !request.body.is_empty()).then(|| request.body.clone());
        Self {
            kind,
            last_request: request,
            initial_offer,
        }
    }

    /// Most recent version of the initial request (as last sent)
    pub fn last_request(&self) -> &Request {
        &self.last_request
    }

    pub fn set_last_request(&mut self, request: Request) {
        if self.kind == CreatorKind::Invite && !request.body.is_empty() {
            self.initial_offer = Some(request.body.clone());
        }
        self.last_request = request;
    }

    /// SDP offer carried by the initial INVITE
    pub fn initial_offer(&self) -> Option<&Bytes> {
        self.initial_offer.as_ref()
    }

    pub fn method(&self) -> &Method {
        &self.last_request.method
    }

    /// Event package of a SUBSCRIBE/REFER/PUBLISH creator
    pub fn event(&self) -> Option<&str> {
        match self.last_request.method {
            Method::Refer => Some("refer"),
            _ => self.last_request.headers.event_type(),
        }
    }

    /// `true` when `seq` is the CSeq of the current initial request
    pub fn matches_cseq(&self, seq: Option<u32>) -> bool {
        seq.is_some() && self.last_request.headers.cseq_seq() == seq
    }
}
