//! Core dialog implementation
//!
//! A [`Dialog`] is one leg identified by Call-ID and the two tags. It holds
//! everything needed to build in-dialog requests (route set, remote target,
//! CSeq counters) and refers to the usages riding on it by handle. The usage
//! data itself lives in the manager's registry.
//!
//! Route sets follow RFC 3261 §12.1: a UAC builds it from the Record-Route
//! of a response in reverse order, a UAS (or a subscriber learning the
//! dialog from a NOTIFY) keeps the request's order.

use std::collections::BTreeMap;

use tracing::debug;

use sipdum_message::{CSeq, MessageError, Method, NameAddr, Request, Response, StatusCode, Via};

use super::dialog_id::{DialogId, DialogSetId};
use super::dialog_state::{DialogState, DialogType};
use super::dialog_utils::generate_branch;
use crate::config::DumConfig;
use crate::errors::{DumError, DumResult};
use crate::handlers::ClientAuthManager;
use crate::usage::{
    ClientSubscriptionHandle, InviteSessionHandle, ServerSubscriptionHandle, UsageId,
};

/// A SIP dialog
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub dialog_type: DialogType,
    pub state: DialogState,
    /// `true` when we sent the dialog-forming request
    pub is_uac: bool,

    /// Our From (as UAC) or To (as UAS), carrying the local tag
    pub local_name_addr: NameAddr,
    /// The peer's address, carrying the remote tag
    pub remote_name_addr: NameAddr,
    pub local_contact: NameAddr,
    /// Request-URI for requests inside the dialog
    pub remote_target: NameAddr,
    pub route_set: Vec<NameAddr>,

    pub local_cseq: u32,
    pub remote_cseq: Option<u32>,
    /// CSeq of the INVITE an ACK has to acknowledge
    pub ack_cseq: u32,

    pub invite_session: Option<InviteSessionHandle>,
    pub client_subscriptions: Vec<ClientSubscriptionHandle>,
    pub server_subscriptions: Vec<ServerSubscriptionHandle>,

    /// Requests sent and not yet answered finally, by CSeq (ACK excluded)
    pub requests: BTreeMap<u32, Request>,
}

impl Dialog {
    /// Dialog formed by a response to our request
    pub fn new_uac(
        dialog_type: DialogType,
        request: &Request,
        response: &Response,
    ) -> DumResult<Self> {
        let id = DialogId::from_uac_response(response)
            .ok_or_else(|| DumError::invalid_message("response lacks Call-ID or tags"))?;
        let mut route_set = response.headers.record_route.clone();
        route_set.reverse();
        Self::build_uac(id, dialog_type, request, response.headers.contact.first(), route_set)
    }

    /// Dialog learned from a NOTIFY that overtook the 2xx to our SUBSCRIBE
    pub fn new_uac_from_notify(request: &Request, notify: &Request) -> DumResult<Self> {
        let id = DialogId::from_uas_request(notify)
            .ok_or_else(|| DumError::invalid_message("NOTIFY lacks Call-ID or tags"))?;
        let route_set = notify.headers.record_route.clone();
        let mut dialog = Self::build_uac(
            id,
            DialogType::Subscription,
            request,
            notify.headers.contact.first(),
            route_set,
        )?;
        dialog.remote_cseq = notify.headers.cseq_seq();
        Ok(dialog)
    }

    /// Placeholder for a failed initial SUBSCRIBE
    pub fn new_fake(request: &Request, response: &Response) -> DumResult<Self> {
        let set_id = DialogSetId::from_uac_response(response)
            .ok_or_else(|| DumError::invalid_message("response lacks Call-ID or From tag"))?;
        let id = DialogId::from_set(&set_id, response.headers.to_tag().unwrap_or_default());
        Self::build_uac(id, DialogType::Fake, request, None, Vec::new())
    }

    fn build_uac(
        id: DialogId,
        dialog_type: DialogType,
        request: &Request,
        remote_contact: Option<&NameAddr>,
        route_set: Vec<NameAddr>,
    ) -> DumResult<Self> {
        let local_name_addr = request.headers.from.clone().ok_or(MessageError::missing("From"))?;
        let mut remote_name_addr = request.headers.to.clone().ok_or(MessageError::missing("To"))?;
        if !id.remote_tag.is_empty() {
            remote_name_addr.set_tag(id.remote_tag.clone());
        }
        let local_contact = request
            .headers
            .contact
            .first()
            .cloned()
            .unwrap_or_else(|| local_name_addr.clone());
        let remote_target = remote_contact
            .cloned()
            .unwrap_or_else(|| NameAddr::new(request.uri.clone()));
        let local_cseq = request.headers.cseq_seq().unwrap_or(1);

        debug!("Created UAC dialog {} ({:?})", id, dialog_type);
        Ok(Self {
            id,
            dialog_type,
            state: DialogState::Forming,
            is_uac: true,
            local_name_addr,
            remote_name_addr,
            local_contact,
            remote_target,
            route_set,
            local_cseq,
            remote_cseq: None,
            ack_cseq: local_cseq,
            invite_session: None,
            client_subscriptions: Vec::new(),
            server_subscriptions: Vec::new(),
            requests: BTreeMap::new(),
        })
    }

    /// Dialog formed by a request we received
    pub fn new_uas(
        dialog_type: DialogType,
        request: &Request,
        local_tag: &str,
        local_contact: NameAddr,
    ) -> DumResult<Self> {
        let h = &request.headers;
        let call_id = h.call_id.as_deref().ok_or(MessageError::missing("Call-ID"))?;
        let remote_name_addr = h.from.clone().ok_or(MessageError::missing("From"))?;
        let remote_tag = remote_name_addr
            .tag()
            .ok_or_else(|| DumError::invalid_message("request lacks From tag"))?
            .to_string();
        let mut local_name_addr = h.to.clone().ok_or(MessageError::missing("To"))?;
        local_name_addr.set_tag(local_tag);

        let remote_target = h
            .contact
            .first()
            .cloned()
            .unwrap_or_else(|| NameAddr::new(remote_name_addr.uri.clone()));
        let id = DialogId::new(call_id, local_tag, remote_tag);

        debug!("Created UAS dialog {} ({:?})", id, dialog_type);
        Ok(Self {
            id,
            dialog_type,
            state: DialogState::Forming,
            is_uac: false,
            local_name_addr,
            remote_name_addr,
            local_contact,
            remote_target,
            route_set: h.record_route.clone(),
            local_cseq: 0,
            remote_cseq: h.cseq_seq(),
            ack_cseq: 0,
            invite_session: None,
            client_subscriptions: Vec::new(),
            server_subscriptions: Vec::new(),
            requests: BTreeMap::new(),
        })
    }

    /// Build a request inside this dialog
    ///
    /// Non-ACK requests take the next local CSeq; ACK reuses the CSeq of the
    /// INVITE being acknowledged. CANCEL is built from the INVITE itself, see
    /// [`make_cancel`](super::dialog_utils::make_cancel).
    pub fn make_request(&mut self, method: Method, config: &DumConfig) -> Request {
        let mut request = Request::new(method.clone(), self.remote_target.uri.clone());
        let h = &mut request.headers;
        h.to = Some(self.remote_name_addr.clone());
        h.from = Some(self.local_name_addr.clone());
        h.call_id = Some(self.id.call_id.clone());
        h.route = self.route_set.clone();
        h.contact = vec![self.local_contact.clone()];
        h.max_forwards = Some(config.max_forwards);
        h.via = vec![
            Via::new(config.via_transport.clone(), config.via_host.clone(), config.via_port)
                .with_branch(generate_branch()),
        ];

        let seq = match method {
            Method::Ack => self.ack_cseq,
            _ => {
                self.local_cseq += 1;
                self.local_cseq
            }
        };
        h.cseq = Some(CSeq::new(seq, method.clone()));

        if method == Method::Invite {
            self.ack_cseq = seq;
            if config.advertise_capabilities {
                h.allow = config.supported_methods.clone();
                h.accept_encoding = config.supported_encodings.clone();
                h.accept_language = config.supported_languages.clone();
                h.supported = config.supported_option_tags.clone();
            }
        }
        request
    }

    /// Build a response to a request received in this dialog
    pub fn make_response(&self, request: &Request, code: StatusCode) -> Response {
        let mut response = Response::from_request(request, code);
        if let Some(to) = response.headers.to.as_mut() {
            to.set_tag(self.id.local_tag.clone());
        }
        let carries_contact = matches!(
            request.method,
            Method::Invite
                | Method::Subscribe
                | Method::Bye
                | Method::Cancel
                | Method::Refer
                | Method::Message
                | Method::Notify
                | Method::Info
                | Method::Options
        );
        if carries_contact
            && code != StatusCode::TRYING
            && (code.is_provisional() || code.is_success())
        {
            response.headers.contact = vec![self.local_contact.clone()];
        }
        response
    }

    /// Check an inbound request's CSeq against the last one seen
    ///
    /// Returns `false` for a request older than the previous one.
    pub fn accept_remote_cseq(&mut self, request: &Request) -> bool {
        if request.method.is_ack_or_cancel() {
            return true;
        }
        let Some(seq) = request.headers.cseq_seq() else {
            return false;
        };
        match self.remote_cseq {
            Some(last) if seq < last => false,
            _ => {
                self.remote_cseq = Some(seq);
                true
            }
        }
    }

    /// Refresh the remote target from a target-refresh message's Contact
    pub fn update_remote_target(&mut self, contact: Option<&NameAddr>) {
        if let Some(contact) = contact {
            self.remote_target = contact.clone();
        }
    }

    /// Adopt the route set and target of the 2xx that confirms a dialog
    pub fn confirm(&mut self, response: &Response) {
        if self.is_uac && self.state == DialogState::Forming {
            let mut route_set = response.headers.record_route.clone();
            route_set.reverse();
            self.route_set = route_set;
        }
        self.update_remote_target(response.headers.contact.first());
        if self.state == DialogState::Forming {
            self.state = DialogState::Established;
        }
    }

    /// Build a credentialed retry of the request a 401/407 answered
    ///
    /// The retry takes the next CSeq and a fresh branch; an INVITE retry
    /// moves `ack_cseq` along with it.
    pub fn auth_retry(
        &mut self,
        response: &Response,
        auth: &dyn ClientAuthManager,
    ) -> Option<Request> {
        let seq = response.headers.cseq_seq()?;
        let mut retry = self.requests.get(&seq)?.clone();
        if !auth.handle_challenge(&mut retry, response) {
            return None;
        }
        self.requests.remove(&seq);
        self.local_cseq += 1;
        if let Some(cseq) = retry.headers.cseq.as_mut() {
            cseq.seq = self.local_cseq;
        }
        if retry.method == Method::Invite {
            self.ack_cseq = self.local_cseq;
        }
        if let Some(via) = retry.headers.via.first_mut() {
            via.set_branch(generate_branch());
        }
        debug!(
            "Retrying {} in dialog {} with credentials, CSeq {}",
            retry.method, self.id, self.local_cseq
        );
        Some(retry)
    }

    /// `true` when no usage rides on the dialog anymore
    pub fn is_empty(&self) -> bool {
        self.invite_session.is_none()
            && self.client_subscriptions.is_empty()
            && self.server_subscriptions.is_empty()
    }

    /// Detach a usage; returns `true` if it was attached here
    pub fn detach(&mut self, id: UsageId) -> bool {
        if self.invite_session.map(|h| h.id()) == Some(id) {
            self.invite_session = None;
            return true;
        }
        let before = self.client_subscriptions.len() + self.server_subscriptions.len();
        self.client_subscriptions.retain(|h| h.id() != id);
        self.server_subscriptions.retain(|h| h.id() != id);
        before != self.client_subscriptions.len() + self.server_subscriptions.len()
    }

    /// Every usage attached to the dialog
    pub fn usage_ids(&self) -> Vec<UsageId> {
        self.invite_session
            .iter()
            .map(|h| h.id())
            .chain(self.client_subscriptions.iter().map(|h| h.id()))
            .chain(self.server_subscriptions.iter().map(|h| h.id()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invite() -> Request {
        let mut req = Request::new(Method::Invite, "sip:bob@biloxi.example.com".parse().unwrap());
        req.headers.from = Some("<sip:alice@atlanta.example.com>;tag=9fxced76sl".parse().unwrap());
        req.headers.to = Some("<sip:bob@biloxi.example.com>".parse().unwrap());
        req.headers.call_id = Some("3848276298220188511@atlanta.example.com".into());
        req.headers.cseq = Some(CSeq::new(1, Method::Invite));
        req.headers.contact = vec!["<sip:alice@client.atlanta.example.com>".parse().unwrap()];
        req
    }

    fn ok(req: &Request) -> Response {
        let mut resp = Response::from_request(req, StatusCode::OK);
        resp.headers.to.as_mut().unwrap().set_tag("8321234356");
        resp.headers.contact = vec!["<sip:bob@192.0.2.4>".parse().unwrap()];
        resp.headers.record_route = vec![
            "<sip:a.example.com;lr>".parse().unwrap(),
            "<sip:b.example.com;lr>".parse().unwrap(),
            "<sip:c.example.com;lr>".parse().unwrap(),
        ];
        resp
    }

    #[test]
    fn test_uac_dialog_from_2xx() {
        let req = invite();
        let dialog = Dialog::new_uac(DialogType::Invitation, &req, &ok(&req)).unwrap();
        assert_eq!(dialog.id.local_tag, "9fxced76sl");
        assert_eq!(dialog.id.remote_tag, "8321234356");
        assert_eq!(dialog.local_contact.uri.host, "client.atlanta.example.com");
        assert_eq!(dialog.remote_target.uri.host, "192.0.2.4");
        let hosts: Vec<_> = dialog.route_set.iter().map(|r| r.uri.host.as_str()).collect();
        assert_eq!(hosts, ["c.example.com", "b.example.com", "a.example.com"]);
    }

    #[test]
    fn test_uas_dialog_keeps_route_order() {
        let mut req = invite();
        req.headers.record_route = vec![
            "<sip:a.example.com;lr>".parse().unwrap(),
            "<sip:b.example.com;lr>".parse().unwrap(),
        ];
        let contact: NameAddr = "<sip:bob@192.0.2.4>".parse().unwrap();
        let dialog = Dialog::new_uas(DialogType::Invitation, &req, "a6c85cf", contact).unwrap();
        assert_eq!(dialog.id.local_tag, "a6c85cf");
        assert_eq!(dialog.id.remote_tag, "9fxced76sl");
        assert_eq!(dialog.route_set[0].uri.host, "a.example.com");
        assert_eq!(dialog.remote_target.uri.host, "client.atlanta.example.com");
    }

    #[test]
    fn test_make_request_stamps_dialog_state() {
        let req = invite();
        let mut dialog = Dialog::new_uac(DialogType::Invitation, &req, &ok(&req)).unwrap();
        let config = DumConfig::default();

        let bye = dialog.make_request(Method::Bye, &config);
        assert_eq!(bye.uri.host, "192.0.2.4");
        assert_eq!(bye.headers.to_tag(), Some("8321234356"));
        assert_eq!(bye.headers.cseq_seq(), Some(2));
        assert_eq!(bye.headers.route.len(), 3);
        assert_eq!(bye.headers.max_forwards, Some(70));
        assert!(bye.headers.branch().unwrap().starts_with("z9hG4bK"));
        assert!(bye.headers.allow.is_empty());

        let ack = dialog.make_request(Method::Ack, &config);
        assert_eq!(ack.headers.cseq_seq(), Some(1));
        assert_eq!(dialog.local_cseq, 2);
    }

    #[test]
    fn test_make_response_sets_tag_and_contact() {
        let req = invite();
        let contact: NameAddr = "<sip:bob@192.0.2.4>".parse().unwrap();
        let dialog = Dialog::new_uas(DialogType::Invitation, &req, "a6c85cf", contact).unwrap();

        let trying = dialog.make_response(&req, StatusCode::TRYING);
        assert_eq!(trying.headers.to_tag(), Some("a6c85cf"));
        assert!(trying.headers.contact.is_empty());

        let ringing = dialog.make_response(&req, StatusCode::RINGING);
        assert_eq!(ringing.headers.contact.len(), 1);

        let busy = dialog.make_response(&req, StatusCode::BUSY_HERE);
        assert!(busy.headers.contact.is_empty());
    }

    #[test]
    fn test_remote_cseq_order() {
        let req = invite();
        let contact: NameAddr = "<sip:bob@192.0.2.4>".parse().unwrap();
        let mut dialog = Dialog::new_uas(DialogType::Invitation, &req, "a6c85cf", contact).unwrap();

        let mut bye = req.clone();
        bye.method = Method::Bye;
        bye.headers.cseq = Some(CSeq::new(2, Method::Bye));
        assert!(dialog.accept_remote_cseq(&bye));

        let mut stale = req.clone();
        stale.method = Method::Info;
        stale.headers.cseq = Some(CSeq::new(1, Method::Info));
        assert!(!dialog.accept_remote_cseq(&stale));
    }
}
