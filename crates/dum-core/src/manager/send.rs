//! Outbound decoration
//!
//! Everything the application or a usage sends goes through
//! [`DialogUsageManager::send`]. Requests other than ACK and CANCEL get a
//! fresh branch, Max-Forwards, cached credentials, User-Agent and (when
//! configured) an Identity header, then the outbound proxy and strict-route
//! rewriting. The request is recorded before it leaves: as the creator's
//! latest request for an initial request, or in the dialog's pending table
//! for an in-dialog one, so that a 401/407 can be answered later.

use tracing::{debug, trace};

use sipdum_message::{Message, Method, NameAddr, Request, Response, StatusCode, Via};

use super::{dialog_entry, DialogUsageManager};
use crate::dialog::dialog_utils::{generate_branch, generate_tag};
use crate::dialog::{DialogId, DialogSetId};
use crate::errors::DumResult;

impl DialogUsageManager {
    /// Send a request or response built by the application
    pub fn send(&mut self, message: impl Into<Message>) -> DumResult<()> {
        match message.into() {
            Message::Request(request) => self.send_request(request).map(|_| ()),
            Message::Response(response) => {
                self.send_response(response);
                Ok(())
            }
        }
    }

    /// Decorate, record and send a request; returns the branch it left with
    pub(crate) fn send_request(&mut self, mut request: Request) -> DumResult<Option<String>> {
        if !request.method.is_ack_or_cancel() {
            self.decorate(&mut request);
        }
        self.record_outbound(&request);

        let branch = request.headers.branch().map(str::to_string);
        let wire = apply_strict_route(request);
        debug!("Sending {} to {}", wire.method, wire.uri);
        self.transport.send(Message::Request(wire));
        Ok(branch)
    }

    pub(crate) fn send_response(&mut self, response: Response) {
        trace!("Sending {} {}", response.status, response.reason);
        match response.metadata.source {
            Some(destination) => self.transport.send_to(Message::Response(response), destination),
            None => self.transport.send(Message::Response(response)),
        }
    }

    /// Answer a request outside any usage
    ///
    /// A To tag is added when the request has none. ACKs are never answered.
    pub(crate) fn reply(&mut self, request: &Request, code: StatusCode) {
        let response = self.make_reply(request, code);
        self.reply_with(request, response);
    }

    pub(crate) fn make_reply(&self, request: &Request, code: StatusCode) -> Response {
        let mut response = Response::from_request(request, code);
        if let Some(to) = response.headers.to.as_mut() {
            if to.tag().is_none() && code != StatusCode::TRYING {
                to.set_tag(generate_tag());
            }
        }
        response
    }

    pub(crate) fn reply_with(&mut self, request: &Request, response: Response) {
        if request.method == Method::Ack {
            trace!("Not answering ACK with {}", response.status);
            return;
        }
        self.send_response(response);
    }

    /// Response to a dialog-less request, tagged with the dialog set's local tag
    pub(crate) fn make_set_response(
        &self,
        set_id: &DialogSetId,
        request: &Request,
        code: StatusCode,
    ) -> Response {
        let mut response = Response::from_request(request, code);
        if let Some(to) = response.headers.to.as_mut() {
            if to.tag().is_none() {
                to.set_tag(set_id.local_tag.clone());
            }
        }
        response
    }

    fn decorate(&self, request: &mut Request) {
        let config = &self.config;
        if request.headers.via.is_empty() {
            let via =
                Via::new(config.via_transport.clone(), config.via_host.clone(), config.via_port);
            request.headers.via.push(via);
        }
        if let Some(via) = request.headers.via.first_mut() {
            via.set_branch(generate_branch());
        }
        if request.headers.max_forwards.is_none() {
            request.headers.max_forwards = Some(config.max_forwards);
        }
        if request.headers.user_agent.is_none() {
            request.headers.user_agent = config.user_agent.clone();
        }
        if request.headers.route.is_empty() {
            if let Some(proxy) = &config.outbound_proxy {
                request.headers.route.push(NameAddr::new(proxy.clone().with_param("lr", None)));
            }
        }
        if let Some(auth) = self.handlers.client_auth.clone() {
            auth.add_authorization(request);
        }
        if config.compute_identity && request.headers.identity.is_none() {
            if let Some(security) = self.handlers.security.clone() {
                let domain = request
                    .headers
                    .from
                    .as_ref()
                    .map(|from| from.uri.host.clone())
                    .unwrap_or_else(|| config.via_host.clone());
                request.headers.identity = security.compute_identity(&domain, request);
            }
        }
    }

    fn record_outbound(&mut self, request: &Request) {
        if request.method.is_ack_or_cancel() {
            return;
        }
        if request.headers.to_tag().is_some() {
            if let Some(dialog_id) = DialogId::from_uac_request(request) {
                if let Some(dialog) = dialog_entry(&mut self.dialog_sets, &dialog_id) {
                    if let Some(seq) = request.headers.cseq_seq() {
                        dialog.requests.insert(seq, request.clone());
                    }
                    return;
                }
            }
        }
        let Some(set_id) = DialogSetId::from_uac_request(request) else {
            return;
        };
        if let Some(set) = self.dialog_sets.get_mut(&set_id) {
            if let Some(creator) = set.creator.as_mut() {
                if creator.method() == &request.method {
                    creator.set_last_request(request.clone());
                    set.awaiting_final = true;
                }
            }
        }
    }
}

/// Rewrite a request whose first route is a strict router (RFC 3261 §12.2.1.1)
fn apply_strict_route(mut request: Request) -> Request {
    let strict = request
        .headers
        .route
        .first()
        .map(|route| !route.uri.is_loose_router())
        .unwrap_or(false);
    if strict {
        let first = request.headers.route.remove(0);
        let target = std::mem::replace(&mut request.uri, first.uri);
        request.headers.route.push(NameAddr::new(target));
    }
    request
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_route_rewrite() {
        let mut request = Request::new(Method::Bye, "sip:bob@192.0.2.4".parse().unwrap());
        request.headers.route = vec![
            "<sip:p1.example.com>".parse().unwrap(),
            "<sip:p2.example.com;lr>".parse().unwrap(),
        ];
        let wire = apply_strict_route(request);
        assert_eq!(wire.uri.host, "p1.example.com");
        assert_eq!(wire.headers.route.len(), 2);
        assert_eq!(wire.headers.route[1].uri.host, "192.0.2.4");
    }

    #[test]
    fn test_loose_route_untouched() {
        let mut request = Request::new(Method::Bye, "sip:bob@192.0.2.4".parse().unwrap());
        request.headers.route = vec!["<sip:p1.example.com;lr>".parse().unwrap()];
        let wire = apply_strict_route(request);
        assert_eq!(wire.uri.host, "192.0.2.4");
        assert_eq!(wire.headers.route.len(), 1);
    }
}
