//! Request factories
//!
//! Each `make_*` builds the initial request of a new client dialog set,
//! registers the set with its [`Creator`] and returns the request for the
//! application to adjust and pass to [`DialogUsageManager::send`]. Nothing
//! is sent here, and a set whose request is never sent just sits there until
//! `end_dialog_set`.

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use sipdum_message::{CSeq, Method, MimeType, NameAddr, Request, Uri};

use super::DialogUsageManager;
use crate::dialog::dialog_utils::{generate_call_id, generate_tag};
use crate::dialog::{Creator, CreatorKind, DialogSet, DialogSetId};
use crate::errors::{DumError, DumResult};
use crate::handlers::AppDialogSet;
use crate::usage::client_subscription::event_header;

impl DialogUsageManager {
    fn check_running(&self) -> DumResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(DumError::ShuttingDown)
        }
    }

    /// Skeleton of an initial request: fresh From tag and Call-ID, CSeq 1
    fn new_uac_request(&self, method: Method, target: &NameAddr) -> Request {
        let config = &self.config;
        let mut request = Request::new(method.clone(), target.uri.clone());
        let h = &mut request.headers;
        h.from = Some(config.local_identity.clone().with_tag(generate_tag()));
        let mut to = target.clone();
        to.remove_tag();
        h.to = Some(to);
        h.call_id = Some(generate_call_id(&config.via_host));
        h.cseq = Some(CSeq::new(1, method));
        h.contact = vec![config.local_contact.clone()];
        h.max_forwards = Some(config.max_forwards);
        request
    }

    fn register_creator(
        &mut self,
        kind: CreatorKind,
        request: &Request,
        app: Option<Arc<dyn AppDialogSet>>,
    ) -> DumResult<DialogSetId> {
        let set_id = DialogSetId::from_uac_request(request)
            .ok_or_else(|| DumError::internal("initial request without From tag"))?;
        debug!("New {:?} dialog set {}", kind, set_id);
        let set = DialogSet::new_uac(set_id.clone(), Creator::new(kind, request.clone()), app);
        self.dialog_sets.insert(set_id.clone(), set);
        Ok(set_id)
    }

    /// INVITE carrying an optional SDP offer
    pub fn make_invite_session(
        &mut self,
        target: &NameAddr,
        offer: Option<Bytes>,
        app: Option<Arc<dyn AppDialogSet>>,
    ) -> DumResult<Request> {
        self.check_running()?;
        if self.handlers.invite.is_none() {
            return Err(DumError::MissingHandler {
                role: "invite session",
                key: String::new(),
            });
        }
        let mut request = self.new_uac_request(Method::Invite, target);
        if self.config.advertise_capabilities {
            let h = &mut request.headers;
            h.allow = self.config.supported_methods.clone();
            h.accept_encoding = self.config.supported_encodings.clone();
            h.accept_language = self.config.supported_languages.clone();
            h.supported = self.config.supported_option_tags.clone();
        }
        if let Some(offer) = offer {
            request.headers.content_type = Some(MimeType::new("application", "sdp"));
            request.body = offer;
        }
        self.register_creator(CreatorKind::Invite, &request, app)?;
        Ok(request)
    }

    /// SUBSCRIBE for `event`; a client subscription handler for it must exist
    pub fn make_subscription(
        &mut self,
        target: &NameAddr,
        event: &str,
        expires: Option<u32>,
        app: Option<Arc<dyn AppDialogSet>>,
    ) -> DumResult<Request> {
        self.check_running()?;
        if !self.handlers.client_subscription.contains_key(event) {
            return Err(DumError::MissingHandler {
                role: "client subscription",
                key: event.to_string(),
            });
        }
        let mut request = self.new_uac_request(Method::Subscribe, target);
        request.headers.event = Some(event_header(event, None));
        request.headers.expires = Some(expires.unwrap_or(self.config.default_subscription_expires));
        self.register_creator(CreatorKind::Subscription, &request, app)?;
        Ok(request)
    }

    /// Out-of-dialog REFER; its implicit subscription uses the "refer" client handler
    pub fn make_refer(
        &mut self,
        target: &NameAddr,
        refer_to: NameAddr,
        app: Option<Arc<dyn AppDialogSet>>,
    ) -> DumResult<Request> {
        self.check_running()?;
        if !self.handlers.client_subscription.contains_key("refer") {
            return Err(DumError::MissingHandler {
                role: "client subscription",
                key: "refer".to_string(),
            });
        }
        let mut request = self.new_uac_request(Method::Refer, target);
        request.headers.refer_to = Some(refer_to);
        self.register_creator(CreatorKind::Subscription, &request, app)?;
        Ok(request)
    }

    /// REGISTER binding our contact to `aor`
    pub fn make_registration(
        &mut self,
        aor: &NameAddr,
        expires: Option<u32>,
        app: Option<Arc<dyn AppDialogSet>>,
    ) -> DumResult<Request> {
        self.check_running()?;
        if self.handlers.client_registration.is_none() {
            return Err(DumError::MissingHandler {
                role: "client registration",
                key: String::new(),
            });
        }
        let mut request = self.new_uac_request(Method::Register, aor);
        // registrar URI: the domain of the AOR
        request.uri = Uri::sip(None, aor.uri.host.clone());
        if let Some(port) = aor.uri.port {
            request.uri = request.uri.with_port(port);
        }
        // From and To both carry the AOR
        let tag = generate_tag();
        request.headers.from = Some(aor.clone().with_tag(tag));
        request.headers.expires = Some(expires.unwrap_or(self.config.default_registration_expires));
        self.register_creator(CreatorKind::Registration, &request, app)?;
        Ok(request)
    }

    /// Initial PUBLISH of a document for `event`
    pub fn make_publication(
        &mut self,
        target: &NameAddr,
        event: &str,
        content_type: MimeType,
        body: Bytes,
        expires: Option<u32>,
        app: Option<Arc<dyn AppDialogSet>>,
    ) -> DumResult<Request> {
        self.check_running()?;
        if !self.handlers.client_publication.contains_key(event) {
            return Err(DumError::MissingHandler {
                role: "client publication",
                key: event.to_string(),
            });
        }
        let mut request = self.new_uac_request(Method::Publish, target);
        request.headers.contact.clear();
        request.headers.event = Some(event_header(event, None));
        request.headers.expires = Some(expires.unwrap_or(self.config.default_publication_expires));
        request.headers.content_type = Some(content_type);
        request.body = body;
        self.register_creator(CreatorKind::Publication, &request, app)?;
        Ok(request)
    }

    /// OPTIONS, MESSAGE or any other request answered without a dialog
    pub fn make_out_of_dialog_request(
        &mut self,
        target: &NameAddr,
        method: Method,
        app: Option<Arc<dyn AppDialogSet>>,
    ) -> DumResult<Request> {
        self.check_running()?;
        if method.creates_dialog()
            || matches!(method, Method::Register | Method::Publish)
            || method.is_ack_or_cancel()
        {
            return Err(DumError::usage_use(format!("{} has its own factory", method)));
        }
        let mut request = self.new_uac_request(method, target);
        if request.method == Method::Options {
            request.headers.accept = self.config.supported_mime_types.clone();
        }
        self.register_creator(CreatorKind::OutOfDialog, &request, app)?;
        Ok(request)
    }

    /// The set's initial request again, with the next CSeq
    pub(crate) fn next_creator_request(&mut self, set_id: &DialogSetId) -> DumResult<Request> {
        let creator = self
            .dialog_sets
            .get(set_id)
            .and_then(|set| set.creator.as_ref())
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        let mut request = creator.last_request().clone();
        if let Some(cseq) = request.headers.cseq.as_mut() {
            cseq.seq += 1;
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DumConfig;
    use crate::errors::DumError;
    use crate::handlers::ClientRegistrationHandler;
    use crate::transport::ChannelTransport;
    use crate::usage::ClientRegistrationHandle;
    use sipdum_message::Response;

    struct Registrations;

    impl ClientRegistrationHandler for Registrations {
        fn on_success(
            &self,
            _dum: &mut DialogUsageManager,
            _reg: ClientRegistrationHandle,
            _response: &Response,
        ) {
        }
        fn on_failure(
            &self,
            _dum: &mut DialogUsageManager,
            _reg: ClientRegistrationHandle,
            _response: &Response,
        ) {
        }
    }

    fn manager() -> DialogUsageManager {
        let (transport, _rx) = ChannelTransport::new();
        DialogUsageManager::new(DumConfig::new("alice", "atlanta.example.com"), Arc::new(transport))
    }

    #[test]
    fn test_registration_targets_domain() {
        let mut dum = manager();
        dum.set_client_registration_handler(Arc::new(Registrations)).unwrap();
        let aor: NameAddr = "<sip:alice@atlanta.example.com>".parse().unwrap();
        let request = dum.make_registration(&aor, Some(600), None).unwrap();

        assert_eq!(request.uri.to_string(), "sip:atlanta.example.com");
        assert_eq!(request.headers.expires, Some(600));
        assert!(request.headers.from_tag().is_some());
        assert!(request.headers.to_tag().is_none());
        assert_eq!(request.headers.cseq_seq(), Some(1));
        assert_eq!(dum.dialog_set_count(), 1);
    }

    #[test]
    fn test_factories_need_handlers() {
        let mut dum = manager();
        let target: NameAddr = "<sip:bob@biloxi.example.com>".parse().unwrap();
        assert!(matches!(
            dum.make_subscription(&target, "presence", None, None),
            Err(DumError::MissingHandler { .. })
        ));
        assert!(matches!(
            dum.make_invite_session(&target, None, None),
            Err(DumError::MissingHandler { .. })
        ));
        assert_eq!(dum.dialog_set_count(), 0);
    }

    #[test]
    fn test_creator_request_bumps_cseq() {
        let mut dum = manager();
        let target: NameAddr = "<sip:bob@biloxi.example.com>".parse().unwrap();
        let request = dum.make_out_of_dialog_request(&target, Method::Options, None).unwrap();
        let set_id = DialogSetId::from_uac_request(&request).unwrap();

        let next = dum.next_creator_request(&set_id).unwrap();
        assert_eq!(next.headers.cseq_seq(), Some(2));
        assert_eq!(next.headers.call_id, request.headers.call_id);
        assert_eq!(next.headers.from_tag(), request.headers.from_tag());
    }

    #[test]
    fn test_factories_refused_after_shutdown() {
        let mut dum = manager();
        dum.shutdown();
        let target: NameAddr = "<sip:bob@biloxi.example.com>".parse().unwrap();
        assert_eq!(
            dum.make_out_of_dialog_request(&target, Method::Options, None).unwrap_err(),
            DumError::ShuttingDown
        );
    }
}
