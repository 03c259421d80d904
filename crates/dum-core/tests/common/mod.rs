//! Shared fixtures for the manager integration tests
//!
//! The local user agent is alice@atlanta.example.com; the peer is
//! bob@biloxi.example.com. Messages "from the network" are built by hand and
//! fed to [`DialogUsageManager::process`]; everything the manager sends is
//! read back from the [`ChannelTransport`] receiver.

#![allow(dead_code)]

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

use sipdum_core::sipdum_message::{
    CSeq, Message, Method, NameAddr, Request, Response, StatusCode, Token, Via,
};
use sipdum_core::usage::InviteEndReason;
use sipdum_core::{
    ChannelTransport, ClientPublicationHandle, ClientPublicationHandler, ClientRegistrationHandle,
    ClientRegistrationHandler, ClientSubscriptionHandle, ClientSubscriptionHandler, DialogSetId,
    DialogUsageManager, DumConfig, DumEvent, DumShutdownHandler, InviteSessionHandle,
    InviteSessionHandler, ServerSubscriptionHandle, ServerSubscriptionHandler, TransportCommand,
};

pub const LOCAL_HOST: &str = "atlanta.example.com";
pub const PEER_CONTACT: &str = "<sip:bob@192.0.2.4>";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn bob() -> NameAddr {
    "<sip:bob@biloxi.example.com>".parse().unwrap()
}

pub fn alice() -> NameAddr {
    "<sip:alice@atlanta.example.com>".parse().unwrap()
}

/// A manager wired to a channel transport
pub struct Harness {
    pub dum: DialogUsageManager,
    wire: UnboundedReceiver<TransportCommand>,
    pub transport_stopped: bool,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(DumConfig::new("alice", LOCAL_HOST))
    }

    pub fn with_config(config: DumConfig) -> Self {
        init_tracing();
        let (transport, wire) = ChannelTransport::new();
        Self {
            dum: DialogUsageManager::new(config, Arc::new(transport)),
            wire,
            transport_stopped: false,
        }
    }

    pub fn deliver(&mut self, message: impl Into<Message>) {
        self.dum.process(DumEvent::Incoming(message.into()));
    }

    /// Everything sent since the last call
    pub fn sent(&mut self) -> Vec<Message> {
        let mut sent = Vec::new();
        while let Ok(command) = self.wire.try_recv() {
            match command {
                TransportCommand::Send(message) | TransportCommand::SendTo(message, _) => {
                    sent.push(message)
                }
                TransportCommand::Shutdown => self.transport_stopped = true,
            }
        }
        sent
    }

    pub fn sent_requests(&mut self) -> Vec<Request> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r),
                Message::Response(_) => None,
            })
            .collect()
    }

    pub fn sent_responses(&mut self) -> Vec<Response> {
        self.sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::Response(r) => Some(r),
                Message::Request(_) => None,
            })
            .collect()
    }

    /// Status codes of the responses sent since the last call
    pub fn sent_codes(&mut self) -> Vec<u16> {
        self.sent_responses().iter().map(|r| r.status.as_u16()).collect()
    }
}

/// A request from bob to alice
pub fn incoming(
    method: Method,
    call_id: &str,
    from_tag: &str,
    to_tag: Option<&str>,
    seq: u32,
) -> Request {
    let mut request =
        Request::new(method.clone(), "sip:alice@atlanta.example.com".parse().unwrap());
    let h = &mut request.headers;
    h.via = vec![Via::new("UDP", "pc33.biloxi.example.com", None)
        .with_branch(format!("z9hG4bK-{}-{}-{}", call_id, seq, method))];
    h.from = Some(bob().with_tag(from_tag));
    let mut to = alice();
    if let Some(tag) = to_tag {
        to.set_tag(tag);
    }
    h.to = Some(to);
    h.call_id = Some(call_id.to_string());
    h.cseq = Some(CSeq::new(seq, method));
    h.max_forwards = Some(70);
    h.contact = vec![PEER_CONTACT.parse().unwrap()];
    request
}

/// A request from bob inside the dialog a request of ours created
pub fn in_dialog_from_peer(ours: &Request, method: Method, seq: u32) -> Request {
    let local_tag = ours.headers.from_tag().unwrap().to_string();
    let remote_tag = ours.headers.to_tag().unwrap().to_string();
    incoming(method, ours.headers.call_id.as_deref().unwrap(), &remote_tag, Some(&local_tag), seq)
}

/// The peer's answer to a request we sent
pub fn answer(request: &Request, code: StatusCode, to_tag: &str) -> Response {
    let mut response = Response::from_request(request, code);
    if let Some(to) = response.headers.to.as_mut() {
        if to.tag().is_none() && code != StatusCode::TRYING {
            to.set_tag(to_tag);
        }
    }
    if code.is_success() || (code.is_provisional() && code != StatusCode::TRYING) {
        response.headers.contact = vec![PEER_CONTACT.parse().unwrap()];
    }
    response
}

/// A NOTIFY from bob for a SUBSCRIBE we sent, in the dialog tagged `remote_tag`
pub fn notify_for(subscribe: &Request, remote_tag: &str, seq: u32, state: Token) -> Request {
    let local_tag = subscribe.headers.from_tag().unwrap().to_string();
    let mut notify = incoming(
        Method::Notify,
        subscribe.headers.call_id.as_deref().unwrap(),
        remote_tag,
        Some(&local_tag),
        seq,
    );
    notify.headers.event = subscribe.headers.event.clone();
    notify.headers.subscription_state = Some(state);
    notify.headers.content_type = Some("application/pidf+xml".parse().unwrap());
    notify.body = Bytes::from_static(b"<presence/>");
    notify
}

/// Ordered log of callbacks
#[derive(Default)]
pub struct Log(Mutex<Vec<String>>);

impl Log {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.0.lock().iter().any(|e| e == entry)
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_empty()
    }
}

/// Invite handler recording callbacks; answers new sessions when `accept` is set
#[derive(Default)]
pub struct InviteRecorder {
    pub log: Log,
    pub accept: bool,
    pub sessions: Mutex<Vec<InviteSessionHandle>>,
}

impl InviteRecorder {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            ..Default::default()
        }
    }

    pub fn last_session(&self) -> Option<InviteSessionHandle> {
        self.sessions.lock().last().copied()
    }
}

impl InviteSessionHandler for InviteRecorder {
    fn on_new_server_session(
        &self,
        dum: &mut DialogUsageManager,
        session: InviteSessionHandle,
        _invite: &Request,
    ) {
        self.log.push("new_server");
        self.sessions.lock().push(session);
        if self.accept {
            session.accept(dum, Some(Bytes::from_static(b"v=0\r\n"))).unwrap();
        }
    }

    fn on_new_client_session(
        &self,
        _dum: &mut DialogUsageManager,
        session: InviteSessionHandle,
        _response: &Response,
    ) {
        self.log.push("new_client");
        self.sessions.lock().push(session);
    }

    fn on_provisional(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        response: &Response,
    ) {
        self.log.push(format!("provisional {}", response.status.as_u16()));
    }

    fn on_connected(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _msg: &Message,
    ) {
        self.log.push("connected");
    }

    fn on_failure(&self, _dum: &mut DialogUsageManager, _set: &DialogSetId, response: &Response) {
        self.log.push(format!("failure {}", response.status.as_u16()));
    }

    fn on_terminated(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        reason: InviteEndReason,
        _msg: Option<&Message>,
    ) {
        self.log.push(format!("terminated {:?}", reason));
    }
}

/// Subscriber recording callbacks; `retry` answers `on_request_retry`
#[derive(Default)]
pub struct SubscriberRecorder {
    pub log: Log,
    pub retry: Option<u32>,
    pub subs: Mutex<Vec<ClientSubscriptionHandle>>,
}

impl SubscriberRecorder {
    pub fn last_sub(&self) -> Option<ClientSubscriptionHandle> {
        self.subs.lock().last().copied()
    }
}

impl ClientSubscriptionHandler for SubscriberRecorder {
    fn on_new_subscription(
        &self,
        _dum: &mut DialogUsageManager,
        sub: ClientSubscriptionHandle,
        _notify: &Request,
    ) {
        self.log.push("new");
        self.subs.lock().push(sub);
    }

    fn on_update_active(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _notify: &Request,
    ) {
        self.log.push("active");
    }

    fn on_update_pending(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _notify: &Request,
    ) {
        self.log.push("pending");
    }

    fn on_update_extension(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _notify: &Request,
    ) {
        self.log.push("extension");
    }

    fn on_terminated(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _msg: Option<&Message>,
    ) {
        self.log.push("terminated");
    }

    fn on_request_retry(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        retry_after: u32,
        _msg: &Message,
    ) -> Option<u32> {
        self.log.push(format!("retry {}", retry_after));
        self.retry
    }
}

/// Notifier accepting every SUBSCRIBE and sending a first NOTIFY
#[derive(Default)]
pub struct NotifierRecorder {
    pub log: Log,
    pub min_expires: Option<u32>,
    pub subs: Mutex<Vec<ServerSubscriptionHandle>>,
}

impl ServerSubscriptionHandler for NotifierRecorder {
    fn on_new_subscription(
        &self,
        dum: &mut DialogUsageManager,
        sub: ServerSubscriptionHandle,
        _subscribe: &Request,
    ) {
        self.log.push("new");
        self.subs.lock().push(sub);
        sub.accept(dum, StatusCode::OK).unwrap();
        sub.update(dum, "application/pidf+xml".parse().unwrap(), Bytes::from_static(b"<presence/>"))
            .unwrap();
    }

    fn on_terminated(&self, _dum: &mut DialogUsageManager, _sub: ServerSubscriptionHandle) {
        self.log.push("terminated");
    }

    fn on_expired(&self, _dum: &mut DialogUsageManager, _sub: ServerSubscriptionHandle) {
        self.log.push("expired");
    }

    fn min_expires(&self) -> Option<u32> {
        self.min_expires
    }
}

#[derive(Default)]
pub struct RegistrationRecorder {
    pub log: Log,
    pub regs: Mutex<Vec<ClientRegistrationHandle>>,
}

impl ClientRegistrationHandler for RegistrationRecorder {
    fn on_success(
        &self,
        _dum: &mut DialogUsageManager,
        reg: ClientRegistrationHandle,
        _response: &Response,
    ) {
        self.log.push("success");
        self.regs.lock().push(reg);
    }

    fn on_removed(
        &self,
        _dum: &mut DialogUsageManager,
        _reg: ClientRegistrationHandle,
        _response: &Response,
    ) {
        self.log.push("removed");
    }

    fn on_failure(
        &self,
        _dum: &mut DialogUsageManager,
        _reg: ClientRegistrationHandle,
        response: &Response,
    ) {
        self.log.push(format!("failure {}", response.status.as_u16()));
    }
}

#[derive(Default)]
pub struct PublicationRecorder {
    pub log: Log,
    pub pubs: Mutex<Vec<ClientPublicationHandle>>,
}

impl ClientPublicationHandler for PublicationRecorder {
    fn on_success(
        &self,
        _dum: &mut DialogUsageManager,
        publication: ClientPublicationHandle,
        _response: &Response,
    ) {
        self.log.push("success");
        self.pubs.lock().push(publication);
    }

    fn on_removed(
        &self,
        _dum: &mut DialogUsageManager,
        _publication: ClientPublicationHandle,
        _response: &Response,
    ) {
        self.log.push("removed");
    }

    fn on_failure(
        &self,
        _dum: &mut DialogUsageManager,
        _publication: ClientPublicationHandle,
        response: &Response,
    ) {
        self.log.push(format!("failure {}", response.status.as_u16()));
    }
}

#[derive(Default)]
pub struct ShutdownRecorder {
    pub log: Log,
}

impl DumShutdownHandler for ShutdownRecorder {
    fn on_dum_can_be_deleted(&self) {
        self.log.push("can_be_deleted");
    }
}
