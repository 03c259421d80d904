mod common;

use std::sync::Arc;

use sipdum_core::sipdum_message::{Message, Method, Request, StatusCode};
use sipdum_core::{
    DialogUsageManager, DumError, ServerSubscriptionHandle, ServerSubscriptionHandler,
    ShutdownState,
};

use common::*;

#[tokio::test]
async fn test_shutdown_with_nothing_open_completes_at_once() {
    let mut h = Harness::new();
    let done = Arc::new(ShutdownRecorder::default());
    h.dum.set_shutdown_handler(done.clone()).unwrap();

    assert_eq!(h.dum.shutdown(), ShutdownState::Shutdown);
    h.sent();
    assert!(h.transport_stopped);
    assert_eq!(done.log.entries(), vec!["can_be_deleted"]);

    // idempotent, and the handler fires once
    assert_eq!(h.dum.shutdown(), ShutdownState::Shutdown);
    assert_eq!(done.log.entries(), vec!["can_be_deleted"]);
}

#[tokio::test]
async fn test_shutdown_waits_for_unregister() {
    init_tracing();
    let mut h = Harness::new();
    let done = Arc::new(ShutdownRecorder::default());
    let invites = Arc::new(InviteRecorder::accepting());
    let registrations = Arc::new(RegistrationRecorder::default());
    h.dum.set_shutdown_handler(done.clone()).unwrap();
    h.dum.set_invite_session_handler(invites.clone()).unwrap();
    h.dum.set_client_registration_handler(registrations.clone()).unwrap();

    // a connected call
    h.deliver(incoming(Method::Invite, "call@biloxi", "b1", None, 1));
    let local_tag = h.sent_responses()[0].headers.to_tag().unwrap().to_string();
    h.deliver(incoming(Method::Ack, "call@biloxi", "b1", Some(&local_tag), 1));

    // an active registration
    let register = h.dum.make_registration(&alice(), Some(600), None).unwrap();
    h.dum.send(register).unwrap();
    let register = h.sent_requests().remove(0);
    h.deliver(answer(&register, StatusCode::OK, "registrar"));
    assert_eq!(h.dum.dialog_set_count(), 2);

    assert_eq!(h.dum.shutdown(), ShutdownState::ShutdownRequested);
    let sent = h.sent_requests();
    let bye = sent.iter().find(|r| r.method == Method::Bye).unwrap();
    assert_eq!(bye.headers.to_tag(), Some("b1"));
    let unregister = sent.iter().find(|r| r.method == Method::Register).unwrap().clone();
    assert_eq!(unregister.headers.expires, Some(0));
    assert!(invites.log.contains("terminated LocalBye"));
    assert!(!h.transport_stopped);
    assert!(done.log.is_empty());

    // no new work while shutting down
    let refused = h.dum.make_invite_session(&bob(), None, None).unwrap_err();
    assert!(matches!(refused, DumError::ShuttingDown));

    h.deliver(answer(&unregister, StatusCode::OK, "registrar"));
    assert_eq!(registrations.log.entries(), vec!["success", "removed"]);
    assert_eq!(h.dum.shutdown_state(), ShutdownState::Shutdown);
    h.sent();
    assert!(h.transport_stopped);
    assert_eq!(done.log.entries(), vec!["can_be_deleted"]);
}

/// Leaves every SUBSCRIBE unanswered
#[derive(Default)]
struct UndecidedNotifier {
    log: Log,
}

impl ServerSubscriptionHandler for UndecidedNotifier {
    fn on_new_subscription(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ServerSubscriptionHandle,
        _subscribe: &Request,
    ) {
        self.log.push("new");
    }

    fn on_terminated(&self, _dum: &mut DialogUsageManager, _sub: ServerSubscriptionHandle) {
        self.log.push("terminated");
    }
}

#[tokio::test]
async fn test_shutdown_refuses_unanswered_subscribe() {
    let mut h = Harness::new();
    let notifier = Arc::new(UndecidedNotifier::default());
    h.dum.add_server_subscription_handler("presence", notifier.clone()).unwrap();

    let mut request = incoming(Method::Subscribe, "undecided@biloxi", "b1", None, 1);
    request.headers.event = Some("presence".parse().unwrap());
    request.headers.expires = Some(60);
    h.deliver(request);
    assert!(h.sent().is_empty());
    assert_eq!(h.dum.dialog_set_count(), 1);

    assert_eq!(h.dum.shutdown(), ShutdownState::Shutdown);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Message::Response(response) => {
            assert_eq!(response.status, StatusCode::TEMPORARILY_UNAVAILABLE)
        }
        Message::Request(request) => {
            panic!("unexpected {} before the SUBSCRIBE was answered", request.method)
        }
    }
    assert_eq!(notifier.log.entries(), vec!["new", "terminated"]);
    assert_eq!(h.dum.dialog_set_count(), 0);
    assert!(h.transport_stopped);
}
