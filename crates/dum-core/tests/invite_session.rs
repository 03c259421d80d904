//! Invite sessions, both roles: CSeq handling across credentialed retries,
//! route sets, forking, CANCEL and teardown

mod common;

use std::sync::Arc;

use bytes::Bytes;

use sipdum_core::sipdum_message::{Method, NameAddr, Request, Response, StatusCode};
use sipdum_core::usage::InviteSessionState;
use sipdum_core::ClientAuthManager;

use common::*;

/// Answers every challenge once with a fixed credential
struct StaticCredentials;

impl ClientAuthManager for StaticCredentials {
    fn handle_challenge(&self, request: &mut Request, _challenge: &Response) -> bool {
        if !request.headers.authorization.is_empty() {
            return false;
        }
        let credentials =
            "Digest username=\"alice\", realm=\"atlanta.example.com\", response=\"x\"";
        request.headers.authorization.push(credentials.into());
        true
    }
}

fn sdp() -> Option<Bytes> {
    Some(Bytes::from_static(b"v=0\r\no=alice 1 1 IN IP4 192.0.2.1\r\n"))
}

/// Send an INVITE to bob; returns the request as it left
fn send_invite(h: &mut Harness) -> Request {
    let invite = h.dum.make_invite_session(&bob(), sdp(), None).unwrap();
    h.dum.send(invite).unwrap();
    let mut sent = h.sent_requests();
    assert_eq!(sent.len(), 1);
    sent.remove(0)
}

#[tokio::test]
async fn test_ack_follows_invite_cseq_after_auth_retry() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::default());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();
    h.dum.set_client_auth_manager(Arc::new(StaticCredentials)).unwrap();

    let invite = send_invite(&mut h);
    assert_eq!(invite.headers.cseq_seq(), Some(1));

    let mut challenge = answer(&invite, StatusCode::PROXY_AUTHENTICATION_REQUIRED, "proxy");
    challenge.headers.proxy_authenticate =
        vec!["Digest realm=\"atlanta.example.com\", nonce=\"n\"".into()];
    h.deliver(challenge);

    let mut sent = h.sent_requests();
    assert_eq!(sent.len(), 1);
    let retry = sent.remove(0);
    assert_eq!(retry.method, Method::Invite);
    assert_eq!(retry.headers.cseq_seq(), Some(2));
    assert_eq!(retry.headers.call_id, invite.headers.call_id);
    assert_eq!(retry.headers.from_tag(), invite.headers.from_tag());
    assert_ne!(retry.headers.branch(), invite.headers.branch());
    assert_eq!(retry.headers.authorization.len(), 1);
    assert!(invites.log.is_empty());

    h.deliver(answer(&retry, StatusCode::OK, "bob-1"));
    let sent = h.sent_requests();
    assert_eq!(sent.len(), 1);
    let ack = &sent[0];
    assert_eq!(ack.method, Method::Ack);
    assert_eq!(ack.headers.cseq_seq(), Some(2));
    assert_eq!(ack.headers.to_tag(), Some("bob-1"));
    assert_eq!(ack.uri.to_string(), "sip:bob@192.0.2.4");
    assert_eq!(invites.log.entries(), vec!["new_client", "connected"]);

    // next request in the dialog continues from the retried INVITE
    let session = invites.last_session().unwrap();
    assert_eq!(session.state(&h.dum).unwrap(), InviteSessionState::Connected);
    session.end(&mut h.dum).unwrap();
    let bye = h.sent_requests().remove(0);
    assert_eq!(bye.method, Method::Bye);
    assert_eq!(bye.headers.cseq_seq(), Some(3));
    assert!(!session.is_valid(&h.dum));
}

#[tokio::test]
async fn test_uac_route_set_is_reversed_record_route() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::default());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();

    let invite = send_invite(&mut h);
    let mut ok = answer(&invite, StatusCode::OK, "bob-1");
    ok.headers.record_route = vec![
        "<sip:p2.biloxi.example.com;lr>".parse().unwrap(),
        "<sip:p1.atlanta.example.com;lr>".parse().unwrap(),
    ];
    h.deliver(ok);

    let ack = h.sent_requests().remove(0);
    let hosts: Vec<&str> = ack.headers.route.iter().map(|r| r.uri.host.as_str()).collect();
    assert_eq!(hosts, vec!["p1.atlanta.example.com", "p2.biloxi.example.com"]);

    let session = invites.last_session().unwrap();
    session.end(&mut h.dum).unwrap();
    let bye = h.sent_requests().remove(0);
    assert_eq!(bye.headers.route, ack.headers.route);
}

#[tokio::test]
async fn test_forked_early_dialogs_lose_to_first_2xx() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::default());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();

    let invite = send_invite(&mut h);
    h.deliver(answer(&invite, StatusCode::RINGING, "fork-a"));
    h.deliver(answer(&invite, StatusCode::RINGING, "fork-b"));
    h.deliver(answer(&invite, StatusCode::OK, "fork-b"));

    assert_eq!(
        invites.log.entries(),
        vec![
            "new_client",
            "provisional 180",
            "new_client",
            "provisional 180",
            "terminated Forked",
            "connected"
        ]
    );
    let ack = h.sent_requests().remove(0);
    assert_eq!(ack.headers.to_tag(), Some("fork-b"));

    // a late 2xx from the other branch is acknowledged and hung up
    h.deliver(answer(&invite, StatusCode::OK, "fork-a"));
    let sent = h.sent_requests();
    let methods: Vec<&Method> = sent.iter().map(|r| &r.method).collect();
    assert_eq!(methods, vec![&Method::Ack, &Method::Bye]);
    assert!(sent.iter().all(|r| r.headers.to_tag() == Some("fork-a")));
    assert_eq!(h.dum.dialog_set_count(), 1);
}

#[tokio::test]
async fn test_failure_before_dialog_reports_and_cleans_up() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::default());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();

    let invite = send_invite(&mut h);
    h.deliver(answer(&invite, StatusCode::TRYING, ""));
    h.deliver(answer(&invite, StatusCode::BUSY_HERE, "bob-1"));

    assert_eq!(invites.log.entries(), vec!["failure 486"]);
    assert_eq!(h.dum.dialog_set_count(), 0);
    assert_eq!(h.dum.usage_count(), 0);
}

#[tokio::test]
async fn test_end_before_provisional_cancels_on_first_1xx() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::default());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();

    let invite = send_invite(&mut h);
    let set_id = sipdum_core::DialogSetId::from_uac_request(&invite).unwrap();
    h.dum.end_dialog_set(&set_id).unwrap();
    assert!(h.sent().is_empty());
    assert_eq!(h.dum.dialog_set_count(), 1);

    h.deliver(answer(&invite, StatusCode::RINGING, "bob-1"));
    let cancel = h.sent_requests().remove(0);
    assert_eq!(cancel.method, Method::Cancel);
    assert_eq!(cancel.headers.cseq_seq(), Some(1));
    assert_eq!(cancel.headers.branch(), invite.headers.branch());
    assert!(cancel.headers.to_tag().is_none());

    h.deliver(answer(&cancel, StatusCode::OK, "bob-1"));
    h.deliver(answer(&invite, StatusCode::REQUEST_TERMINATED, "bob-1"));
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test]
async fn test_uas_session_accept_ack_and_remote_bye() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::accepting());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();

    let mut invite = incoming(Method::Invite, "uas-1@biloxi", "b1", None, 1);
    invite.headers.record_route = vec!["<sip:p1.biloxi.example.com;lr>".parse().unwrap()];
    h.deliver(invite);

    let ok = h.sent_responses().remove(0);
    assert_eq!(ok.status, StatusCode::OK);
    let local_tag = ok.headers.to_tag().unwrap().to_string();
    assert_eq!(ok.headers.contact.len(), 1);
    assert!(!ok.body.is_empty());

    h.deliver(incoming(Method::Ack, "uas-1@biloxi", "b1", Some(&local_tag), 1));
    assert_eq!(invites.log.entries(), vec!["new_server", "connected"]);

    // a request of ours keeps the route set in received order
    let session = invites.last_session().unwrap();
    session
        .info(&mut h.dum, "text/plain".parse().unwrap(), Bytes::from_static(b"hello"))
        .unwrap();
    let info = h.sent_requests().remove(0);
    assert_eq!(info.headers.route[0].uri.host, "p1.biloxi.example.com");
    assert_eq!(info.uri.to_string(), "sip:bob@192.0.2.4");
    assert_eq!(info.headers.cseq_seq(), Some(1));

    h.deliver(incoming(Method::Bye, "uas-1@biloxi", "b1", Some(&local_tag), 2));
    assert_eq!(h.sent_codes(), vec![200]);
    assert!(invites.log.contains("terminated RemoteBye"));
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test]
async fn test_cancel_of_pending_invite() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::default());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();

    h.deliver(incoming(Method::Invite, "cancel-1@biloxi", "b1", None, 1));
    let session = invites.last_session().unwrap();
    session.provisional(&mut h.dum, StatusCode::RINGING).unwrap();

    h.deliver(incoming(Method::Cancel, "cancel-1@biloxi", "b1", None, 1));
    assert_eq!(h.sent_codes(), vec![180, 200, 487]);
    assert!(invites.log.contains("terminated Cancelled"));
    assert!(!session.is_valid(&h.dum));
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test]
async fn test_handle_misuse_is_reported() {
    let mut h = Harness::new();
    let invites = Arc::new(InviteRecorder::default());
    h.dum.set_invite_session_handler(invites.clone()).unwrap();

    h.deliver(incoming(Method::Invite, "misuse@biloxi", "b1", None, 1));
    let session = invites.last_session().unwrap();
    assert!(session.provisional(&mut h.dum, StatusCode::OK).is_err());
    assert!(session.reject(&mut h.dum, StatusCode::OK).is_err());
    let target: NameAddr = "<sip:carol@chicago.example.com>".parse().unwrap();
    assert!(session.refer(&mut h.dum, target).is_err());

    session.reject(&mut h.dum, StatusCode::BUSY_HERE).unwrap();
    assert_eq!(h.sent_codes(), vec![486]);
    assert!(session.reject(&mut h.dum, StatusCode::BUSY_HERE).unwrap_err().is_stale_handle());
}
