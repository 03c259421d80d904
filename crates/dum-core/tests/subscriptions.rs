//! Subscriber and notifier behaviour: NOTIFY racing the 2xx, refresh and
//! expiry timers, terminal NOTIFYs and REFER progress

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use sipdum_core::sipdum_message::{Method, Request, StatusCode, Token};
use sipdum_core::{
    DialogUsageManager, DumConfig, ServerSubscriptionHandle, ServerSubscriptionHandler,
    SubscriptionRetryPolicy,
};

use common::*;

fn subscriber_harness(config: DumConfig) -> (Harness, Arc<SubscriberRecorder>) {
    let mut h = Harness::with_config(config);
    let subscriber = Arc::new(SubscriberRecorder::default());
    h.dum
        .add_client_subscription_handler("presence", subscriber.clone())
        .unwrap();
    (h, subscriber)
}

fn subscribe(h: &mut Harness) -> Request {
    let request = h.dum.make_subscription(&bob(), "presence", Some(60), None).unwrap();
    h.dum.send(request).unwrap();
    h.sent_requests().remove(0)
}

fn state(value: &str) -> Token {
    value.parse().unwrap()
}

fn incoming_subscribe(call_id: &str, expires: u32) -> Request {
    let mut request = incoming(Method::Subscribe, call_id, "b1", None, 1);
    request.headers.event = Some("presence".parse().unwrap());
    request.headers.expires = Some(expires);
    request
}

#[tokio::test]
async fn test_notify_before_2xx_creates_subscription() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);

    h.deliver(notify_for(&request, "bob-1", 1, state("active;expires=60")));
    assert_eq!(h.sent_codes(), vec![200]);
    assert_eq!(subscriber.log.entries(), vec!["new", "active"]);

    // the late 2xx lands on the same dialog and usage
    let mut ok = answer(&request, StatusCode::OK, "bob-1");
    ok.headers.expires = Some(60);
    h.deliver(ok);
    assert!(h.sent().is_empty());
    assert_eq!(h.dum.usage_count(), 1);
    assert_eq!(subscriber.log.entries(), vec!["new", "active"]);
}

#[tokio::test]
async fn test_terminal_notify_ends_subscription() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);
    h.deliver(answer(&request, StatusCode::ACCEPTED, "bob-1"));
    h.deliver(notify_for(&request, "bob-1", 1, state("pending;expires=60")));
    let sub = subscriber.last_sub().unwrap();
    assert!(sub.is_valid(&h.dum));

    h.deliver(notify_for(&request, "bob-1", 2, state("terminated;reason=noresource")));
    assert_eq!(h.sent_codes(), vec![200, 200]);
    assert_eq!(subscriber.log.entries(), vec!["new", "pending", "terminated"]);
    assert!(sub.time_left(&h.dum).unwrap_err().is_stale_handle());
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_time_left_counts_down_and_refresh_fires() {
    let config = DumConfig::new("alice", LOCAL_HOST).with_refresh_jitter(0);
    let (mut h, subscriber) = subscriber_harness(config);
    let request = subscribe(&mut h);
    h.deliver(notify_for(&request, "bob-1", 1, state("active;expires=60")));
    h.sent();
    let sub = subscriber.last_sub().unwrap();
    assert_eq!(sub.time_left(&h.dum).unwrap(), 60);

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(sub.time_left(&h.dum).unwrap(), 40);
    assert_eq!(h.dum.process_timers(), 0);

    // refresh 10% early
    tokio::time::advance(Duration::from_secs(34)).await;
    assert_eq!(h.dum.process_timers(), 1);
    let refresh = h.sent_requests().remove(0);
    assert_eq!(refresh.method, Method::Subscribe);
    assert_eq!(refresh.headers.cseq_seq(), Some(2));
    assert_eq!(refresh.headers.to_tag(), Some("bob-1"));
    assert_eq!(refresh.headers.expires, Some(60));

    // never negative once the deadline has passed
    tokio::time::advance(Duration::from_secs(120)).await;
    assert_eq!(sub.time_left(&h.dum).unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failed_subscribe_retried_after_policy_delay() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);
    h.deliver(answer(&request, StatusCode::SERVER_INTERNAL_ERROR, "bob-1"));
    assert!(h.sent().is_empty());
    assert!(subscriber.log.is_empty());

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(h.dum.process_timers(), 1);
    let retry = h.sent_requests().remove(0);
    assert_eq!(retry.method, Method::Subscribe);
    assert_eq!(retry.headers.cseq_seq(), Some(2));
    assert_eq!(retry.headers.call_id, request.headers.call_id);
    assert!(retry.headers.to_tag().is_none());
}

#[tokio::test]
async fn test_failed_subscribe_terminates_without_retry_policy() {
    let config = DumConfig::new("alice", LOCAL_HOST)
        .with_subscription_retry(SubscriptionRetryPolicy::Terminate);
    let (mut h, subscriber) = subscriber_harness(config);
    let request = subscribe(&mut h);
    h.deliver(answer(&request, StatusCode::NOT_FOUND, "bob-1"));

    assert_eq!(subscriber.log.entries(), vec!["terminated"]);
    assert_eq!(h.dum.dialog_set_count(), 0);
    assert_eq!(h.dum.usage_count(), 0);
}

#[tokio::test]
async fn test_interval_too_brief_retries_with_min_expires() {
    let (mut h, _subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);
    let mut brief = answer(&request, StatusCode::INTERVAL_TOO_BRIEF, "bob-1");
    brief.headers.min_expires = Some(600);
    h.deliver(brief);

    let retry = h.sent_requests().remove(0);
    assert_eq!(retry.headers.expires, Some(600));
    assert_eq!(retry.headers.cseq_seq(), Some(2));
}

#[tokio::test]
async fn test_refer_progress_through_sipfrag() {
    let mut h = Harness::new();
    let referrer = Arc::new(SubscriberRecorder::default());
    h.dum.add_client_subscription_handler("refer", referrer.clone()).unwrap();

    let refer = h
        .dum
        .make_refer(&bob(), "<sip:carol@chicago.example.com>".parse().unwrap(), None)
        .unwrap();
    h.dum.send(refer).unwrap();
    let refer = h.sent_requests().remove(0);
    h.deliver(answer(&refer, StatusCode::ACCEPTED, "bob-1"));

    let local_tag = refer.headers.from_tag().unwrap().to_string();
    let call_id = refer.headers.call_id.clone().unwrap();
    let progress = |seq: u32, frag: &'static [u8]| {
        let mut notify = incoming(Method::Notify, &call_id, "bob-1", Some(&local_tag), seq);
        notify.headers.event = Some("refer".parse().unwrap());
        notify.headers.content_type = Some("message/sipfrag".parse().unwrap());
        notify.body = Bytes::from_static(frag);
        notify
    };

    h.deliver(progress(1, b"SIP/2.0 100 Trying\r\n"));
    h.deliver(progress(2, b"SIP/2.0 200 OK\r\n"));
    assert_eq!(h.sent_codes(), vec![200, 200]);
    assert_eq!(referrer.log.entries(), vec!["extension", "terminated"]);
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_server_subscription_notifies_and_expires() {
    let mut h = Harness::new();
    let notifier = Arc::new(NotifierRecorder::default());
    h.dum
        .add_server_subscription_handler("presence", notifier.clone())
        .unwrap();

    let mut request = incoming(Method::Subscribe, "sub-1@biloxi", "b1", None, 1);
    request.headers.event = Some("presence".parse().unwrap());
    request.headers.expires = Some(60);
    h.deliver(request);

    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    let ok = sent[0].as_response().unwrap();
    assert_eq!(ok.status, StatusCode::OK);
    assert_eq!(ok.headers.expires, Some(60));
    let notify = sent[1].as_request().unwrap();
    assert_eq!(notify.method, Method::Notify);
    let state = notify.headers.subscription_state.as_ref().unwrap();
    assert_eq!(state.value, "active");
    assert_eq!(state.param_u32("expires"), Some(60));
    assert_eq!(notify.body, Bytes::from_static(b"<presence/>"));

    tokio::time::advance(Duration::from_secs(61)).await;
    h.dum.process_timers();
    let last = h.sent_requests().remove(0);
    let state = last.headers.subscription_state.as_ref().unwrap();
    assert_eq!(state.value, "terminated");
    assert_eq!(state.param("reason"), Some("timeout"));
    assert_eq!(notifier.log.entries(), vec!["new", "expired", "terminated"]);
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test]
async fn test_server_subscription_below_minimum_gets_423() {
    let mut h = Harness::new();
    let notifier = Arc::new(NotifierRecorder {
        min_expires: Some(600),
        ..Default::default()
    });
    h.dum
        .add_server_subscription_handler("presence", notifier.clone())
        .unwrap();

    let mut request = incoming(Method::Subscribe, "brief@biloxi", "b1", None, 1);
    request.headers.event = Some("presence".parse().unwrap());
    request.headers.expires = Some(60);
    h.deliver(request);

    let responses = h.sent_responses();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, StatusCode::INTERVAL_TOO_BRIEF);
    assert_eq!(responses[0].headers.min_expires, Some(600));
    assert!(notifier.log.is_empty());
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_huge_granted_expiry_is_kept() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);

    h.deliver(notify_for(&request, "bob-1", 1, state("active;expires=4294967295")));
    assert_eq!(h.sent_codes(), vec![200]);
    assert_eq!(subscriber.log.entries(), vec!["new", "active"]);
    let sub = subscriber.last_sub().unwrap();
    assert_eq!(sub.time_left(&h.dum).unwrap(), u32::MAX);
    assert_eq!(h.dum.process_timers(), 0);
}

#[tokio::test]
async fn test_notify_without_subscription_state_gets_400() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);
    let mut ok = answer(&request, StatusCode::OK, "bob-1");
    ok.headers.expires = Some(60);
    h.deliver(ok);

    let mut notify = notify_for(&request, "bob-1", 1, state("active"));
    notify.headers.subscription_state = None;
    h.deliver(notify);
    assert_eq!(h.sent_codes(), vec![400]);
    assert_eq!(subscriber.log.entries(), vec!["terminated"]);
    assert_eq!(h.dum.usage_count(), 0);
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_refresh_answered_481_resubscribes_in_new_dialog_set() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);
    let mut ok = answer(&request, StatusCode::OK, "bob-1");
    ok.headers.expires = Some(60);
    h.deliver(ok);
    h.deliver(notify_for(&request, "bob-1", 1, state("active;expires=60")));
    h.sent();
    let sub = subscriber.last_sub().unwrap();

    sub.request_refresh(&mut h.dum, None).unwrap();
    let refresh = h.sent_requests().remove(0);
    assert_eq!(refresh.headers.to_tag(), Some("bob-1"));
    h.deliver(answer(&refresh, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST, "bob-1"));
    assert_eq!(subscriber.log.entries(), vec!["new", "active", "terminated"]);
    assert!(!sub.is_valid(&h.dum));

    assert_eq!(h.dum.process_timers(), 1);
    let fresh = h.sent_requests().remove(0);
    assert_eq!(fresh.method, Method::Subscribe);
    assert_ne!(fresh.headers.call_id, request.headers.call_id);
    assert_ne!(fresh.headers.from_tag(), request.headers.from_tag());
    assert!(fresh.headers.to_tag().is_none());
    assert_eq!(fresh.headers.cseq_seq(), Some(1));
    assert_eq!(fresh.headers.event_type(), Some("presence"));
    assert_eq!(h.dum.dialog_set_count(), 1);
}

#[tokio::test]
async fn test_request_timeout_asks_application_to_retry() {
    let mut h = Harness::new();
    let subscriber = Arc::new(SubscriberRecorder {
        retry: Some(0),
        ..Default::default()
    });
    h.dum
        .add_client_subscription_handler("presence", subscriber.clone())
        .unwrap();
    let request = subscribe(&mut h);

    h.deliver(answer(&request, StatusCode::REQUEST_TIMEOUT, "bob-1"));
    assert_eq!(subscriber.log.entries(), vec!["retry 0"]);
    let retry = h.sent_requests().remove(0);
    assert_eq!(retry.method, Method::Subscribe);
    assert_eq!(retry.headers.cseq_seq(), Some(2));
    assert_eq!(retry.headers.call_id, request.headers.call_id);
}

#[tokio::test]
async fn test_retry_after_offered_to_application() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);

    let mut unavailable = answer(&request, StatusCode::SERVICE_UNAVAILABLE, "bob-1");
    unavailable.headers.retry_after = Some(30);
    h.deliver(unavailable);

    // the recorder declines, so the policy delay is not used
    assert_eq!(subscriber.log.entries(), vec!["retry 30", "terminated"]);
    assert!(h.sent().is_empty());
    assert_eq!(h.dum.dialog_set_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_unsubscribe_gives_up() {
    let (mut h, subscriber) = subscriber_harness(DumConfig::new("alice", LOCAL_HOST));
    let request = subscribe(&mut h);
    let mut ok = answer(&request, StatusCode::OK, "bob-1");
    ok.headers.expires = Some(3600);
    h.deliver(ok);
    h.deliver(notify_for(&request, "bob-1", 1, state("active;expires=3600")));
    h.sent();
    let sub = subscriber.last_sub().unwrap();

    sub.end(&mut h.dum).unwrap();
    let unsubscribe = h.sent_requests().remove(0);
    assert_eq!(unsubscribe.headers.expires, Some(0));
    h.deliver(answer(&unsubscribe, StatusCode::OK, "bob-1"));
    assert!(sub.is_valid(&h.dum));

    // no terminating NOTIFY ever comes
    tokio::time::advance(Duration::from_secs(31)).await;
    h.dum.process_timers();
    assert_eq!(subscriber.log.entries(), vec!["new", "active"]);

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(h.dum.process_timers(), 1);
    assert_eq!(subscriber.log.entries(), vec!["new", "active", "terminated"]);
    assert!(!sub.is_valid(&h.dum));
    assert_eq!(h.dum.dialog_set_count(), 0);
    assert!(h.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_server_time_left_never_negative() {
    let mut h = Harness::new();
    let notifier = Arc::new(NotifierRecorder::default());
    h.dum
        .add_server_subscription_handler("presence", notifier.clone())
        .unwrap();
    h.deliver(incoming_subscribe("left@biloxi", 60));
    h.sent();
    let sub = *notifier.subs.lock().last().unwrap();
    assert_eq!(sub.time_left(&h.dum).unwrap(), 60);

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(sub.time_left(&h.dum).unwrap(), 40);

    // past the deadline, before the expiry timer has been processed
    tokio::time::advance(Duration::from_secs(100)).await;
    assert_eq!(sub.time_left(&h.dum).unwrap(), 0);
    assert!(sub.is_valid(&h.dum));
}

/// Rejects inside the callback, then tries to use the same handle again
#[derive(Default)]
struct RefusingNotifier {
    log: Log,
}

impl ServerSubscriptionHandler for RefusingNotifier {
    fn on_new_subscription(
        &self,
        dum: &mut DialogUsageManager,
        sub: ServerSubscriptionHandle,
        _subscribe: &Request,
    ) {
        sub.reject(dum, StatusCode::FORBIDDEN).unwrap();
        self.log.push(format!("valid after reject: {}", sub.is_valid(dum)));
        let err = sub.accept(dum, StatusCode::OK).unwrap_err();
        self.log.push(format!("stale: {}", err.is_stale_handle()));
    }

    fn on_terminated(&self, _dum: &mut DialogUsageManager, _sub: ServerSubscriptionHandle) {
        self.log.push("terminated");
    }
}

#[tokio::test]
async fn test_handle_goes_stale_inside_its_own_callback() {
    let mut h = Harness::new();
    let notifier = Arc::new(RefusingNotifier::default());
    h.dum
        .add_server_subscription_handler("presence", notifier.clone())
        .unwrap();
    h.deliver(incoming_subscribe("refused@biloxi", 60));

    assert_eq!(h.sent_codes(), vec![403]);
    assert_eq!(
        notifier.log.entries(),
        vec!["terminated", "valid after reject: false", "stale: true"]
    );
    assert_eq!(h.dum.usage_count(), 0);
    assert_eq!(h.dum.dialog_set_count(), 0);
}
