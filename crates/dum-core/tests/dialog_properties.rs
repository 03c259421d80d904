//! Property tests for per-dialog sequencing

mod common;

use proptest::prelude::*;

use sipdum_core::dialog::DialogType;
use sipdum_core::sipdum_message::Method;
use sipdum_core::{Dialog, DumConfig};

use common::*;

fn method_strategy() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::Invite),
        Just(Method::Ack),
        Just(Method::Info),
        Just(Method::Message),
        Just(Method::Update),
        Just(Method::Notify),
        Just(Method::Refer),
    ]
}

fn uas_dialog() -> Dialog {
    let invite = incoming(Method::Invite, "prop@biloxi", "b1", None, 1);
    Dialog::new_uas(DialogType::Invitation, &invite, "alice-tag", alice()).unwrap()
}

proptest! {
    #[test]
    fn local_cseq_increases_and_ack_reuses_invite(
        methods in prop::collection::vec(method_strategy(), 1..40),
    ) {
        let config = DumConfig::new("alice", LOCAL_HOST);
        let mut dialog = uas_dialog();
        let mut last = 0u32;
        let mut last_invite = None;

        for method in methods {
            let request = dialog.make_request(method.clone(), &config);
            let seq = request.headers.cseq_seq().unwrap();
            match method {
                Method::Ack => prop_assert_eq!(seq, last_invite.unwrap_or(0)),
                _ => {
                    prop_assert!(seq > last);
                    last = seq;
                    if method == Method::Invite {
                        last_invite = Some(seq);
                    }
                }
            }
            prop_assert_eq!(request.headers.to_tag(), Some("b1"));
            prop_assert_eq!(request.headers.from_tag(), Some("alice-tag"));
        }
    }

    #[test]
    fn older_remote_cseq_is_refused(seqs in prop::collection::vec(1u32..1000, 1..40)) {
        let mut dialog = uas_dialog();
        let mut highest = 1u32;
        for (i, seq) in seqs.into_iter().enumerate() {
            let request = incoming(Method::Info, "prop@biloxi", "b1", Some("alice-tag"), seq);
            let accepted = dialog.accept_remote_cseq(&request);
            prop_assert_eq!(accepted, seq >= highest, "request {} with CSeq {}", i, seq);
            if accepted {
                highest = seq;
            }
        }
    }
}
