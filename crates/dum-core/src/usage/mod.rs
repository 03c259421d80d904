//! Usages: the per-conversation state machines riding on dialogs
//!
//! | Usage | Lives in | Created by |
//! |-------|----------|------------|
//! | [`InviteSession`] | dialog | INVITE sent or received |
//! | [`ClientSubscription`] | dialog | 2xx or NOTIFY for our SUBSCRIBE/REFER |
//! | [`ServerSubscription`] | dialog | SUBSCRIBE or REFER received |
//! | [`ClientRegistration`] | dialog set | final response to our REGISTER |
//! | [`ServerRegistration`] | dialog set | REGISTER received |
//! | [`ClientPublication`] | dialog set | final response to our PUBLISH |
//! | [`ServerPublication`] | dialog set | PUBLISH received |
//! | [`ClientOutOfDialogReq`] | dialog set | final response to our request |
//! | [`ServerOutOfDialogReq`] | dialog set | OPTIONS, MESSAGE, ... received |
//!
//! Usage data is stored in the manager's [`UsageRegistry`]; dialogs and
//! dialog sets only keep handles. Each file pairs the usage type with its
//! handle operations and the manager's dispatch logic for it.

pub mod client_subscription;
pub mod handle;
pub mod invite_session;
pub mod out_of_dialog;
pub mod publication;
pub mod registration;
pub mod server_subscription;
pub mod subscription_state;

pub use client_subscription::{ClientSubscription, ClientSubscriptionState};
pub use handle::{Handle, UsageId, UsageKind, UsageRegistry};
pub use invite_session::{InviteEndReason, InviteRole, InviteSession, InviteSessionState};
pub use out_of_dialog::{ClientOutOfDialogReq, ServerOutOfDialogReq};
pub use publication::{ClientPublication, ServerPublication};
pub use registration::{ClientRegistration, ServerRegistration};
pub use server_subscription::{ServerSubscription, ServerSubscriptionState};
pub use subscription_state::{FailureDisposition, SubscriptionStatus, TerminateReason};

use crate::dialog::{DialogId, DialogSetId};

pub type InviteSessionHandle = Handle<InviteSession>;
pub type ClientSubscriptionHandle = Handle<ClientSubscription>;
pub type ServerSubscriptionHandle = Handle<ServerSubscription>;
pub type ClientRegistrationHandle = Handle<ClientRegistration>;
pub type ServerRegistrationHandle = Handle<ServerRegistration>;
pub type ClientPublicationHandle = Handle<ClientPublication>;
pub type ServerPublicationHandle = Handle<ServerPublication>;
pub type ClientOutOfDialogHandle = Handle<ClientOutOfDialogReq>;
pub type ServerOutOfDialogHandle = Handle<ServerOutOfDialogReq>;

/// Any usage stored in the registry
#[derive(Debug)]
pub enum Usage {
    InviteSession(InviteSession),
    ClientSubscription(ClientSubscription),
    ServerSubscription(ServerSubscription),
    ClientRegistration(ClientRegistration),
    ServerRegistration(ServerRegistration),
    ClientPublication(ClientPublication),
    ServerPublication(ServerPublication),
    ClientOutOfDialog(ClientOutOfDialogReq),
    ServerOutOfDialog(ServerOutOfDialogReq),
}

/// Where a usage is attached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UsageLocation {
    Dialog(DialogId),
    DialogSet(DialogSetId),
}

impl Usage {
    pub fn location(&self) -> UsageLocation {
        match self {
            Usage::InviteSession(u) => UsageLocation::Dialog(u.dialog_id.clone()),
            Usage::ClientSubscription(u) => UsageLocation::Dialog(u.dialog_id.clone()),
            Usage::ServerSubscription(u) => UsageLocation::Dialog(u.dialog_id.clone()),
            Usage::ClientRegistration(u) => UsageLocation::DialogSet(u.set_id.clone()),
            Usage::ServerRegistration(u) => UsageLocation::DialogSet(u.set_id.clone()),
            Usage::ClientPublication(u) => UsageLocation::DialogSet(u.set_id.clone()),
            Usage::ServerPublication(u) => UsageLocation::DialogSet(u.set_id.clone()),
            Usage::ClientOutOfDialog(u) => UsageLocation::DialogSet(u.set_id.clone()),
            Usage::ServerOutOfDialog(u) => UsageLocation::DialogSet(u.set_id.clone()),
        }
    }

    /// Current timer sequence, or `None` for usages without timers
    pub fn timer_seq(&self) -> Option<u64> {
        match self {
            Usage::ClientSubscription(u) => Some(u.timer_seq),
            Usage::ServerSubscription(u) => Some(u.timer_seq),
            Usage::ClientRegistration(u) => Some(u.timer_seq),
            Usage::ClientPublication(u) => Some(u.timer_seq),
            Usage::ServerPublication(u) => Some(u.timer_seq),
            _ => None,
        }
    }

    /// Invalidate outstanding timers and return the new sequence
    pub fn bump_timer_seq(&mut self) -> Option<u64> {
        let seq = match self {
            Usage::ClientSubscription(u) => &mut u.timer_seq,
            Usage::ServerSubscription(u) => &mut u.timer_seq,
            Usage::ClientRegistration(u) => &mut u.timer_seq,
            Usage::ClientPublication(u) => &mut u.timer_seq,
            Usage::ServerPublication(u) => &mut u.timer_seq,
            _ => return None,
        };
        *seq += 1;
        Some(*seq)
    }
}

macro_rules! usage_kind {
    ($ty:ident, $variant:ident, $name:expr) => {
        impl UsageKind for $ty {
            const NAME: &'static str = $name;

            fn from_usage(usage: &Usage) -> Option<&Self> {
                match usage {
                    Usage::$variant(u) => Some(u),
                    _ => None,
                }
            }

            fn from_usage_mut(usage: &mut Usage) -> Option<&mut Self> {
                match usage {
                    Usage::$variant(u) => Some(u),
                    _ => None,
                }
            }

            fn into_usage(self) -> Usage {
                Usage::$variant(self)
            }
        }
    };
}

usage_kind!(InviteSession, InviteSession, "InviteSession");
usage_kind!(ClientSubscription, ClientSubscription, "ClientSubscription");
usage_kind!(ServerSubscription, ServerSubscription, "ServerSubscription");
usage_kind!(ClientRegistration, ClientRegistration, "ClientRegistration");
usage_kind!(ServerRegistration, ServerRegistration, "ServerRegistration");
usage_kind!(ClientPublication, ClientPublication, "ClientPublication");
usage_kind!(ServerPublication, ServerPublication, "ServerPublication");
usage_kind!(ClientOutOfDialogReq, ClientOutOfDialog, "ClientOutOfDialog");
usage_kind!(ServerOutOfDialogReq, ServerOutOfDialog, "ServerOutOfDialog");
