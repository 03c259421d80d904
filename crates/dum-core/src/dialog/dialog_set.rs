//! Dialog sets
//!
//! A [`DialogSet`] groups the dialogs that can result from one initial
//! request. A forked INVITE or SUBSCRIBE may produce several dialogs with
//! distinct remote tags; on the UAS side a set always holds exactly one.
//! Usages that never form a dialog (registration, publication, out-of-dialog
//! requests) hang directly off the set.
//!
//! ## Client INVITE set states
//!
//! ```text
//! Initial ──1xx──▶ ReceivedProvisional ──2xx──▶ Established
//!    │                     │
//!  end()                 end()
//!    ▼                     ▼
//! WaitingToEnd ──1xx──▶ Cancelling ──final──▶ (set dies)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::creator::Creator;
use super::dialog_id::{DialogId, DialogSetId};
use super::dialog_impl::Dialog;
use crate::handlers::AppDialogSet;
use crate::usage::UsageId;

/// Progress of the exchange started by the set's initial request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogSetState {
    /// Initial request built or sent, nothing received
    Initial,
    /// A provisional response arrived
    ReceivedProvisional,
    /// A dialog was confirmed
    Established,
    /// `end()` was called before anything arrived; CANCEL is owed on the first 1xx
    WaitingToEnd,
    /// CANCEL sent
    Cancelling,
    /// Ending
    Terminating,
}

/// A set of dialogs sharing Call-ID and local tag
pub struct DialogSet {
    pub id: DialogSetId,
    pub state: DialogSetState,
    /// `None` for sets created by an inbound request
    pub creator: Option<Creator>,
    pub dialogs: BTreeMap<DialogId, Dialog>,
    /// Registration, publication or out-of-dialog usage of this set
    pub dialogless: Option<UsageId>,
    pub app_dialog_set: Option<Arc<dyn AppDialogSet>>,
    /// The initial request is on the wire without a final response
    pub awaiting_final: bool,
    /// (Call-ID, From tag) of the initial request of a UAS set, for CANCEL lookup
    pub(crate) uas_key: Option<(String, String)>,
}

impl DialogSet {
    pub fn new_uac(
        id: DialogSetId,
        creator: Creator,
        app_dialog_set: Option<Arc<dyn AppDialogSet>>,
    ) -> Self {
        Self {
            id,
            state: DialogSetState::Initial,
            creator: Some(creator),
            dialogs: BTreeMap::new(),
            dialogless: None,
            app_dialog_set,
            awaiting_final: false,
            uas_key: None,
        }
    }

    pub fn new_uas(
        id: DialogSetId,
        uas_key: (String, String),
        app_dialog_set: Option<Arc<dyn AppDialogSet>>,
    ) -> Self {
        Self {
            id,
            state: DialogSetState::Initial,
            creator: None,
            dialogs: BTreeMap::new(),
            dialogless: None,
            app_dialog_set,
            awaiting_final: false,
            uas_key: Some(uas_key),
        }
    }

    pub fn is_uac(&self) -> bool {
        self.creator.is_some()
    }

    /// The single dialog of a UAS set
    pub fn uas_dialog_mut(&mut self) -> Option<&mut Dialog> {
        self.dialogs.values_mut().next()
    }

    /// Nothing left that could keep the set alive
    pub fn can_die(&self) -> bool {
        self.dialogs.is_empty() && self.dialogless.is_none() && !self.awaiting_final
    }

    pub fn is_ending(&self) -> bool {
        matches!(
            self.state,
            DialogSetState::WaitingToEnd | DialogSetState::Cancelling | DialogSetState::Terminating
        )
    }
}

impl fmt::Debug for DialogSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialogSet")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("dialogs", &self.dialogs.keys().collect::<Vec<_>>())
            .field("dialogless", &self.dialogless)
            .field("awaiting_final", &self.awaiting_final)
            .finish()
    }
}
