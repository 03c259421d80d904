//! Timers, usage destruction and dialog/dialog set teardown
//!
//! Usages are destroyed only through [`DialogUsageManager::destroy_usage`]:
//! it removes the usage from the registry (staling every handle), detaches
//! it from its dialog or dialog set, and then lets the container die if
//! nothing else keeps it alive. A dialog set also survives while its creator
//! still waits for a final response.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace, warn};

use sipdum_message::{Message, StatusCode};

use super::DialogUsageManager;
use crate::dialog::dialog_utils::make_cancel;
use crate::dialog::{DialogId, DialogSetId, DialogSetState};
use crate::errors::{DumError, DumResult};
use crate::timer::{DumTimeout, TimeoutKind};
use crate::usage::{
    ClientSubscriptionHandle, Handle, InviteEndReason, InviteSessionHandle,
    ServerSubscriptionHandle, TerminateReason, Usage, UsageId, UsageLocation,
};

impl DialogUsageManager {
    /// Fire every timer whose deadline has passed; returns how many fired
    pub fn process_timers(&mut self) -> usize {
        let due = self.timers.pop_due(Instant::now());
        let fired = due.len();
        for timeout in due {
            self.on_timeout(timeout);
        }
        fired
    }

    pub(crate) fn on_timeout(&mut self, timeout: DumTimeout) {
        if let Some(id) = timeout.usage {
            match self.registry.get_any(id).and_then(Usage::timer_seq) {
                Some(seq) if seq == timeout.seq => {}
                _ => {
                    trace!("Ignoring stale {:?} timer for usage {}", timeout.kind, id);
                    return;
                }
            }
        }

        let result = match (timeout.kind, timeout.usage) {
            (TimeoutKind::Resubscribe { request }, _) => self.resubscribe(*request),
            (TimeoutKind::AuthExpired { transaction_id }, _) => {
                self.on_auth_expired(&transaction_id);
                Ok(())
            }
            (TimeoutKind::SubscriptionRefresh, Some(id)) => {
                self.on_subscription_refresh_timer(Handle::from_id(id))
            }
            (TimeoutKind::SubscriptionRetry, Some(id)) => {
                self.on_subscription_retry_timer(Handle::from_id(id))
            }
            (TimeoutKind::SubscriptionEndGuard, Some(id)) => {
                self.on_subscription_end_guard(Handle::from_id(id))
            }
            (TimeoutKind::SubscriptionExpired, Some(id)) => {
                self.on_server_subscription_expired(Handle::from_id(id))
            }
            (TimeoutKind::RegistrationRefresh, Some(id)) => {
                self.on_registration_refresh_timer(Handle::from_id(id))
            }
            (TimeoutKind::PublicationRefresh, Some(id)) => {
                self.on_publication_refresh_timer(Handle::from_id(id))
            }
            (TimeoutKind::PublicationExpired, Some(id)) => {
                self.on_server_publication_expired(Handle::from_id(id))
            }
            (kind, None) => {
                warn!("Timer {:?} fired without a usage", kind);
                Ok(())
            }
        };
        if let Err(e) = result {
            if e.is_stale_handle() {
                trace!("Timer target already gone: {}", e);
            } else {
                warn!("Timer handling failed: {}", e);
            }
        }
    }

    /// Schedule a timer for a usage, invalidating its earlier timers
    pub(crate) fn schedule_usage_timer(
        &mut self,
        id: UsageId,
        kind: TimeoutKind,
        after: Duration,
    ) -> DumResult<Instant> {
        let seq = self
            .registry
            .get_any_mut(id)
            .and_then(Usage::bump_timer_seq)
            .ok_or(DumError::StaleHandle { id })?;
        trace!("Scheduling {:?} for usage {} in {:?}", kind, id, after);
        Ok(self.timers.schedule(after, DumTimeout::for_usage(kind, id, seq)))
    }

    /// Invalidate a usage's outstanding timers
    pub(crate) fn cancel_usage_timers(&mut self, id: UsageId) {
        if let Some(usage) = self.registry.get_any_mut(id) {
            usage.bump_timer_seq();
        }
    }

    pub(crate) fn schedule_detached(&mut self, kind: TimeoutKind, after: Duration) {
        self.timers.schedule(after, DumTimeout::detached(kind));
    }

    /// Remove a usage and let its dialog and dialog set die if they are empty
    pub(crate) fn destroy_usage(&mut self, id: UsageId) {
        let Some(usage) = self.registry.remove(id) else {
            return;
        };
        if let Usage::ServerPublication(publication) = &usage {
            if self.publications.get(&publication.etag).map(|h| h.id()) == Some(id) {
                self.publications.remove(&publication.etag);
            }
        }
        debug!("Destroyed usage {}", id);
        match usage.location() {
            UsageLocation::Dialog(dialog_id) => {
                if let Some(dialog) = self.dialog_mut(&dialog_id) {
                    dialog.detach(id);
                }
                self.possibly_die_dialog(&dialog_id);
            }
            UsageLocation::DialogSet(set_id) => {
                if let Some(set) = self.dialog_sets.get_mut(&set_id) {
                    if set.dialogless == Some(id) {
                        set.dialogless = None;
                    }
                }
                self.possibly_die_set(&set_id);
            }
        }
    }

    /// `end_dialog_set` was called on the set
    pub(crate) fn is_set_ending(&self, id: &DialogSetId) -> bool {
        self.dialog_sets.get(id).map(|s| s.is_ending()).unwrap_or(false)
    }

    pub(crate) fn possibly_die_dialog(&mut self, id: &DialogId) {
        let set_id = id.dialog_set_id();
        let Some(set) = self.dialog_sets.get_mut(&set_id) else {
            return;
        };
        if set.dialogs.get(id).map(|d| d.is_empty()).unwrap_or(false) {
            set.dialogs.remove(id);
            debug!("Dialog {} destroyed", id);
        }
        self.possibly_die_set(&set_id);
    }

    pub(crate) fn possibly_die_set(&mut self, id: &DialogSetId) {
        let can_die = self.dialog_sets.get(id).map(|s| s.can_die()).unwrap_or(false);
        if !can_die {
            return;
        }
        if let Some(set) = self.dialog_sets.remove(id) {
            if let Some(key) = &set.uas_key {
                self.uas_sets.remove(key);
            }
            debug!("Dialog set {} destroyed", id);
            if let Some(app) = set.app_dialog_set {
                app.on_dialog_set_destroyed(id);
            }
        }
        self.check_shutdown_progress();
    }

    /// Drop a dialog set created for a request that could not be processed
    pub(crate) fn discard_dialog_set(&mut self, id: &DialogSetId) {
        let Some(set) = self.dialog_sets.get_mut(id) else {
            return;
        };
        set.awaiting_final = false;
        let mut usages: Vec<UsageId> = set.dialogs.values().flat_map(|d| d.usage_ids()).collect();
        usages.extend(set.dialogless);
        set.dialogs.clear();
        set.dialogless = None;
        for usage in usages {
            self.registry.remove(usage);
        }
        self.possibly_die_set(id);
    }

    /// Tell a usage's owner it ended and destroy it, without sending anything
    ///
    /// Used when the peer's response shows the usage or its dialog is gone.
    pub(crate) fn terminate_usage_silently(&mut self, id: UsageId, msg: Option<&Message>) {
        match self.registry.get_any(id) {
            Some(Usage::InviteSession(_)) => {
                let session: InviteSessionHandle = Handle::from_id(id);
                self.finish_invite_session(session, InviteEndReason::Error, msg);
            }
            Some(Usage::ClientSubscription(_)) => {
                let sub: ClientSubscriptionHandle = Handle::from_id(id);
                self.finish_client_subscription(sub, msg);
            }
            Some(Usage::ServerSubscription(_)) => {
                let sub: ServerSubscriptionHandle = Handle::from_id(id);
                self.finish_server_subscription(sub);
            }
            Some(_) => self.destroy_usage(id),
            None => {}
        }
    }

    /// Terminate every usage of a dialog after a dialog-ending failure
    pub(crate) fn terminate_dialog_usages(&mut self, id: &DialogId, msg: Option<&Message>) {
        let usages = self.find_dialog(id).map(|d| d.usage_ids()).unwrap_or_default();
        for usage in usages {
            self.terminate_usage_silently(usage, msg);
        }
    }

    /// End every usage of a dialog gracefully
    pub fn end_dialog(&mut self, id: &DialogId) -> DumResult<()> {
        let dialog = self.find_dialog(id).ok_or_else(|| DumError::dialog_not_found(id))?;
        let invite = dialog.invite_session;
        let clients = dialog.client_subscriptions.clone();
        let servers = dialog.server_subscriptions.clone();

        for sub in servers {
            log_end(sub.end(self, TerminateReason::NoResource));
        }
        for sub in clients {
            log_end(sub.end(self));
        }
        if let Some(session) = invite {
            log_end(session.end(self));
        }
        Ok(())
    }

    /// End a whole dialog set
    ///
    /// Before any final response the initial request is cancelled (or the
    /// CANCEL deferred until a provisional arrives); established dialogs are
    /// ended one by one.
    pub fn end_dialog_set(&mut self, id: &DialogSetId) -> DumResult<()> {
        let set = self.dialog_sets.get_mut(id).ok_or_else(|| DumError::dialog_set_not_found(id))?;
        debug!("Ending dialog set {} in state {:?}", id, set.state);

        let invite_pending = set.awaiting_final
            && set
                .creator
                .as_ref()
                .map(|c| c.method() == &sipdum_message::Method::Invite)
                .unwrap_or(false);
        let mut cancel = None;
        if invite_pending {
            match set.state {
                DialogSetState::Initial => set.state = DialogSetState::WaitingToEnd,
                DialogSetState::ReceivedProvisional => {
                    set.state = DialogSetState::Cancelling;
                    cancel = set.creator.as_ref().map(|c| make_cancel(c.last_request()));
                }
                _ => {}
            }
        } else if !set.is_ending() {
            set.state = DialogSetState::Terminating;
        }

        let dialogs: Vec<DialogId> = set.dialogs.keys().cloned().collect();
        let dialogless = set.dialogless;

        if let Some(cancel) = cancel {
            self.send_request(cancel)?;
        }
        for dialog in dialogs {
            if invite_pending {
                // early dialogs wait for the 487 that follows the CANCEL
                let established = self
                    .find_dialog(&dialog)
                    .map(|d| d.state != crate::dialog::DialogState::Forming)
                    .unwrap_or(false);
                if !established {
                    continue;
                }
            }
            self.end_dialog(&dialog)?;
        }
        if let Some(usage) = dialogless {
            self.end_dialogless_usage(usage)?;
        }
        self.possibly_die_set(id);
        Ok(())
    }

    fn end_dialogless_usage(&mut self, id: UsageId) -> DumResult<()> {
        match self.registry.get_any(id) {
            Some(Usage::ClientRegistration(_)) => {
                Handle::<crate::usage::ClientRegistration>::from_id(id).end(self)
            }
            Some(Usage::ClientPublication(_)) => {
                Handle::<crate::usage::ClientPublication>::from_id(id).end(self)
            }
            Some(Usage::ServerRegistration(_)) => {
                Handle::<crate::usage::ServerRegistration>::from_id(id).reject(
                    self,
                    StatusCode::SERVICE_UNAVAILABLE,
                )
            }
            Some(Usage::ServerOutOfDialog(_)) => {
                Handle::<crate::usage::ServerOutOfDialogReq>::from_id(id).reject(
                    self,
                    StatusCode::SERVICE_UNAVAILABLE,
                )
            }
            Some(_) => {
                self.destroy_usage(id);
                Ok(())
            }
            None => Ok(()),
        }
    }
}

fn log_end(result: DumResult<()>) {
    if let Err(e) = result {
        if !e.is_stale_handle() {
            warn!("Failed to end usage: {}", e);
        }
    }
}
