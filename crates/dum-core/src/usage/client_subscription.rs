//! Subscriber side of RFC 6665 subscriptions (and the implicit subscription
//! of a REFER we sent)
//!
//! A client subscription is created by the first 2xx or NOTIFY answering our
//! SUBSCRIBE/REFER. Every NOTIFY is answered before the application hears
//! about it. Refreshes are scheduled a bit before the granted expiry; a
//! NOTIFY with `terminated` ends the usage, possibly after asking the
//! application whether to start over in a new dialog set.
//!
//! Failed initial SUBSCRIBEs leave a usage on a placeholder ("fake") dialog
//! so that the application still gets a handle and `on_terminated`; retries
//! re-issue the creator request in the same dialog set.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use sipdum_message::sipfrag::sipfrag_status;
use sipdum_message::{CSeq, Message, Method, Request, Response, StatusCode, Token};

use super::{ClientSubscriptionHandle, SubscriptionStatus, TerminateReason, UsageId};
use crate::config::SubscriptionRetryPolicy;
use crate::dialog::dialog_utils::{a_bit_smaller_than, generate_call_id, generate_tag};
use crate::dialog::{
    Creator, CreatorKind, Dialog, DialogId, DialogSet, DialogSetId, DialogState, DialogType,
};
use crate::errors::{DumError, DumResult};
use crate::handlers::ClientSubscriptionHandler;
use crate::manager::{dialog_entry, DialogUsageManager};
use crate::timer::{TimeoutKind, TRANSACTION_LIFETIME};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientSubscriptionState {
    /// Waiting for the first NOTIFY
    Initial,
    Pending,
    Active,
    /// Unsubscribe sent, waiting for the final NOTIFY
    Terminating,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ClientSubscription {
    pub(crate) id: UsageId,
    pub(crate) dialog_id: DialogId,
    pub(crate) event: String,
    pub(crate) event_id: Option<String>,
    pub(crate) state: ClientSubscriptionState,
    pub(crate) is_refer: bool,
    pub(crate) received_notify: bool,
    /// Requested or last granted duration
    pub(crate) expires: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_seq: u64,
    /// Last SUBSCRIBE (or the REFER) sent for this subscription
    pub(crate) last_request: Request,
    pub(crate) last_notify: Option<Request>,
}

impl ClientSubscription {
    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn dialog_id(&self) -> &DialogId {
        &self.dialog_id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }

    pub fn state(&self) -> ClientSubscriptionState {
        self.state
    }

    pub fn last_notify(&self) -> Option<&Request> {
        self.last_notify.as_ref()
    }

    /// Seconds until expiry, never negative
    pub fn time_left(&self) -> u32 {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }

    /// Whether a NOTIFY with this Event belongs to the subscription
    fn matches(&self, event: &str, id: Option<&str>) -> bool {
        if self.event != event {
            return false;
        }
        self.event_id.as_deref() == id || (self.is_refer && id.is_none())
    }
}

impl ClientSubscriptionHandle {
    /// Refresh now, optionally asking for a new duration
    pub fn request_refresh(
        &self,
        dum: &mut DialogUsageManager,
        expires: Option<u32>,
    ) -> DumResult<()> {
        dum.client_subscription_refresh(*self, expires)
    }

    /// Unsubscribe (Expires: 0); the usage ends with the final NOTIFY
    pub fn end(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.client_subscription_end(*self)
    }

    pub fn time_left(&self, dum: &DialogUsageManager) -> DumResult<u32> {
        Ok(dum.registry.get(*self)?.time_left())
    }

    pub fn state(&self, dum: &DialogUsageManager) -> DumResult<ClientSubscriptionState> {
        Ok(dum.registry.get(*self)?.state)
    }
}

/// Retry decision taken for a failed SUBSCRIBE
enum Retry {
    After(u32),
    Give,
}

impl DialogUsageManager {
    fn client_subscription_handler(
        &self,
        event: &str,
    ) -> Option<Arc<dyn ClientSubscriptionHandler>> {
        self.handlers.client_subscription.get(event).cloned()
    }

    /// Client subscription of a dialog matching an Event header
    pub(crate) fn find_client_subscription(
        &self,
        dialog_id: &DialogId,
        event: &str,
        id: Option<&str>,
    ) -> Option<ClientSubscriptionHandle> {
        let dialog = self.find_dialog(dialog_id)?;
        dialog.client_subscriptions.iter().copied().find(|handle| {
            self.registry
                .get(*handle)
                .map(|sub| sub.matches(event, id))
                .unwrap_or(false)
        })
    }

    /// Attach a new client subscription for `request` to a dialog
    pub(crate) fn create_client_subscription(
        &mut self,
        dialog_id: &DialogId,
        request: &Request,
    ) -> DumResult<ClientSubscriptionHandle> {
        if self.find_dialog(dialog_id).is_none() {
            return Err(DumError::dialog_not_found(dialog_id));
        }
        let is_refer = request.method == Method::Refer;
        let event = match is_refer {
            true => "refer".to_string(),
            false => request
                .headers
                .event_type()
                .ok_or_else(|| DumError::invalid_message("SUBSCRIBE without Event"))?
                .to_string(),
        };
        let event_id = match is_refer {
            true => request.headers.cseq_seq().map(|seq| seq.to_string()),
            false => request.headers.event_id().map(str::to_string),
        };
        let expires = request.headers.expires.unwrap_or(self.config.default_subscription_expires);
        let owner = dialog_id.clone();
        let template = request.clone();
        let handle = self.registry.insert_with(|id| ClientSubscription {
            id,
            dialog_id: owner,
            event,
            event_id,
            state: ClientSubscriptionState::Initial,
            is_refer,
            received_notify: false,
            expires,
            deadline: None,
            timer_seq: 0,
            last_request: template,
            last_notify: None,
        });
        if let Some(dialog) = self.dialog_mut(dialog_id) {
            dialog.client_subscriptions.push(handle);
        }
        debug!("Created client subscription {} on {}", handle.id(), dialog_id);
        Ok(handle)
    }

    /// Fire `on_terminated` and destroy the subscription
    pub(crate) fn finish_client_subscription(
        &mut self,
        sub: ClientSubscriptionHandle,
        msg: Option<&Message>,
    ) {
        let Ok(usage) = self.registry.get_mut(sub) else {
            return;
        };
        usage.state = ClientSubscriptionState::Terminated;
        let event = usage.event.clone();
        info!("Client subscription {} ({}) terminated", sub.id(), event);
        if let Some(handler) = self.client_subscription_handler(&event) {
            handler.on_terminated(self, sub, msg);
        }
        self.destroy_usage(sub.id());
    }

    /// A NOTIFY for one of our subscriptions
    pub(crate) fn dispatch_client_subscription_notify(
        &mut self,
        sub: ClientSubscriptionHandle,
        notify: Request,
    ) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        let dialog_id = usage.dialog_id.clone();
        let event = usage.event.clone();
        let is_refer = usage.is_refer;
        let Some(handler) = self.client_subscription_handler(&event) else {
            let response = self.dialog_response(&dialog_id, &notify, StatusCode::BAD_EVENT)?;
            self.send_response(response);
            self.destroy_usage(sub.id());
            return Ok(());
        };

        let Some(state_header) = notify.headers.subscription_state.clone() else {
            if !is_refer {
                warn!("NOTIFY without Subscription-State for {}", event);
                let response = self.dialog_response(&dialog_id, &notify, StatusCode::BAD_REQUEST)?;
                self.send_response(response);
                self.finish_client_subscription(sub, Some(&Message::Request(notify)));
                return Ok(());
            }
            return self.on_refer_progress(sub, handler, &dialog_id, notify);
        };

        let response = self.dialog_response(&dialog_id, &notify, StatusCode::OK)?;
        self.send_response(response);
        if let Some(dialog) = self.dialog_mut(&dialog_id) {
            dialog.update_remote_target(notify.headers.contact.first());
            if dialog.state == DialogState::Forming {
                dialog.state = DialogState::Established;
            }
        }

        let usage = self.registry.get_mut(sub)?;
        let first = !usage.received_notify;
        usage.received_notify = true;
        usage.last_notify = Some(notify.clone());
        if first && !is_refer {
            handler.on_new_subscription(self, sub, &notify);
            if !sub.is_valid(self) {
                return Ok(());
            }
        }

        match SubscriptionStatus::from_token(&state_header) {
            status @ (SubscriptionStatus::Active | SubscriptionStatus::Pending) => {
                let usage = self.registry.get_mut(sub)?;
                let granted = state_header.param_u32("expires").unwrap_or(usage.expires);
                let ending = usage.state == ClientSubscriptionState::Terminating;
                if !ending {
                    usage.state = match status {
                        SubscriptionStatus::Active => ClientSubscriptionState::Active,
                        _ => ClientSubscriptionState::Pending,
                    };
                    usage.expires = granted;
                    usage.deadline = Some(Instant::now() + Duration::from_secs(granted as u64));
                    self.schedule_refresh(sub.id(), granted)?;
                }
                match status {
                    SubscriptionStatus::Active => handler.on_update_active(self, sub, &notify),
                    _ => handler.on_update_pending(self, sub, &notify),
                }
            }
            SubscriptionStatus::Terminated => {
                let reason = state_header.param("reason").map(TerminateReason::parse);
                let retry_after = state_header.param_u32("retry-after");
                let usage = self.registry.get(sub)?;
                let wanted = usage.state != ClientSubscriptionState::Terminating;
                let msg = Message::Request(notify);
                if wanted {
                    let delay = match reason {
                        Some(ref r) if r.resubscribe_immediately() => {
                            Some(retry_after.unwrap_or(0))
                        }
                        Some(ref r) if r.resubscribe_later() => retry_after,
                        _ => None,
                    };
                    if let Some(delay) = delay {
                        if let Some(after) = handler.on_request_retry(self, sub, delay, &msg) {
                            self.schedule_resubscribe(sub, after)?;
                        }
                    }
                }
                debug!("Subscription {} terminated by notifier: {:?}", sub.id(), reason);
                self.finish_client_subscription(sub, Some(&msg));
            }
            SubscriptionStatus::Extension(value) => {
                debug!("Subscription {} in extension state {}", sub.id(), value);
                handler.on_update_extension(self, sub, &notify);
            }
        }
        Ok(())
    }

    /// A refer NOTIFY without Subscription-State: progress carried as sipfrag
    fn on_refer_progress(
        &mut self,
        sub: ClientSubscriptionHandle,
        handler: Arc<dyn ClientSubscriptionHandler>,
        dialog_id: &DialogId,
        notify: Request,
    ) -> DumResult<()> {
        let response = self.dialog_response(dialog_id, &notify, StatusCode::OK)?;
        self.send_response(response);
        let usage = self.registry.get_mut(sub)?;
        usage.received_notify = true;
        usage.last_notify = Some(notify.clone());
        match sipfrag_status(&notify.body) {
            Some(status) if status.is_final() => {
                self.finish_client_subscription(sub, Some(&Message::Request(notify)))
            }
            _ => handler.on_update_extension(self, sub, &notify),
        }
        Ok(())
    }

    /// Response to a SUBSCRIBE or REFER sent by an existing subscription
    pub(crate) fn dispatch_client_subscription_response(
        &mut self,
        sub: ClientSubscriptionHandle,
        response: Response,
    ) -> DumResult<()> {
        let code = response.status;
        if code.is_provisional() {
            return Ok(());
        }
        let usage = self.registry.get_mut(sub)?;
        let ending = usage.state == ClientSubscriptionState::Terminating;

        if code.is_success() {
            if !ending && !usage.is_refer {
                let granted = response
                    .headers
                    .expires
                    .or(usage.last_request.headers.expires)
                    .unwrap_or(usage.expires);
                usage.expires = granted;
                usage.deadline = Some(Instant::now() + Duration::from_secs(granted as u64));
                self.schedule_refresh(sub.id(), granted)?;
            }
            return Ok(());
        }

        let msg = Message::Response(response.clone());
        if ending {
            self.finish_client_subscription(sub, Some(&msg));
            return Ok(());
        }
        if code == StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST {
            // the notifier lost the dialog: start over in a new dialog set
            self.schedule_resubscribe_now(sub)?;
            self.finish_client_subscription(sub, Some(&msg));
            return Ok(());
        }
        if code == StatusCode::INTERVAL_TOO_BRIEF {
            if let Some(min) = response.headers.min_expires {
                return self.client_subscription_retry_with(sub, Some(min));
            }
        }

        let retry = match code.as_u16() {
            408 => self.ask_retry(sub, 0, &msg),
            413 | 480 | 486 | 500 | 503 | 600 | 603 => match response.headers.retry_after {
                Some(after) => self.ask_retry(sub, after, &msg),
                None => self.policy_retry(),
            },
            _ => self.policy_retry(),
        };
        match retry {
            Retry::After(0) => self.client_subscription_retry_with(sub, None),
            Retry::After(secs) => {
                self.schedule_usage_timer(
                    sub.id(),
                    TimeoutKind::SubscriptionRetry,
                    Duration::from_secs(secs as u64),
                )?;
                Ok(())
            }
            Retry::Give => {
                self.finish_client_subscription(sub, Some(&msg));
                Ok(())
            }
        }
    }

    fn ask_retry(
        &mut self,
        sub: ClientSubscriptionHandle,
        retry_after: u32,
        msg: &Message,
    ) -> Retry {
        let handler = self
            .registry
            .get(sub)
            .ok()
            .and_then(|usage| self.client_subscription_handler(&usage.event));
        match handler.and_then(|handler| handler.on_request_retry(self, sub, retry_after, msg)) {
            Some(delay) => Retry::After(delay),
            None => Retry::Give,
        }
    }

    fn policy_retry(&self) -> Retry {
        match self.config.subscription_retry {
            SubscriptionRetryPolicy::FixedDelay(secs) => Retry::After(secs),
            SubscriptionRetryPolicy::Immediate => Retry::After(0),
            SubscriptionRetryPolicy::Terminate => Retry::Give,
        }
    }

    fn schedule_refresh(&mut self, id: UsageId, granted: u32) -> DumResult<()> {
        if granted == 0 {
            return Ok(());
        }
        let after = a_bit_smaller_than(granted, self.config.max_refresh_jitter_secs);
        self.schedule_usage_timer(
            id,
            TimeoutKind::SubscriptionRefresh,
            Duration::from_secs(after as u64),
        )?;
        Ok(())
    }

    /// Initial SUBSCRIBE/REFER answered by its creator's dialog set
    pub(crate) fn on_subscribe_creator_response(
        &mut self,
        set_id: &DialogSetId,
        response: Response,
    ) -> DumResult<()> {
        let code = response.status;
        if code.is_provisional() {
            return Ok(());
        }
        let request = self
            .find_creator(set_id)
            .map(|c| c.last_request().clone())
            .ok_or_else(|| DumError::internal("subscription dialog set without creator"))?;

        if code.is_success() {
            let dialog_id = DialogId::from_uac_response(&response)
                .ok_or_else(|| DumError::invalid_message("2xx to SUBSCRIBE without To tag"))?;
            if self.find_dialog(&dialog_id).is_none() {
                let dialog = Dialog::new_uac(DialogType::Subscription, &request, &response)?;
                if let Some(set) = self.dialog_sets.get_mut(set_id) {
                    set.dialogs.insert(dialog_id.clone(), dialog);
                }
            }
            if let Some(dialog) = self.dialog_mut(&dialog_id) {
                dialog.confirm(&response);
            }
            let event = event_of(&request);
            let event_id = request_event_id(&request);
            let sub = match self.find_client_subscription(&dialog_id, &event, event_id.as_deref()) {
                Some(sub) => sub,
                None => self.create_client_subscription(&dialog_id, &request)?,
            };
            self.dispatch_client_subscription_response(sub, response)?;
            if self.is_set_ending(set_id) && sub.is_valid(self) {
                return self.client_subscription_end(sub);
            }
            return Ok(());
        }

        // no dialog to hang the usage on: use a placeholder
        let dialog = Dialog::new_fake(&request, &response)?;
        let dialog_id = dialog.id.clone();
        if let Some(set) = self.dialog_sets.get_mut(set_id) {
            set.dialogs.entry(dialog_id.clone()).or_insert(dialog);
        }
        let sub = self.create_client_subscription(&dialog_id, &request)?;
        self.dispatch_client_subscription_response(sub, response)
    }

    /// A NOTIFY for a dialog of ours with no matching subscription yet
    pub(crate) fn adopt_client_subscription(
        &mut self,
        dialog_id: &DialogId,
        notify: Request,
    ) -> DumResult<()> {
        let creator = self
            .find_creator(&dialog_id.dialog_set_id())
            .filter(|c| c.kind == CreatorKind::Subscription)
            .map(|c| c.last_request().clone());
        let Some(request) = creator else {
            let response = self.dialog_response(
                dialog_id,
                &notify,
                StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
            )?;
            self.send_response(response);
            return Ok(());
        };
        if event_of(&request) != notify.headers.event_type().unwrap_or_default() {
            let response = self.dialog_response(dialog_id, &notify, StatusCode::BAD_EVENT)?;
            self.send_response(response);
            return Ok(());
        }
        let sub = self.create_client_subscription(dialog_id, &request)?;
        self.dispatch_client_subscription_notify(sub, notify)
    }

    fn client_subscription_refresh(
        &mut self,
        sub: ClientSubscriptionHandle,
        expires: Option<u32>,
    ) -> DumResult<()> {
        let usage = self.registry.get_mut(sub)?;
        if matches!(
            usage.state,
            ClientSubscriptionState::Terminating | ClientSubscriptionState::Terminated
        ) {
            return Err(DumError::usage_use("subscription is ending"));
        }
        if usage.is_refer {
            return Err(DumError::usage_use("refer subscriptions cannot be refreshed"));
        }
        let dialog = dialog_entry(&mut self.dialog_sets, &usage.dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(&usage.dialog_id))?;
        if dialog.dialog_type == DialogType::Fake {
            return Err(DumError::usage_use("subscription has no dialog"));
        }
        let mut request = dialog.make_request(Method::Subscribe, &self.config);
        request.headers.event = Some(event_header(&usage.event, usage.event_id.as_deref()));
        request.headers.expires = Some(expires.unwrap_or(usage.expires));
        usage.last_request = request.clone();
        self.send_request(request).map(|_| ())
    }

    fn client_subscription_end(&mut self, sub: ClientSubscriptionHandle) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        if matches!(
            usage.state,
            ClientSubscriptionState::Terminating | ClientSubscriptionState::Terminated
        ) {
            return Ok(());
        }
        let is_refer = usage.is_refer;
        let fake = self
            .find_dialog(&usage.dialog_id)
            .map(|d| d.dialog_type == DialogType::Fake)
            .unwrap_or(true);
        if fake || is_refer {
            self.finish_client_subscription(sub, None);
            return Ok(());
        }
        self.client_subscription_refresh(sub, Some(0))?;
        self.registry.get_mut(sub)?.state = ClientSubscriptionState::Terminating;
        // replaces the refresh timers
        self.schedule_usage_timer(
            sub.id(),
            TimeoutKind::SubscriptionEndGuard,
            TRANSACTION_LIFETIME,
        )?;
        Ok(())
    }

    /// The notifier never sent the final NOTIFY for our unsubscribe
    pub(crate) fn on_subscription_end_guard(
        &mut self,
        sub: ClientSubscriptionHandle,
    ) -> DumResult<()> {
        if self.registry.get(sub)?.state != ClientSubscriptionState::Terminating {
            return Ok(());
        }
        debug!("No final NOTIFY for subscription {}, giving up", sub.id());
        self.finish_client_subscription(sub, None);
        Ok(())
    }

    /// Re-send after a failure: in-dialog refresh, or the creator request
    /// again when the subscription only has a placeholder dialog
    fn client_subscription_retry_with(
        &mut self,
        sub: ClientSubscriptionHandle,
        expires: Option<u32>,
    ) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        let dialog_id = usage.dialog_id.clone();
        let fake = self
            .find_dialog(&dialog_id)
            .map(|d| d.dialog_type == DialogType::Fake)
            .unwrap_or(true);
        if !fake {
            return self.client_subscription_refresh(sub, expires);
        }
        let mut retry = self.next_creator_request(&dialog_id.dialog_set_id())?;
        if let Some(expires) = expires {
            retry.headers.expires = Some(expires);
        }
        self.send_request(retry)?;
        // the retry's answer creates a fresh usage
        self.destroy_usage(sub.id());
        Ok(())
    }

    pub(crate) fn on_subscription_refresh_timer(
        &mut self,
        sub: ClientSubscriptionHandle,
    ) -> DumResult<()> {
        match self.registry.get(sub)?.state {
            ClientSubscriptionState::Active
            | ClientSubscriptionState::Pending
            | ClientSubscriptionState::Initial => self.client_subscription_refresh(sub, None),
            _ => Ok(()),
        }
    }

    pub(crate) fn on_subscription_retry_timer(
        &mut self,
        sub: ClientSubscriptionHandle,
    ) -> DumResult<()> {
        self.client_subscription_retry_with(sub, None)
    }

    fn schedule_resubscribe_now(&mut self, sub: ClientSubscriptionHandle) -> DumResult<()> {
        self.schedule_resubscribe(sub, 0)
    }

    /// Start over in a new dialog set after `after` seconds
    fn schedule_resubscribe(&mut self, sub: ClientSubscriptionHandle, after: u32) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        let template = self
            .find_creator(&usage.dialog_id.dialog_set_id())
            .map(|c| c.last_request().clone())
            .unwrap_or_else(|| usage.last_request.clone());
        info!("Resubscribing to {} in {} s", usage.event, after);
        self.schedule_detached(
            TimeoutKind::Resubscribe {
                request: Box::new(template),
            },
            Duration::from_secs(after as u64),
        );
        Ok(())
    }

    /// Send a fresh SUBSCRIBE built from `template` in a new dialog set
    pub(crate) fn resubscribe(&mut self, template: Request) -> DumResult<()> {
        if !self.is_running() {
            debug!("Not resubscribing during shutdown");
            return Ok(());
        }
        let mut request = template;
        let h = &mut request.headers;
        if let Some(to) = h.to.as_mut() {
            to.remove_tag();
        }
        if let Some(from) = h.from.as_mut() {
            from.set_tag(generate_tag());
        }
        h.call_id = Some(generate_call_id(&self.config.via_host));
        h.cseq = Some(CSeq::new(1, request.method.clone()));
        if request.method == Method::Subscribe && request.headers.expires.is_none() {
            request.headers.expires = Some(self.config.default_subscription_expires);
        }

        let set_id = DialogSetId::from_uac_request(&request)
            .ok_or_else(|| DumError::invalid_message("resubscribe template lacks From tag"))?;
        let set = DialogSet::new_uac(
            set_id.clone(),
            Creator::new(CreatorKind::Subscription, request.clone()),
            None,
        );
        self.dialog_sets.insert(set_id, set);
        self.send_request(request).map(|_| ())
    }
}

fn event_of(request: &Request) -> String {
    match request.method {
        Method::Refer => "refer".to_string(),
        _ => request.headers.event_type().unwrap_or_default().to_string(),
    }
}

fn request_event_id(request: &Request) -> Option<String> {
    match request.method {
        Method::Refer => request.headers.cseq_seq().map(|seq| seq.to_string()),
        _ => request.headers.event_id().map(str::to_string),
    }
}

pub(crate) fn event_header(event: &str, id: Option<&str>) -> Token {
    let token = Token::new(event);
    match id {
        Some(id) => token.with_param("id", id),
        None => token,
    }
}
