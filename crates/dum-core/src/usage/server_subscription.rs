//! Notifier side of RFC 6665 subscriptions, including the implicit
//! subscription created by a received REFER (RFC 3515)
//!
//! ```text
//! Invalid ──SUBSCRIBE──▶ Init ──2xx──▶ Established ──NOTIFY terminated──▶ Terminated
//! Invalid ──REFER──▶ Established
//! ```
//!
//! The application answers with [`accept`](ServerSubscriptionHandle::accept)
//! or [`reject`](ServerSubscriptionHandle::reject) and reports state with
//! NOTIFYs. Every 2xx and every NOTIFY sent re-arms the single expiry timer;
//! when it fires the subscriber gets `terminated;reason=timeout`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use sipdum_message::{Message, Method, MimeType, Request, Response, StatusCode};

use super::client_subscription::event_header;
use super::subscription_state::subscription_state_header;
use super::{
    FailureDisposition, ServerSubscriptionHandle, SubscriptionStatus, TerminateReason, UsageId,
};
use crate::dialog::{DialogId, DialogSetId, DialogState};
use crate::errors::{DumError, DumResult};
use crate::handlers::ServerSubscriptionHandler;
use crate::manager::{dialog_entry, DialogUsageManager};
use crate::timer::TimeoutKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerSubscriptionState {
    /// Created, request not yet looked at
    Invalid,
    /// SUBSCRIBE received, not yet accepted
    Init,
    Established,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct ServerSubscription {
    pub(crate) id: UsageId,
    pub(crate) dialog_id: DialogId,
    pub(crate) event: String,
    pub(crate) event_id: Option<String>,
    pub(crate) state: ServerSubscriptionState,
    /// Subscription-State advertised in NOTIFYs
    pub(crate) status: SubscriptionStatus,
    /// Last SUBSCRIBE or REFER received
    pub(crate) request: Request,
    pub(crate) expires: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_seq: u64,
    pub(crate) document: Option<(MimeType, Bytes)>,
}

impl ServerSubscription {
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

    pub fn state(&self) -> ServerSubscriptionState {
        self.state
    }

    pub fn subscriber(&self) -> Option<&sipdum_message::NameAddr> {
        self.request.headers.from.as_ref()
    }

    /// Seconds until expiry, never negative
    pub fn time_left(&self) -> u32 {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }

    fn is_refer(&self) -> bool {
        self.request.method == Method::Refer
    }
}

impl ServerSubscriptionHandle {
    /// Accept the pending SUBSCRIBE/REFER with a 2xx
    pub fn accept(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        let response = self.accept_response(dum, code)?;
        dum.server_subscription_send(*self, response)
    }

    /// The 2xx `accept` would send, for the application to adjust and `send`
    pub fn accept_response(
        &self,
        dum: &DialogUsageManager,
        code: StatusCode,
    ) -> DumResult<Response> {
        if !code.is_success() {
            return Err(DumError::usage_use(format!("{} is not a 2xx", code)));
        }
        let usage = dum.registry.get(*self)?;
        let mut response = dum.dialog_response(&usage.dialog_id, &usage.request, code)?;
        if !usage.is_refer() {
            response.headers.expires = Some(usage.expires);
        }
        Ok(response)
    }

    /// Send a response to the pending SUBSCRIBE/REFER
    pub fn send(&self, dum: &mut DialogUsageManager, response: Response) -> DumResult<()> {
        dum.server_subscription_send(*self, response)
    }

    pub fn reject(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        if code.as_u16() < 300 {
            return Err(DumError::usage_use(format!("{} is not a rejection", code)));
        }
        let usage = dum.registry.get(*self)?;
        let response = dum.dialog_response(&usage.dialog_id, &usage.request, code)?;
        dum.server_subscription_send(*self, response)
    }

    /// Subscription-State reported by later NOTIFYs
    pub fn set_subscription_state(
        &self,
        dum: &mut DialogUsageManager,
        status: SubscriptionStatus,
    ) -> DumResult<()> {
        if status == SubscriptionStatus::Terminated {
            return Err(DumError::usage_use("use end() to terminate a subscription"));
        }
        dum.registry.get_mut(*self)?.status = status;
        Ok(())
    }

    /// NOTIFY a new state document
    pub fn update(
        &self,
        dum: &mut DialogUsageManager,
        content_type: MimeType,
        body: Bytes,
    ) -> DumResult<()> {
        dum.registry.get_mut(*self)?.document = Some((content_type, body));
        dum.server_subscription_notify(*self, None)
    }

    /// NOTIFY the current state again
    pub fn neutral_notify(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.server_subscription_notify(*self, None)
    }

    /// NOTIFY `terminated` with `reason` and end the usage
    pub fn end(&self, dum: &mut DialogUsageManager, reason: TerminateReason) -> DumResult<()> {
        dum.server_subscription_end(*self, reason)
    }

    pub fn time_left(&self, dum: &DialogUsageManager) -> DumResult<u32> {
        Ok(dum.registry.get(*self)?.time_left())
    }

    pub fn state(&self, dum: &DialogUsageManager) -> DumResult<ServerSubscriptionState> {
        Ok(dum.registry.get(*self)?.state)
    }
}

impl DialogUsageManager {
    fn server_subscription_handler(
        &self,
        event: &str,
    ) -> Option<Arc<dyn ServerSubscriptionHandler>> {
        self.handlers.server_subscription.get(event).cloned()
    }

    pub(crate) fn find_server_subscription(
        &self,
        dialog_id: &DialogId,
        event: &str,
        id: Option<&str>,
    ) -> Option<ServerSubscriptionHandle> {
        let dialog = self.find_dialog(dialog_id)?;
        dialog.server_subscriptions.iter().copied().find(|handle| {
            self.registry
                .get(*handle)
                .map(|sub| sub.event == event && sub.event_id.as_deref() == id)
                .unwrap_or(false)
        })
    }

    pub(crate) fn create_server_subscription(
        &mut self,
        dialog_id: &DialogId,
        request: &Request,
    ) -> DumResult<ServerSubscriptionHandle> {
        if self.find_dialog(dialog_id).is_none() {
            return Err(DumError::dialog_not_found(dialog_id));
        }
        let (event, event_id) = match request.method {
            Method::Refer => {
                ("refer".to_string(), request.headers.cseq_seq().map(|seq| seq.to_string()))
            }
            _ => (
                request
                    .headers
                    .event_type()
                    .ok_or_else(|| DumError::invalid_message("SUBSCRIBE without Event"))?
                    .to_string(),
                request.headers.event_id().map(str::to_string),
            ),
        };
        let owner = dialog_id.clone();
        let template = request.clone();
        let handle = self.registry.insert_with(|id| ServerSubscription {
            id,
            dialog_id: owner,
            event,
            event_id,
            state: ServerSubscriptionState::Invalid,
            status: SubscriptionStatus::Active,
            request: template,
            expires: 0,
            deadline: None,
            timer_seq: 0,
            document: None,
        });
        if let Some(dialog) = self.dialog_mut(dialog_id) {
            dialog.server_subscriptions.push(handle);
        }
        debug!("Created server subscription {} on {}", handle.id(), dialog_id);
        Ok(handle)
    }

    /// Fire `on_terminated` and destroy the subscription
    pub(crate) fn finish_server_subscription(&mut self, sub: ServerSubscriptionHandle) {
        let Ok(usage) = self.registry.get_mut(sub) else {
            return;
        };
        usage.state = ServerSubscriptionState::Terminated;
        let event = usage.event.clone();
        info!("Server subscription {} ({}) terminated", sub.id(), event);
        if let Some(handler) = self.server_subscription_handler(&event) {
            handler.on_terminated(self, sub);
        }
        self.destroy_usage(sub.id());
    }

    /// A new SUBSCRIBE or REFER opened a server dialog set
    pub(crate) fn start_server_subscription(
        &mut self,
        set_id: &DialogSetId,
        request: Request,
    ) -> DumResult<()> {
        let dialog = crate::dialog::Dialog::new_uas(
            crate::dialog::DialogType::Subscription,
            &request,
            &set_id.local_tag,
            self.config.local_contact.clone(),
        )?;
        let dialog_id = dialog.id.clone();
        let set = self
            .dialog_sets
            .get_mut(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        set.dialogs.insert(dialog_id.clone(), dialog);
        let sub = self.create_server_subscription(&dialog_id, &request)?;
        self.dispatch_server_subscription_request(sub, request)
    }

    /// SUBSCRIBE or REFER for a server subscription, new or existing
    pub(crate) fn dispatch_server_subscription_request(
        &mut self,
        sub: ServerSubscriptionHandle,
        request: Request,
    ) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        let dialog_id = usage.dialog_id.clone();
        let state = usage.state;
        let Some(handler) = self.server_subscription_handler(&usage.event) else {
            let response = self.dialog_response(&dialog_id, &request, StatusCode::BAD_EVENT)?;
            self.send_response(response);
            self.destroy_usage(sub.id());
            return Ok(());
        };

        if request.method == Method::Refer {
            let expires = self.config.default_subscription_expires;
            let usage = self.registry.get_mut(sub)?;
            usage.state = ServerSubscriptionState::Established;
            usage.expires = expires;
            usage.deadline = Some(Instant::now() + Duration::from_secs(expires as u64));
            usage.request = request.clone();
            handler.on_new_subscription_from_refer(self, sub, &request);
            return Ok(());
        }

        let requested = request
            .headers
            .expires
            .or_else(|| handler.default_expires())
            .unwrap_or(self.config.default_subscription_expires);
        if let Some(min) = handler.min_expires() {
            if requested != 0 && requested < min {
                let mut response =
                    self.dialog_response(&dialog_id, &request, StatusCode::INTERVAL_TOO_BRIEF)?;
                response.headers.min_expires = Some(min);
                self.send_response(response);
                if state == ServerSubscriptionState::Invalid {
                    self.destroy_usage(sub.id());
                }
                return Ok(());
            }
        }

        let usage = self.registry.get_mut(sub)?;
        usage.request = request.clone();
        usage.expires = requested;
        usage.deadline = Some(Instant::now() + Duration::from_secs(requested as u64));

        match state {
            ServerSubscriptionState::Invalid => {
                usage.state = ServerSubscriptionState::Init;
                handler.on_new_subscription(self, sub, &request);
            }
            _ if requested == 0 => {
                // unsubscribe: confirm, then the final NOTIFY
                let response = sub.accept_response(self, StatusCode::OK)?;
                self.send_response(response);
                self.server_subscription_end(sub, TerminateReason::Timeout)?;
            }
            _ => handler.on_refresh(self, sub, &request),
        }
        Ok(())
    }

    fn server_subscription_send(
        &mut self,
        sub: ServerSubscriptionHandle,
        response: Response,
    ) -> DumResult<()> {
        let code = response.status;
        let usage = self.registry.get_mut(sub)?;
        if code.is_success() && !usage.is_refer() && response.headers.expires.is_none() {
            return Err(DumError::usage_use("2xx to SUBSCRIBE must carry Expires"));
        }
        let initial =
            matches!(usage.state, ServerSubscriptionState::Invalid | ServerSubscriptionState::Init);

        if code.is_success() {
            usage.state = ServerSubscriptionState::Established;
            if let Some(granted) = response.headers.expires {
                usage.expires = granted;
                usage.deadline = Some(Instant::now() + Duration::from_secs(granted as u64));
            }
            let after = usage.time_left();
            if let Some(dialog) = dialog_entry(&mut self.dialog_sets, &usage.dialog_id) {
                dialog.state = DialogState::Established;
            }
            self.send_response(response);
            self.schedule_usage_timer(
                sub.id(),
                TimeoutKind::SubscriptionExpired,
                Duration::from_secs(after as u64),
            )?;
            return Ok(());
        }

        self.send_response(response);
        if code.as_u16() >= 300 && initial {
            self.finish_server_subscription(sub);
        }
        Ok(())
    }

    /// Build and send a NOTIFY; `reason` makes it the terminating one
    fn server_subscription_notify(
        &mut self,
        sub: ServerSubscriptionHandle,
        reason: Option<TerminateReason>,
    ) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        if usage.state == ServerSubscriptionState::Terminated {
            return Err(DumError::usage_use("subscription already terminated"));
        }
        let dialog_id = usage.dialog_id.clone();
        let event = event_header(&usage.event, usage.event_id.as_deref());
        let state = match &reason {
            Some(reason) => {
                subscription_state_header(&SubscriptionStatus::Terminated, None, Some(reason))
            }
            None => subscription_state_header(&usage.status, Some(usage.time_left()), None),
        };
        let document = usage.document.clone();
        let after = usage.time_left();

        let dialog = dialog_entry(&mut self.dialog_sets, &dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(&dialog_id))?;
        let mut notify = dialog.make_request(Method::Notify, &self.config);
        notify.headers.event = Some(event);
        notify.headers.subscription_state = Some(state);
        if let Some((content_type, body)) = document {
            notify.headers.content_type = Some(content_type);
            notify.body = body;
        }
        self.send_request(notify)?;
        if reason.is_none() {
            self.schedule_usage_timer(
                sub.id(),
                TimeoutKind::SubscriptionExpired,
                Duration::from_secs(after as u64),
            )?;
        }
        Ok(())
    }

    fn server_subscription_end(
        &mut self,
        sub: ServerSubscriptionHandle,
        reason: TerminateReason,
    ) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        match usage.state {
            ServerSubscriptionState::Terminated => return Ok(()),
            ServerSubscriptionState::Init => {
                // the SUBSCRIBE is still unanswered: refuse it instead of notifying
                debug!("Refusing unanswered SUBSCRIBE for {} ({:?})", sub.id(), reason);
                let response = self.dialog_response(
                    &usage.dialog_id,
                    &usage.request,
                    StatusCode::TEMPORARILY_UNAVAILABLE,
                )?;
                return self.server_subscription_send(sub, response);
            }
            ServerSubscriptionState::Established => {
                self.server_subscription_notify(sub, Some(reason))?
            }
            ServerSubscriptionState::Invalid => {}
        }
        self.finish_server_subscription(sub);
        Ok(())
    }

    pub(crate) fn on_server_subscription_expired(
        &mut self,
        sub: ServerSubscriptionHandle,
    ) -> DumResult<()> {
        let usage = self.registry.get(sub)?;
        if usage.state != ServerSubscriptionState::Established {
            return Ok(());
        }
        let event = usage.event.clone();
        info!("Server subscription {} ({}) expired", sub.id(), event);
        self.server_subscription_notify(sub, Some(TerminateReason::Timeout))?;
        if let Some(handler) = self.server_subscription_handler(&event) {
            handler.on_expired(self, sub);
        }
        self.finish_server_subscription(sub);
        Ok(())
    }

    /// Response to a NOTIFY we sent
    pub(crate) fn dispatch_server_subscription_response(
        &mut self,
        sub: ServerSubscriptionHandle,
        response: Response,
    ) -> DumResult<()> {
        if !response.status.is_failure() {
            return Ok(());
        }
        let usage = self.registry.get(sub)?;
        let dialog_id = usage.dialog_id.clone();
        if let Some(handler) = self.server_subscription_handler(&usage.event) {
            handler.on_notify_rejected(self, sub, &response);
        }
        match FailureDisposition::for_status(response.status) {
            FailureDisposition::Transaction => {}
            FailureDisposition::Usage => self.finish_server_subscription(sub),
            FailureDisposition::Dialog => {
                self.terminate_dialog_usages(&dialog_id, Some(&Message::Response(response)))
            }
        }
        Ok(())
    }
}
