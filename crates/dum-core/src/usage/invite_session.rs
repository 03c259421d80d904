//! INVITE sessions
//!
//! One [`InviteSession`] rides on each dialog formed by an INVITE. On the
//! client side it is created by the first provisional carrying a To tag (an
//! early dialog) or by the 2xx; on the server side by the INVITE itself.
//!
//! ```text
//! client: Early ──2xx──▶ Connected ──BYE──▶ Terminated
//! server: Offered ──provisional──▶ Proceeding ──accept──▶ Accepted ──ACK──▶ Connected
//!                                         re-INVITE ──▶ ReOffered ──accept──▶ Connected
//! ```
//!
//! The dialog set drives what happens to the INVITE transaction as a whole
//! (forks, CANCEL, extra 2xx answered with ACK+BYE); this file holds both the
//! per-session operations and that set-level response logic.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use sipdum_message::sipfrag::sipfrag_status;
use sipdum_message::{Message, Method, MimeType, NameAddr, Request, Response, StatusCode};

use super::{FailureDisposition, InviteSessionHandle, UsageId};
use crate::dialog::dialog_utils::make_cancel;
use crate::dialog::{Dialog, DialogId, DialogSetId, DialogSetState, DialogState, DialogType};
use crate::errors::{DumError, DumResult};
use crate::handlers::InviteSessionHandler;
use crate::manager::{dialog_entry, DialogUsageManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteSessionState {
    /// Client: early dialog, provisional received
    Early,
    /// Server: INVITE received, nothing sent
    Offered,
    /// Server: provisional sent
    Proceeding,
    /// Server: 2xx sent, waiting for the ACK
    Accepted,
    Connected,
    /// Server: re-INVITE received, waiting for the application
    ReOffered,
    Terminated,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteEndReason {
    LocalBye,
    RemoteBye,
    Cancelled,
    Rejected,
    Redirected,
    /// Another fork of the INVITE was answered
    Forked,
    /// The peer reported the session or dialog as gone
    Error,
}

#[derive(Debug, Clone)]
pub struct InviteSession {
    pub(crate) id: UsageId,
    pub(crate) dialog_id: DialogId,
    pub(crate) role: InviteRole,
    pub(crate) state: InviteSessionState,
    /// INVITE sent (client) or last INVITE received (server)
    pub(crate) invite: Request,
    /// ACK of the 2xx, re-sent on 2xx retransmissions
    pub(crate) ack: Option<Request>,
    pub(crate) local_sdp: Option<Bytes>,
    pub(crate) remote_sdp: Option<Bytes>,
}

impl InviteSession {
    fn new(
        id: UsageId,
        dialog_id: DialogId,
        role: InviteRole,
        state: InviteSessionState,
        invite: Request,
    ) -> Self {
        let (local_sdp, remote_sdp) = match role {
            InviteRole::Client => (non_empty(&invite.body), None),
            InviteRole::Server => (None, non_empty(&invite.body)),
        };
        Self {
            id,
            dialog_id,
            role,
            state,
            invite,
            ack: None,
            local_sdp,
            remote_sdp,
        }
    }

    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn dialog_id(&self) -> &DialogId {
        &self.dialog_id
    }

    pub fn role(&self) -> InviteRole {
        self.role
    }

    pub fn state(&self) -> InviteSessionState {
        self.state
    }

    pub fn local_sdp(&self) -> Option<&Bytes> {
        self.local_sdp.as_ref()
    }

    pub fn remote_sdp(&self) -> Option<&Bytes> {
        self.remote_sdp.as_ref()
    }
}

fn non_empty(body: &Bytes) -> Option<Bytes> {
    (!body.is_empty()).then(|| body.clone())
}

fn sdp() -> MimeType {
    MimeType::new("application", "sdp")
}

impl InviteSessionHandle {
    /// Send a provisional response to the INVITE (server only)
    pub fn provisional(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        dum.invite_provisional(*self, code)
    }

    /// Answer the INVITE or re-INVITE with 200, optionally with an SDP answer
    pub fn accept(&self, dum: &mut DialogUsageManager, answer: Option<Bytes>) -> DumResult<()> {
        dum.invite_accept(*self, answer)
    }

    /// Reject the INVITE or re-INVITE
    pub fn reject(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        dum.invite_reject(*self, code)
    }

    /// End the session: BYE once connected, CANCEL or a rejection before
    pub fn end(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.invite_end(*self)
    }

    pub fn info(
        &self,
        dum: &mut DialogUsageManager,
        content_type: MimeType,
        body: Bytes,
    ) -> DumResult<()> {
        dum.invite_in_dialog_request(*self, Method::Info, Some((content_type, body)), None)
    }

    pub fn message(
        &self,
        dum: &mut DialogUsageManager,
        content_type: MimeType,
        body: Bytes,
    ) -> DumResult<()> {
        dum.invite_in_dialog_request(*self, Method::Message, Some((content_type, body)), None)
    }

    /// Send a REFER inside the session; progress comes back through `on_refer_notify`
    pub fn refer(&self, dum: &mut DialogUsageManager, refer_to: NameAddr) -> DumResult<()> {
        dum.invite_in_dialog_request(*self, Method::Refer, None, Some(refer_to))
    }

    pub fn state(&self, dum: &DialogUsageManager) -> DumResult<InviteSessionState> {
        Ok(dum.registry.get(*self)?.state)
    }
}

impl DialogUsageManager {
    fn invite_handler(&self) -> Option<Arc<dyn InviteSessionHandler>> {
        self.handlers.invite.clone()
    }

    pub(crate) fn create_invite_session(
        &mut self,
        dialog_id: &DialogId,
        role: InviteRole,
        state: InviteSessionState,
        invite: Request,
    ) -> DumResult<InviteSessionHandle> {
        if self.find_dialog(dialog_id).is_none() {
            return Err(DumError::dialog_not_found(dialog_id));
        }
        let owner = dialog_id.clone();
        let handle = self
            .registry
            .insert_with(|id| InviteSession::new(id, owner, role, state, invite));
        if let Some(dialog) = self.dialog_mut(dialog_id) {
            dialog.invite_session = Some(handle);
        }
        debug!("Created {:?} invite session {} on {}", role, handle.id(), dialog_id);
        Ok(handle)
    }

    /// Fire `on_terminated` and destroy the session
    pub(crate) fn finish_invite_session(
        &mut self,
        session: InviteSessionHandle,
        reason: InviteEndReason,
        msg: Option<&Message>,
    ) {
        let Ok(usage) = self.registry.get_mut(session) else {
            return;
        };
        usage.state = InviteSessionState::Terminated;
        info!("Invite session {} terminated: {:?}", session.id(), reason);
        if let Some(handler) = self.invite_handler() {
            handler.on_terminated(self, session, reason, msg);
        }
        self.destroy_usage(session.id());
    }

    fn invite_provisional(
        &mut self,
        session: InviteSessionHandle,
        code: StatusCode,
    ) -> DumResult<()> {
        if !code.is_provisional() {
            return Err(DumError::usage_use(format!("{} is not a provisional status", code)));
        }
        let usage = self.registry.get_mut(session)?;
        if usage.role != InviteRole::Server
            || !matches!(usage.state, InviteSessionState::Offered | InviteSessionState::Proceeding)
        {
            return Err(DumError::usage_use(format!(
                "cannot send provisional in state {:?}",
                usage.state
            )));
        }
        usage.state = InviteSessionState::Proceeding;
        let dialog = dialog_entry(&mut self.dialog_sets, &usage.dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(&usage.dialog_id))?;
        let response = dialog.make_response(&usage.invite, code);
        self.send_response(response);
        Ok(())
    }

    fn invite_accept(
        &mut self,
        session: InviteSessionHandle,
        answer: Option<Bytes>,
    ) -> DumResult<()> {
        let usage = self.registry.get_mut(session)?;
        if usage.role != InviteRole::Server
            || !matches!(
                usage.state,
                InviteSessionState::Offered
                    | InviteSessionState::Proceeding
                    | InviteSessionState::ReOffered
            )
        {
            return Err(DumError::usage_use(format!("cannot accept in state {:?}", usage.state)));
        }
        if answer.is_some() {
            usage.local_sdp = answer;
        }
        let dialog = dialog_entry(&mut self.dialog_sets, &usage.dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(&usage.dialog_id))?;
        let mut response = dialog.make_response(&usage.invite, StatusCode::OK);
        if let Some(body) = &usage.local_sdp {
            response.body = body.clone();
            response.headers.content_type = Some(sdp());
        }
        usage.state = match usage.state {
            InviteSessionState::ReOffered => InviteSessionState::Connected,
            _ => InviteSessionState::Accepted,
        };
        dialog.state = DialogState::Established;
        let set_id = usage.dialog_id.dialog_set_id();
        if let Some(set) = self.dialog_sets.get_mut(&set_id) {
            set.state = DialogSetState::Established;
        }
        self.send_response(response);
        Ok(())
    }

    fn invite_reject(&mut self, session: InviteSessionHandle, code: StatusCode) -> DumResult<()> {
        if code.as_u16() < 300 {
            return Err(DumError::usage_use(format!("{} is not a rejection", code)));
        }
        let usage = self.registry.get_mut(session)?;
        let reoffer = usage.state == InviteSessionState::ReOffered;
        let offered = matches!(
            usage.state,
            InviteSessionState::Offered | InviteSessionState::Proceeding
        );
        if usage.role != InviteRole::Server || !(reoffer || offered) {
            return Err(DumError::usage_use(format!("cannot reject in state {:?}", usage.state)));
        }
        let dialog = dialog_entry(&mut self.dialog_sets, &usage.dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(&usage.dialog_id))?;
        let response = dialog.make_response(&usage.invite, code);
        if reoffer {
            usage.state = InviteSessionState::Connected;
            self.send_response(response);
            return Ok(());
        }
        self.send_response(response);
        self.finish_invite_session(session, InviteEndReason::Rejected, None);
        Ok(())
    }

    fn invite_end(&mut self, session: InviteSessionHandle) -> DumResult<()> {
        let usage = self.registry.get(session)?;
        let dialog_id = usage.dialog_id.clone();
        match (usage.role, usage.state) {
            (_, InviteSessionState::Terminated) => Ok(()),
            (InviteRole::Client, InviteSessionState::Early) => {
                self.end_dialog_set(&dialog_id.dialog_set_id())
            }
            (InviteRole::Server, InviteSessionState::Offered | InviteSessionState::Proceeding) => {
                self.invite_reject(session, StatusCode::TEMPORARILY_UNAVAILABLE)
            }
            _ => {
                let dialog = dialog_entry(&mut self.dialog_sets, &dialog_id)
                    .ok_or_else(|| DumError::dialog_not_found(&dialog_id))?;
                dialog.state = DialogState::Terminating;
                let bye = dialog.make_request(Method::Bye, &self.config);
                self.send_request(bye)?;
                self.finish_invite_session(session, InviteEndReason::LocalBye, None);
                Ok(())
            }
        }
    }

    fn invite_in_dialog_request(
        &mut self,
        session: InviteSessionHandle,
        method: Method,
        body: Option<(MimeType, Bytes)>,
        refer_to: Option<NameAddr>,
    ) -> DumResult<()> {
        let usage = self.registry.get(session)?;
        if !matches!(usage.state, InviteSessionState::Connected | InviteSessionState::Accepted) {
            return Err(DumError::usage_use(format!(
                "cannot send {} in state {:?}",
                method, usage.state
            )));
        }
        let dialog_id = usage.dialog_id.clone();
        let dialog = dialog_entry(&mut self.dialog_sets, &dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(&dialog_id))?;
        let mut request = dialog.make_request(method, &self.config);
        if let Some((content_type, body)) = body {
            request.headers.content_type = Some(content_type);
            request.body = body;
        }
        request.headers.refer_to = refer_to;
        self.send_request(request).map(|_| ())
    }

    /// A new INVITE opened a server dialog set
    pub(crate) fn start_server_invite(
        &mut self,
        set_id: &DialogSetId,
        invite: Request,
    ) -> DumResult<()> {
        let handler = self.invite_handler().ok_or(DumError::MissingHandler {
            role: "invite session",
            key: "INVITE".into(),
        })?;
        let dialog = Dialog::new_uas(
            DialogType::Invitation,
            &invite,
            &set_id.local_tag,
            self.config.local_contact.clone(),
        )?;
        let dialog_id = dialog.id.clone();
        let set = self
            .dialog_sets
            .get_mut(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        set.dialogs.insert(dialog_id.clone(), dialog);

        let session = self.create_invite_session(
            &dialog_id,
            InviteRole::Server,
            InviteSessionState::Offered,
            invite.clone(),
        )?;
        handler.on_new_server_session(self, session, &invite);
        Ok(())
    }

    /// A request inside an invite dialog
    pub(crate) fn dispatch_invite_request(
        &mut self,
        session: InviteSessionHandle,
        request: Request,
    ) -> DumResult<()> {
        let handler = self.invite_handler();
        let usage = self.registry.get_mut(session)?;
        let dialog_id = usage.dialog_id.clone();
        let state = usage.state;

        match request.method {
            Method::Invite => {
                if state != InviteSessionState::Connected {
                    let response =
                        self.dialog_response(&dialog_id, &request, StatusCode::REQUEST_PENDING)?;
                    self.send_response(response);
                    return Ok(());
                }
                usage.state = InviteSessionState::ReOffered;
                usage.invite = request.clone();
                if !request.body.is_empty() {
                    usage.remote_sdp = Some(request.body.clone());
                }
                if let Some(dialog) = self.dialog_mut(&dialog_id) {
                    dialog.update_remote_target(request.headers.contact.first());
                }
                match handler {
                    Some(handler) => handler.on_offer(self, session, &request),
                    None => self.invite_accept(session, None)?,
                }
            }
            Method::Ack => {
                if state == InviteSessionState::Accepted {
                    usage.state = InviteSessionState::Connected;
                    if !request.body.is_empty() {
                        usage.remote_sdp = Some(request.body.clone());
                    }
                    if let Some(handler) = handler {
                        handler.on_connected(self, session, &Message::Request(request));
                    }
                }
            }
            Method::Bye => {
                let response = self.dialog_response(&dialog_id, &request, StatusCode::OK)?;
                self.send_response(response);
                self.finish_invite_session(
                    session,
                    InviteEndReason::RemoteBye,
                    Some(&Message::Request(request)),
                );
            }
            Method::Cancel => {
                let cancelled =
                    matches!(state, InviteSessionState::Offered | InviteSessionState::Proceeding);
                let response = self.dialog_response(&dialog_id, &request, StatusCode::OK)?;
                self.send_response(response);
                if cancelled {
                    let invite = usage_invite(self, session)?;
                    let terminated =
                        self.dialog_response(&dialog_id, &invite, StatusCode::REQUEST_TERMINATED)?;
                    self.send_response(terminated);
                    self.finish_invite_session(
                        session,
                        InviteEndReason::Cancelled,
                        Some(&Message::Request(request)),
                    );
                }
            }
            Method::Info | Method::Message => {
                let response = self.dialog_response(&dialog_id, &request, StatusCode::OK)?;
                self.send_response(response);
                if let Some(handler) = handler {
                    match request.method {
                        Method::Info => handler.on_info(self, session, &request),
                        _ => handler.on_message(self, session, &request),
                    }
                }
            }
            Method::Update | Method::Prack => {
                let response = self.dialog_response(&dialog_id, &request, StatusCode::OK)?;
                self.send_response(response);
            }
            Method::Notify => {
                let response = self.dialog_response(&dialog_id, &request, StatusCode::OK)?;
                self.send_response(response);
                let status = sipfrag_status(&request.body);
                if let Some(handler) = handler {
                    handler.on_refer_notify(self, session, &request, status);
                }
            }
            _ => {
                let response =
                    self.dialog_response(&dialog_id, &request, StatusCode::NOT_IMPLEMENTED)?;
                self.send_response(response);
            }
        }
        Ok(())
    }

    /// Response to a request we sent inside an established invite dialog
    pub(crate) fn dispatch_invite_response(
        &mut self,
        session: InviteSessionHandle,
        response: Response,
    ) -> DumResult<()> {
        self.registry.get(session)?;
        if !response.status.is_failure() {
            return Ok(());
        }
        let disposition = FailureDisposition::for_status(response.status);
        let msg = Message::Response(response);
        match disposition {
            FailureDisposition::Transaction => {
                debug!("In-dialog request of session {} failed: {}", session.id(), msg.brief());
            }
            FailureDisposition::Usage => {
                self.finish_invite_session(session, InviteEndReason::Error, Some(&msg))
            }
            FailureDisposition::Dialog => {
                let dialog_id = self.registry.get(session)?.dialog_id.clone();
                self.terminate_dialog_usages(&dialog_id, Some(&msg));
            }
        }
        Ok(())
    }

    /// Response to the INVITE of a client dialog set
    pub(crate) fn on_invite_response(
        &mut self,
        set_id: &DialogSetId,
        response: Response,
    ) -> DumResult<()> {
        let code = response.status;
        let set = self
            .dialog_sets
            .get_mut(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;

        if code.is_provisional() {
            match set.state {
                DialogSetState::WaitingToEnd => {
                    set.state = DialogSetState::Cancelling;
                    let cancel = set.creator.as_ref().map(|c| make_cancel(c.last_request()));
                    if let Some(cancel) = cancel {
                        self.send_request(cancel)?;
                    }
                    return Ok(());
                }
                DialogSetState::Cancelling | DialogSetState::Terminating => return Ok(()),
                DialogSetState::Initial => set.state = DialogSetState::ReceivedProvisional,
                _ => {}
            }
            if code == StatusCode::TRYING {
                return Ok(());
            }
            return self.on_invite_provisional(set_id, response);
        }
        if code.is_success() {
            return self.on_invite_success(set_id, response);
        }
        self.on_invite_failure(set_id, response)
    }

    fn on_invite_provisional(&mut self, set_id: &DialogSetId, response: Response) -> DumResult<()> {
        let Some(dialog_id) = DialogId::from_uac_response(&response) else {
            return Ok(());
        };
        let handler = self.invite_handler();
        let existing = self.find_dialog(&dialog_id).and_then(|d| d.invite_session);
        let session = match existing {
            Some(session) => {
                if let Some(dialog) = self.dialog_mut(&dialog_id) {
                    dialog.update_remote_target(response.headers.contact.first());
                }
                session
            }
            None => {
                let session = self.create_early_session(set_id, &dialog_id, &response)?;
                if let Some(handler) = &handler {
                    handler.on_new_client_session(self, session, &response);
                }
                session
            }
        };
        if let Some(handler) = handler {
            if session.is_valid(self) {
                handler.on_provisional(self, session, &response);
            }
        }
        Ok(())
    }

    fn create_early_session(
        &mut self,
        set_id: &DialogSetId,
        dialog_id: &DialogId,
        response: &Response,
    ) -> DumResult<InviteSessionHandle> {
        let set = self
            .dialog_sets
            .get_mut(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        let invite = set
            .creator
            .as_ref()
            .map(|c| c.last_request().clone())
            .ok_or_else(|| DumError::internal("invite dialog set without creator"))?;
        if !set.dialogs.contains_key(dialog_id) {
            let dialog = Dialog::new_uac(DialogType::Invitation, &invite, response)?;
            set.dialogs.insert(dialog_id.clone(), dialog);
        }
        self.create_invite_session(dialog_id, InviteRole::Client, InviteSessionState::Early, invite)
    }

    fn on_invite_success(&mut self, set_id: &DialogSetId, response: Response) -> DumResult<()> {
        let Some(dialog_id) = DialogId::from_uac_response(&response) else {
            warn!("2xx to INVITE without To tag, dropping");
            return Ok(());
        };
        let set = self
            .dialog_sets
            .get(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        let connected_elsewhere = set
            .dialogs
            .values()
            .any(|d| d.id != dialog_id && d.state == DialogState::Established);
        let ending = set.is_ending();
        let existing = set.dialogs.get(&dialog_id).and_then(|d| d.invite_session);

        if let Some(session) = existing {
            let usage = self.registry.get(session)?;
            if usage.state == InviteSessionState::Connected {
                // 2xx retransmission
                if let Some(ack) = usage.ack.clone() {
                    self.send_request(ack)?;
                }
                return Ok(());
            }
        }
        if ending || connected_elsewhere {
            return self.ack_and_bye(set_id, &dialog_id, response);
        }

        let handler = self.invite_handler();
        let (session, created) = match existing {
            Some(session) => (session, false),
            None => (self.create_early_session(set_id, &dialog_id, &response)?, true),
        };
        let dialog = dialog_entry(&mut self.dialog_sets, &dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(&dialog_id))?;
        dialog.confirm(&response);
        let ack = dialog.make_request(Method::Ack, &self.config);

        let usage = self.registry.get_mut(session)?;
        usage.state = InviteSessionState::Connected;
        usage.ack = Some(ack.clone());
        if !response.body.is_empty() {
            usage.remote_sdp = Some(response.body.clone());
        }
        if let Some(set) = self.dialog_sets.get_mut(set_id) {
            set.state = DialogSetState::Established;
        }
        self.send_request(ack)?;

        // the other early dialogs of the set lost the race
        let losers: Vec<InviteSessionHandle> = self
            .dialog_sets
            .get(set_id)
            .map(|s| {
                s.dialogs
                    .values()
                    .filter(|d| d.id != dialog_id && d.state == DialogState::Forming)
                    .filter_map(|d| d.invite_session)
                    .collect()
            })
            .unwrap_or_default();
        for loser in losers {
            self.finish_invite_session(loser, InviteEndReason::Forked, None);
        }

        if let Some(handler) = handler {
            if created {
                handler.on_new_client_session(self, session, &response);
            }
            if session.is_valid(self) {
                handler.on_connected(self, session, &Message::Response(response));
            }
        }
        Ok(())
    }

    /// Acknowledge and immediately hang up a 2xx nobody wants
    fn ack_and_bye(
        &mut self,
        set_id: &DialogSetId,
        dialog_id: &DialogId,
        response: Response,
    ) -> DumResult<()> {
        info!("Unwanted 2xx on {}, sending ACK and BYE", dialog_id);
        let existing = self.find_dialog(dialog_id).map(|d| d.invite_session);
        let (ack, bye, session) = match existing {
            Some(session) => {
                let dialog = dialog_entry(&mut self.dialog_sets, dialog_id)
                    .ok_or_else(|| DumError::dialog_not_found(dialog_id))?;
                dialog.confirm(&response);
                dialog.state = DialogState::Terminating;
                let ack = dialog.make_request(Method::Ack, &self.config);
                let bye = dialog.make_request(Method::Bye, &self.config);
                (ack, bye, session)
            }
            None => {
                let invite = self
                    .find_creator(set_id)
                    .map(|c| c.last_request().clone())
                    .ok_or_else(|| DumError::internal("invite dialog set without creator"))?;
                let mut dialog = Dialog::new_uac(DialogType::Invitation, &invite, &response)?;
                dialog.confirm(&response);
                let ack = dialog.make_request(Method::Ack, &self.config);
                let bye = dialog.make_request(Method::Bye, &self.config);
                (ack, bye, None)
            }
        };
        self.send_request(ack)?;
        self.send_request(bye)?;
        match session {
            Some(session) => self.finish_invite_session(session, InviteEndReason::LocalBye, None),
            None => self.possibly_die_dialog(dialog_id),
        }
        Ok(())
    }

    fn on_invite_failure(&mut self, set_id: &DialogSetId, response: Response) -> DumResult<()> {
        let set = self
            .dialog_sets
            .get(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        let cancelled =
            matches!(set.state, DialogSetState::Cancelling | DialogSetState::WaitingToEnd);
        let sessions: Vec<InviteSessionHandle> = set
            .dialogs
            .values()
            .filter(|d| d.state == DialogState::Forming)
            .filter_map(|d| d.invite_session)
            .collect();
        let handler = self.invite_handler();
        let code = response.status;

        if sessions.is_empty() {
            if let Some(handler) = handler {
                handler.on_failure(self, set_id, &response);
            }
        } else {
            let reason = if code.is_redirection() {
                InviteEndReason::Redirected
            } else if cancelled || code == StatusCode::REQUEST_TERMINATED {
                InviteEndReason::Cancelled
            } else {
                InviteEndReason::Rejected
            };
            let msg = Message::Response(response.clone());
            for session in sessions {
                if code.is_redirection() {
                    if let Some(handler) = &handler {
                        handler.on_redirected(self, session, &response);
                    }
                }
                self.finish_invite_session(session, reason, Some(&msg));
            }
        }
        self.possibly_die_set(set_id);
        Ok(())
    }

    /// Response built by the dialog a request arrived on
    pub(crate) fn dialog_response(
        &self,
        dialog_id: &DialogId,
        request: &Request,
        code: StatusCode,
    ) -> DumResult<Response> {
        let dialog = self
            .find_dialog(dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(dialog_id))?;
        Ok(dialog.make_response(request, code))
    }
}

fn usage_invite(dum: &DialogUsageManager, session: InviteSessionHandle) -> DumResult<Request> {
    Ok(dum.registry.get(session)?.invite.clone())
}
