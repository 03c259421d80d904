//! Inbound request demultiplexing
//!
//! ```text
//! request ─▶ validate ─▶ authenticate ─▶ identity ─▶ dispatch_request
//!                                                      │
//!               no To tag ◀────────────────────────────┴──────▶ To tag
//!      new DialogSet + start_* usage            DialogSet ─▶ Dialog ─▶ usage
//! ```
//!
//! Requests without a To tag either open a new dialog set or are answered
//! here (481 for orphan BYE/PRACK/UPDATE, 489 for unknown event packages,
//! CANCEL routed to its INVITE). Requests with a To tag must find their
//! dialog set and dialog; a NOTIFY that overtakes the 2xx of our SUBSCRIBE
//! creates the dialog on the spot.

use tracing::{debug, trace, warn};

use sipdum_message::{Method, Request, StatusCode};

use super::DialogUsageManager;
use crate::dialog::dialog_utils::generate_tag;
use crate::dialog::{CreatorKind, Dialog, DialogId, DialogSet, DialogSetId};
use crate::errors::{DumError, DumResult};
use crate::usage::out_of_dialog::add_capabilities;

impl DialogUsageManager {
    pub(crate) fn process_request(&mut self, request: Request) {
        trace!("Received {} {}", request.method, request.uri);
        if !self.validate_request(&request) {
            return;
        }
        let Some(request) = self.authenticate_request(request) else {
            return;
        };
        self.check_identity(request);
    }

    /// Last step of the pipeline, after validation, authentication and identity
    pub(crate) fn dispatch_request(&mut self, request: Request) {
        if request.headers.to_tag().is_none() {
            self.dispatch_initial_request(request);
        } else {
            self.dispatch_in_dialog(request);
        }
    }

    fn dispatch_initial_request(&mut self, request: Request) {
        match request.method {
            Method::Ack => trace!("Dropping ACK without To tag"),
            Method::Bye | Method::Prack | Method::Update => {
                debug!("{} outside any dialog", request.method);
                self.reply(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
            }
            Method::Cancel => self.dispatch_cancel(request),
            Method::Info | Method::Notify => {
                if self.handlers.server_out_of_dialog.contains_key(&request.method) {
                    self.start_server_dialog_set(request);
                } else {
                    self.reply(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
                }
            }
            Method::Invite => {
                if self.handlers.invite.is_none() {
                    self.reply(&request, StatusCode::NOT_IMPLEMENTED);
                } else {
                    self.start_server_dialog_set(request);
                }
            }
            Method::Subscribe => {
                let handled = request
                    .headers
                    .event_type()
                    .map(|event| self.handlers.server_subscription.contains_key(event))
                    .unwrap_or(false);
                if handled {
                    self.start_server_dialog_set(request);
                } else {
                    debug!("No notifier for event {:?}", request.headers.event_type());
                    self.reply(&request, StatusCode::BAD_EVENT);
                }
            }
            Method::Refer => self.start_server_dialog_set(request),
            Method::Register => {
                if self.handlers.server_registration.is_none() {
                    self.reply(&request, StatusCode::NOT_IMPLEMENTED);
                } else {
                    self.start_server_dialog_set(request);
                }
            }
            Method::Publish => self.dispatch_publish(request),
            _ => {
                if self.handlers.server_out_of_dialog.contains_key(&request.method) {
                    self.start_server_dialog_set(request);
                } else if request.method == Method::Options {
                    let mut response = self.make_reply(&request, StatusCode::OK);
                    add_capabilities(&mut response, &self.config);
                    self.reply_with(&request, response);
                } else {
                    let mut response = self.make_reply(&request, StatusCode::METHOD_NOT_ALLOWED);
                    response.headers.allow = self.config.supported_methods.clone();
                    self.reply_with(&request, response);
                }
            }
        }
    }

    /// CANCEL of an INVITE that opened a server dialog set
    fn dispatch_cancel(&mut self, cancel: Request) {
        let session = cancel
            .headers
            .call_id
            .clone()
            .zip(cancel.headers.from_tag().map(str::to_string))
            .and_then(|key| self.uas_sets.get(&key).cloned())
            .and_then(|set_id| self.dialog_sets.get_mut(&set_id))
            .and_then(|set| set.uas_dialog_mut())
            .and_then(|dialog| dialog.invite_session);
        match session {
            Some(session) => {
                if let Err(e) = self.dispatch_invite_request(session, cancel) {
                    warn!("CANCEL handling failed: {}", e);
                }
            }
            None => {
                debug!("CANCEL matches no INVITE");
                self.reply(&cancel, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
            }
        }
    }

    /// PUBLISH: a refresh of a known entity tag, or a new publication
    fn dispatch_publish(&mut self, request: Request) {
        let handled = request
            .headers
            .event_type()
            .map(|event| self.handlers.server_publication.contains_key(event))
            .unwrap_or(false);
        if !handled {
            self.reply(&request, StatusCode::BAD_EVENT);
            return;
        }
        let Some(etag) = request.headers.sip_if_match.clone() else {
            self.start_server_dialog_set(request);
            return;
        };
        match self.publications.get(&etag).copied() {
            Some(publication) => {
                if let Err(e) = self.dispatch_server_publication_refresh(publication, request) {
                    warn!("PUBLISH refresh of {} failed: {}", etag, e);
                }
            }
            None => {
                debug!("PUBLISH for unknown entity tag {}", etag);
                self.reply(&request, StatusCode::CONDITIONAL_REQUEST_FAILED);
            }
        }
    }

    /// Open a server dialog set for a request and hand it to its usage
    fn start_server_dialog_set(&mut self, request: Request) {
        let key = match (request.headers.call_id.clone(), request.headers.from_tag()) {
            (Some(call_id), Some(from_tag)) => (call_id, from_tag.to_string()),
            _ => {
                self.reply(&request, StatusCode::BAD_REQUEST);
                return;
            }
        };
        let set_id = DialogSetId::new(key.0.clone(), generate_tag());
        let app = self
            .handlers
            .app_dialog_set_factory
            .clone()
            .and_then(|factory| factory.create(&request));
        debug!("New server dialog set {} for {}", set_id, request.method);
        self.dialog_sets
            .insert(set_id.clone(), DialogSet::new_uas(set_id.clone(), key.clone(), app));
        self.uas_sets.insert(key, set_id.clone());

        let template = request.clone();
        let result = match request.method {
            Method::Invite => self.start_server_invite(&set_id, request),
            Method::Subscribe | Method::Refer => self.start_server_subscription(&set_id, request),
            Method::Register => self.start_server_registration(&set_id, request),
            Method::Publish => self.start_server_publication(&set_id, request),
            _ => self.start_server_ood(&set_id, request),
        };
        match result {
            Ok(()) => self.possibly_die_set(&set_id),
            Err(e) => {
                warn!("Could not start {} usage: {}", template.method, e);
                let response = self
                    .make_set_response(&set_id, &template, StatusCode::BAD_REQUEST)
                    .with_reason(e.to_string());
                self.reply_with(&template, response);
                self.discard_dialog_set(&set_id);
            }
        }
    }

    fn dispatch_in_dialog(&mut self, request: Request) {
        let (Some(set_id), Some(dialog_id)) = (
            DialogSetId::from_uas_request(&request),
            DialogId::from_uas_request(&request),
        ) else {
            self.reply(&request, StatusCode::BAD_REQUEST);
            return;
        };
        if !self.dialog_sets.contains_key(&set_id) {
            debug!("{} for unknown dialog set {}", request.method, set_id);
            self.reply(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
            return;
        }

        if self.find_dialog(&dialog_id).is_none() {
            let initial = self
                .find_creator(&set_id)
                .filter(|c| c.kind == CreatorKind::Subscription && request.method == Method::Notify)
                .map(|c| c.last_request().clone());
            let Some(initial) = initial else {
                debug!("{} for unknown dialog {}", request.method, dialog_id);
                self.reply(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
                return;
            };
            // NOTIFY ahead of the 2xx: it forms the dialog
            match Dialog::new_uac_from_notify(&initial, &request) {
                Ok(dialog) => {
                    if let Some(set) = self.dialog_sets.get_mut(&set_id) {
                        set.dialogs.insert(dialog_id.clone(), dialog);
                    }
                }
                Err(e) => {
                    warn!("Cannot form dialog from NOTIFY: {}", e);
                    self.reply(&request, StatusCode::BAD_REQUEST);
                    return;
                }
            }
        }

        if let Err(e) = self.dispatch_in_dialog_request(&dialog_id, request) {
            if e.is_stale_handle() {
                trace!("Usage gone while dispatching: {}", e);
            } else {
                warn!("In-dialog request failed on {}: {}", dialog_id, e);
            }
        }
        self.possibly_die_dialog(&dialog_id);
    }

    fn dispatch_in_dialog_request(
        &mut self,
        dialog_id: &DialogId,
        request: Request,
    ) -> DumResult<()> {
        let dialog = self
            .dialog_mut(dialog_id)
            .ok_or_else(|| DumError::dialog_not_found(dialog_id))?;
        if !dialog.accept_remote_cseq(&request) {
            debug!("Out of order CSeq {:?} on {}", request.headers.cseq_seq(), dialog_id);
            let response = dialog
                .make_response(&request, StatusCode::SERVER_INTERNAL_ERROR)
                .with_reason("CSeq Out Of Order");
            self.send_response(response);
            return Ok(());
        }
        let invite = dialog.invite_session;

        match request.method {
            Method::Invite
            | Method::Ack
            | Method::Bye
            | Method::Cancel
            | Method::Update
            | Method::Info
            | Method::Prack
            | Method::Message => match invite {
                Some(session) => self.dispatch_invite_request(session, request),
                None => {
                    self.reply(&request, StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST);
                    Ok(())
                }
            },
            Method::Subscribe => {
                let Some(event) = request.headers.event_type().map(str::to_string) else {
                    let response =
                        self.dialog_response(dialog_id, &request, StatusCode::BAD_EVENT)?;
                    self.send_response(response);
                    return Ok(());
                };
                let existing =
                    self.find_server_subscription(dialog_id, &event, request.headers.event_id());
                let sub = match existing {
                    Some(sub) => sub,
                    None => self.create_server_subscription(dialog_id, &request)?,
                };
                self.dispatch_server_subscription_request(sub, request)
            }
            Method::Refer => {
                let sub = self.create_server_subscription(dialog_id, &request)?;
                self.dispatch_server_subscription_request(sub, request)
            }
            Method::Notify => {
                let existing = request
                    .headers
                    .event_type()
                    .and_then(|event| {
                        self.find_client_subscription(dialog_id, event, request.headers.event_id())
                    });
                if let Some(sub) = existing {
                    return self.dispatch_client_subscription_notify(sub, request);
                }
                let subscribing = self
                    .find_creator(&dialog_id.dialog_set_id())
                    .map(|c| c.kind == CreatorKind::Subscription)
                    .unwrap_or(false);
                match invite {
                    _ if subscribing => self.adopt_client_subscription(dialog_id, request),
                    Some(session) => self.dispatch_invite_request(session, request),
                    None => {
                        let response = self.dialog_response(
                            dialog_id,
                            &request,
                            StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST,
                        )?;
                        self.send_response(response);
                        Ok(())
                    }
                }
            }
            _ => {
                let mut response =
                    self.dialog_response(dialog_id, &request, StatusCode::METHOD_NOT_ALLOWED)?;
                response.headers.allow = self.config.supported_methods.clone();
                self.send_response(response);
                Ok(())
            }
        }
    }
}
