//! Inbound response demultiplexing
//!
//! Responses find their dialog set through Call-ID and From tag. A 401/407
//! is answered with credentials when the client auth manager can, otherwise
//! it is treated like any other failure. The initial request's answer goes
//! to the usage type the set was created for; answers to in-dialog requests
//! are matched to the request we sent by CSeq.

use tracing::{debug, trace, warn};

use sipdum_message::{Method, Response, StatusCode};

use super::{dialog_entry, DialogUsageManager};
use crate::dialog::{CreatorKind, DialogId, DialogSetId};
use crate::errors::DumResult;

impl DialogUsageManager {
    pub(crate) fn process_response(&mut self, response: Response) {
        trace!("Received {} {}", response.status, response.reason);
        let Some(method) = response.method().cloned() else {
            warn!("Response without CSeq, dropping");
            return;
        };
        if method == Method::Cancel {
            return;
        }
        if let Some(branch) = response.headers.branch().map(str::to_string) {
            if self.pending_identity.contains_key(&branch) {
                self.on_identity_probe_response(&branch, response);
                return;
            }
        }
        let Some(set_id) = DialogSetId::from_uac_response(&response) else {
            debug!("Response without From tag, dropping");
            return;
        };
        if !self.dialog_sets.contains_key(&set_id) {
            debug!("Stray {} to {} for {}", response.status, method, set_id);
            return;
        }

        let code = response.status;
        if code == StatusCode::UNAUTHORIZED || code == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
            match self.try_auth_retry(&set_id, &response) {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => warn!("Credentialed retry failed: {}", e),
            }
        }

        let seq = response.headers.cseq_seq();
        let creator_kind = self.dialog_sets.get_mut(&set_id).and_then(|set| {
            let creator = set.creator.as_ref()?;
            let answers_creator = creator.method() == &method && creator.matches_cseq(seq);
            if answers_creator && code.is_final() {
                set.awaiting_final = false;
            }
            answers_creator.then_some(creator.kind)
        });

        let result = match creator_kind {
            Some(CreatorKind::Invite) => self.on_invite_response(&set_id, response),
            Some(CreatorKind::Subscription) => {
                self.on_subscribe_creator_response(&set_id, response)
            }
            Some(CreatorKind::Registration) => self.on_registration_response(&set_id, response),
            Some(CreatorKind::Publication) => self.on_publication_response(&set_id, response),
            Some(CreatorKind::OutOfDialog) => self.on_ood_response(&set_id, response),
            None => self.dispatch_in_dialog_response(response),
        };
        if let Err(e) = result {
            if e.is_stale_handle() {
                trace!("Usage gone before its response: {}", e);
            } else {
                warn!("Handling {} for {} failed: {}", code, set_id, e);
            }
        }
        self.possibly_die_set(&set_id);
    }

    /// Re-send the challenged request with credentials; `true` when sent
    fn try_auth_retry(&mut self, set_id: &DialogSetId, response: &Response) -> DumResult<bool> {
        let Some(auth) = self.handlers.client_auth.clone() else {
            return Ok(false);
        };

        // in-dialog request first
        if let Some(dialog_id) = DialogId::from_uac_response(response) {
            if let Some(dialog) = dialog_entry(&mut self.dialog_sets, &dialog_id) {
                if let Some(retry) = dialog.auth_retry(response, auth.as_ref()) {
                    self.send_request(retry)?;
                    return Ok(true);
                }
            }
        }

        let answers_creator = self
            .find_creator(set_id)
            .map(|c| {
                response.method() == Some(c.method())
                    && c.matches_cseq(response.headers.cseq_seq())
            })
            .unwrap_or(false);
        if !answers_creator {
            return Ok(false);
        }
        let mut retry = self.next_creator_request(set_id)?;
        if !auth.handle_challenge(&mut retry, response) {
            debug!("No credentials for {} challenge", response.status);
            return Ok(false);
        }
        debug!("Retrying initial {} with credentials", retry.method);
        self.send_request(retry)?;
        Ok(true)
    }

    /// Answer to a request sent inside a dialog
    fn dispatch_in_dialog_response(&mut self, response: Response) -> DumResult<()> {
        let Some(dialog_id) = DialogId::from_uac_response(&response) else {
            return Ok(());
        };
        let Some(seq) = response.headers.cseq_seq() else {
            return Ok(());
        };
        let Some(dialog) = dialog_entry(&mut self.dialog_sets, &dialog_id) else {
            debug!("Response {} for unknown dialog {}", response.status, dialog_id);
            return Ok(());
        };
        let request = if response.status.is_final() {
            dialog.requests.remove(&seq)
        } else {
            dialog.requests.get(&seq).cloned()
        };
        let invite = dialog.invite_session;
        let Some(request) = request else {
            trace!("No pending request {} on {}", seq, dialog_id);
            return Ok(());
        };

        match request.method {
            Method::Subscribe | Method::Refer => {
                let event = match request.method {
                    Method::Refer => "refer",
                    _ => request.headers.event_type().unwrap_or_default(),
                };
                let id = match request.method {
                    Method::Refer => None,
                    _ => request.headers.event_id(),
                };
                match self.find_client_subscription(&dialog_id, event, id) {
                    Some(sub) => self.dispatch_client_subscription_response(sub, response),
                    None => match invite {
                        Some(session) => self.dispatch_invite_response(session, response),
                        None => Ok(()),
                    },
                }
            }
            Method::Notify => {
                let event = request.headers.event_type().unwrap_or_default();
                match self.find_server_subscription(&dialog_id, event, request.headers.event_id()) {
                    Some(sub) => self.dispatch_server_subscription_response(sub, response),
                    None => Ok(()),
                }
            }
            _ => match invite {
                Some(session) => self.dispatch_invite_response(session, response),
                None => Ok(()),
            },
        }
    }
}
