//! REGISTER usages (RFC 3261 §10)
//!
//! A [`ClientRegistration`] keeps one binding alive: it is created by the
//! first final response to our REGISTER, refreshes itself a bit before the
//! granted expiry and removes the binding with `Expires: 0` on `end`.
//! A [`ServerRegistration`] lives only until the application answers the
//! REGISTER it was created for.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use sipdum_message::{NameAddr, Request, Response, StatusCode};

use super::{ClientRegistrationHandle, ServerRegistrationHandle, UsageId};
use crate::dialog::dialog_utils::a_bit_smaller_than;
use crate::dialog::DialogSetId;
use crate::errors::{DumError, DumResult};
use crate::handlers::ClientRegistrationHandler;
use crate::manager::DialogUsageManager;
use crate::timer::TimeoutKind;

#[derive(Debug, Clone)]
pub struct ClientRegistration {
    pub(crate) id: UsageId,
    pub(crate) set_id: DialogSetId,
    /// Bindings reported by the registrar
    pub(crate) contacts: Vec<NameAddr>,
    pub(crate) expires: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_seq: u64,
    /// Un-REGISTER sent
    pub(crate) ending: bool,
}

impl ClientRegistration {
    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn contacts(&self) -> &[NameAddr] {
        &self.contacts
    }

    pub fn time_left(&self) -> u32 {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }
}

impl ClientRegistrationHandle {
    /// Re-send the REGISTER now
    pub fn refresh(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.registration_refresh(*self, None)
    }

    /// Remove the binding; the usage ends with the registrar's answer
    pub fn end(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.registration_end(*self)
    }

    pub fn contacts(&self, dum: &DialogUsageManager) -> DumResult<Vec<NameAddr>> {
        Ok(dum.registry.get(*self)?.contacts.clone())
    }

    pub fn time_left(&self, dum: &DialogUsageManager) -> DumResult<u32> {
        Ok(dum.registry.get(*self)?.time_left())
    }
}

#[derive(Debug, Clone)]
pub struct ServerRegistration {
    pub(crate) id: UsageId,
    pub(crate) set_id: DialogSetId,
    pub(crate) request: Request,
}

impl ServerRegistration {
    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Address-of-record being registered
    pub fn aor(&self) -> Option<String> {
        self.request.headers.to.as_ref().map(|to| to.uri.aor())
    }
}

impl ServerRegistrationHandle {
    /// 200 echoing the requested bindings
    pub fn accept(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        let usage = dum.registry.get(*self)?;
        let mut response = dum.make_set_response(&usage.set_id, &usage.request, StatusCode::OK);
        response.headers.contact = usage.request.headers.contact.clone();
        response.headers.expires = usage.request.headers.expires;
        dum.server_registration_answer(*self, response)
    }

    pub fn reject(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        if code.as_u16() < 300 {
            return Err(DumError::usage_use(format!("{} is not a rejection", code)));
        }
        let usage = dum.registry.get(*self)?;
        let response = dum.make_set_response(&usage.set_id, &usage.request, code);
        dum.server_registration_answer(*self, response)
    }

    /// Answer with an application-built response
    pub fn send(&self, dum: &mut DialogUsageManager, response: Response) -> DumResult<()> {
        dum.server_registration_answer(*self, response)
    }
}

/// Duration a REGISTER asks for: Expires header, else the first contact's parameter
fn requested_expires(request: &Request) -> Option<u32> {
    request.headers.expires.or_else(|| {
        request
            .headers
            .contact
            .first()
            .and_then(|c| c.params.get("expires"))
            .and_then(|v| v.parse().ok())
    })
}

impl DialogUsageManager {
    fn client_registration_handler(&self) -> Option<Arc<dyn ClientRegistrationHandler>> {
        self.handlers.client_registration.clone()
    }

    fn client_registration_for(
        &mut self,
        set_id: &DialogSetId,
    ) -> DumResult<ClientRegistrationHandle> {
        let set = self
            .dialog_sets
            .get(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        if let Some(id) = set.dialogless {
            let handle = crate::usage::Handle::from_id(id);
            if self.registry.get(handle).is_ok() {
                return Ok(handle);
            }
        }
        let owner = set_id.clone();
        let handle = self.registry.insert_with(|id| ClientRegistration {
            id,
            set_id: owner,
            contacts: Vec::new(),
            expires: 0,
            deadline: None,
            timer_seq: 0,
            ending: false,
        });
        if let Some(set) = self.dialog_sets.get_mut(set_id) {
            set.dialogless = Some(handle.id());
        }
        debug!("Created client registration {} for {}", handle.id(), set_id);
        Ok(handle)
    }

    /// Final response to our REGISTER
    pub(crate) fn on_registration_response(
        &mut self,
        set_id: &DialogSetId,
        response: Response,
    ) -> DumResult<()> {
        let code = response.status;
        if code.is_provisional() {
            return Ok(());
        }
        let reg = self.client_registration_for(set_id)?;
        let Some(handler) = self.client_registration_handler() else {
            self.destroy_usage(reg.id());
            return Ok(());
        };

        if code.is_success() {
            let usage = self.registry.get_mut(reg)?;
            if usage.ending {
                handler.on_removed(self, reg, &response);
                self.destroy_usage(reg.id());
                return Ok(());
            }
            if self.is_set_ending(set_id) {
                debug!("Registration {} answered after its set was ended, removing", reg.id());
                return self.registration_end(reg);
            }
            let requested =
                self.find_creator(set_id).and_then(|c| requested_expires(c.last_request()));
            let usage = self.registry.get_mut(reg)?;
            let granted = response
                .headers
                .expires
                .or(requested)
                .unwrap_or(self.config.default_registration_expires);
            usage.contacts = response.headers.contact.clone();
            usage.expires = granted;
            usage.deadline = Some(Instant::now() + Duration::from_secs(granted as u64));
            if granted > 0 {
                let after = a_bit_smaller_than(granted, self.config.max_refresh_jitter_secs);
                self.schedule_usage_timer(
                    reg.id(),
                    TimeoutKind::RegistrationRefresh,
                    Duration::from_secs(after as u64),
                )?;
            }
            handler.on_success(self, reg, &response);
            return Ok(());
        }

        if code == StatusCode::INTERVAL_TOO_BRIEF {
            if let Some(min) = response.headers.min_expires {
                debug!("Registrar wants at least {} s", min);
                return self.registration_refresh(reg, Some(min));
            }
        }
        if let Some(retry_after) = response.headers.retry_after {
            if let Some(delay) = handler.on_request_retry(self, reg, retry_after, &response) {
                self.schedule_usage_timer(
                    reg.id(),
                    TimeoutKind::RegistrationRefresh,
                    Duration::from_secs(delay as u64),
                )?;
                return Ok(());
            }
        }
        info!("Registration {} failed: {}", reg.id(), code);
        handler.on_failure(self, reg, &response);
        self.destroy_usage(reg.id());
        Ok(())
    }

    fn registration_refresh(
        &mut self,
        reg: ClientRegistrationHandle,
        expires: Option<u32>,
    ) -> DumResult<()> {
        let usage = self.registry.get(reg)?;
        if usage.ending {
            return Err(DumError::usage_use("registration is being removed"));
        }
        let set_id = usage.set_id.clone();
        let current = usage.expires;
        let mut request = self.next_creator_request(&set_id)?;
        match expires {
            Some(expires) => request.headers.expires = Some(expires),
            None if current > 0 => request.headers.expires = Some(current),
            None => {}
        }
        self.cancel_usage_timers(reg.id());
        self.send_request(request).map(|_| ())
    }

    fn registration_end(&mut self, reg: ClientRegistrationHandle) -> DumResult<()> {
        let usage = self.registry.get_mut(reg)?;
        if usage.ending {
            return Ok(());
        }
        usage.ending = true;
        let set_id = usage.set_id.clone();
        let mut request = self.next_creator_request(&set_id)?;
        request.headers.expires = Some(0);
        for contact in request.headers.contact.iter_mut() {
            contact.params.remove("expires");
        }
        self.cancel_usage_timers(reg.id());
        self.send_request(request).map(|_| ())
    }

    pub(crate) fn on_registration_refresh_timer(
        &mut self,
        reg: ClientRegistrationHandle,
    ) -> DumResult<()> {
        self.registration_refresh(reg, None)
    }

    /// A new REGISTER opened a server dialog set
    pub(crate) fn start_server_registration(
        &mut self,
        set_id: &DialogSetId,
        request: Request,
    ) -> DumResult<()> {
        let handler = self.handlers.server_registration.clone().ok_or(DumError::MissingHandler {
            role: "server registration",
            key: "REGISTER".into(),
        })?;
        let owner = set_id.clone();
        let template = request.clone();
        let handle = self.registry.insert_with(|id| ServerRegistration {
            id,
            set_id: owner,
            request: template,
        });
        let set = self
            .dialog_sets
            .get_mut(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        set.dialogless = Some(handle.id());

        if requested_expires(&request) == Some(0) {
            handler.on_remove(self, handle, &request);
        } else {
            handler.on_register(self, handle, &request);
        }
        Ok(())
    }

    fn server_registration_answer(
        &mut self,
        reg: ServerRegistrationHandle,
        response: Response,
    ) -> DumResult<()> {
        self.registry.get(reg)?;
        let done = response.status.is_final();
        self.send_response(response);
        if done {
            self.destroy_usage(reg.id());
        }
        Ok(())
    }
}
