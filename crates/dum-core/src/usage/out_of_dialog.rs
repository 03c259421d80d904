//! Out-of-dialog requests: OPTIONS, MESSAGE and anything else answered
//! without forming a dialog
//!
//! Both sides are one-shot. The client usage exists only long enough to
//! report the final response; the server usage until the application answers.

use tracing::debug;

use sipdum_message::{Method, Request, Response, StatusCode};

use super::{ClientOutOfDialogHandle, ServerOutOfDialogHandle, UsageId};
use crate::config::DumConfig;
use crate::dialog::DialogSetId;
use crate::errors::{DumError, DumResult};
use crate::manager::DialogUsageManager;

#[derive(Debug, Clone)]
pub struct ClientOutOfDialogReq {
    pub(crate) id: UsageId,
    pub(crate) set_id: DialogSetId,
    pub(crate) request: Request,
}

impl ClientOutOfDialogReq {
    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    /// The request as last sent
    pub fn request(&self) -> &Request {
        &self.request
    }
}

#[derive(Debug, Clone)]
pub struct ServerOutOfDialogReq {
    pub(crate) id: UsageId,
    pub(crate) set_id: DialogSetId,
    pub(crate) request: Request,
}

impl ServerOutOfDialogReq {
    pub fn new(id: UsageId, set_id: DialogSetId, request: Request) -> Self {
        Self { id, set_id, request }
    }

    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.request.method
    }

    pub fn request(&self) -> &Request {
        &self.request
    }
}

impl ServerOutOfDialogHandle {
    pub fn accept(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        if !code.is_success() {
            return Err(DumError::usage_use(format!("{} is not a success", code)));
        }
        let response = dum.server_ood_response(*self, code)?;
        dum.server_ood_answer(*self, response)
    }

    pub fn reject(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        if code.as_u16() < 300 {
            return Err(DumError::usage_use(format!("{} is not a rejection", code)));
        }
        let response = dum.server_ood_response(*self, code)?;
        dum.server_ood_answer(*self, response)
    }

    /// 200 listing this manager's capabilities
    pub fn answer_options(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        let mut response = dum.server_ood_response(*self, StatusCode::OK)?;
        add_capabilities(&mut response, dum.config());
        dum.server_ood_answer(*self, response)
    }

    /// Answer with an application-built response
    pub fn send(&self, dum: &mut DialogUsageManager, response: Response) -> DumResult<()> {
        dum.server_ood_answer(*self, response)
    }
}

/// Allow, Accept, Accept-Encoding, Accept-Language and Supported from the configuration
pub(crate) fn add_capabilities(response: &mut Response, config: &DumConfig) {
    let headers = &mut response.headers;
    headers.allow = config.supported_methods.clone();
    headers.accept = config.supported_mime_types.clone();
    headers.accept_encoding = config.supported_encodings.clone();
    headers.accept_language = config.supported_languages.clone();
    headers.supported = config.supported_option_tags.clone();
}

impl DialogUsageManager {
    /// A new out-of-dialog request opened a server dialog set
    pub(crate) fn start_server_ood(
        &mut self,
        set_id: &DialogSetId,
        request: Request,
    ) -> DumResult<()> {
        let handler = self
            .handlers
            .server_out_of_dialog
            .get(&request.method)
            .cloned()
            .ok_or(DumError::MissingHandler {
                role: "server out-of-dialog",
                key: request.method.to_string(),
            })?;
        let owner = set_id.clone();
        let template = request.clone();
        let handle = self
            .registry
            .insert_with(|id| ServerOutOfDialogReq::new(id, owner, template));
        let set = self
            .dialog_sets
            .get_mut(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        set.dialogless = Some(handle.id());

        handler.on_received(self, handle, &request);
        Ok(())
    }

    fn server_ood_response(
        &self,
        req: ServerOutOfDialogHandle,
        code: StatusCode,
    ) -> DumResult<Response> {
        let usage = self.registry.get(req)?;
        Ok(self.make_set_response(&usage.set_id, &usage.request, code))
    }

    fn server_ood_answer(
        &mut self,
        req: ServerOutOfDialogHandle,
        response: Response,
    ) -> DumResult<()> {
        self.registry.get(req)?;
        let done = response.status.is_final();
        self.send_response(response);
        if done {
            self.destroy_usage(req.id());
        }
        Ok(())
    }

    /// Final response to our out-of-dialog request
    pub(crate) fn on_ood_response(
        &mut self,
        set_id: &DialogSetId,
        response: Response,
    ) -> DumResult<()> {
        if response.status.is_provisional() {
            return Ok(());
        }
        let request = self
            .find_creator(set_id)
            .map(|c| c.last_request().clone())
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        let method = request.method.clone();
        let owner = set_id.clone();
        let handle: ClientOutOfDialogHandle = self.registry.insert_with(|id| ClientOutOfDialogReq {
            id,
            set_id: owner,
            request,
        });
        if let Some(set) = self.dialog_sets.get_mut(set_id) {
            set.dialogless = Some(handle.id());
        }

        match self.handlers.client_out_of_dialog.get(&method).cloned() {
            Some(handler) if response.status.is_success() => {
                handler.on_success(self, handle, &response)
            }
            Some(handler) => handler.on_failure(self, handle, &response),
            None => debug!("No handler for {} response {}", method, response.status),
        }
        self.destroy_usage(handle.id());
        Ok(())
    }
}
