//! PUBLISH usages (RFC 3903)
//!
//! The client side tracks the entity tag handed out by the compositor and
//! sends body-less refreshes with `SIP-If-Match`; a 412 means the compositor
//! lost our state, so the full document is published again. The server side
//! hands out entity tags, rotating them on every accepted refresh, and
//! expires publications nobody refreshed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info};

use sipdum_message::{MimeType, Request, Response, StatusCode};

use super::{ClientPublicationHandle, ServerPublicationHandle, UsageId};
use crate::dialog::dialog_utils::{a_bit_smaller_than, generate_etag};
use crate::dialog::DialogSetId;
use crate::errors::{DumError, DumResult};
use crate::handlers::{ClientPublicationHandler, ServerPublicationHandler};
use crate::manager::DialogUsageManager;
use crate::timer::TimeoutKind;

#[derive(Debug, Clone)]
pub struct ClientPublication {
    pub(crate) id: UsageId,
    pub(crate) set_id: DialogSetId,
    pub(crate) event: String,
    pub(crate) etag: Option<String>,
    /// Full document, re-published after a 412
    pub(crate) document: Option<(MimeType, Bytes)>,
    pub(crate) expires: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_seq: u64,
    pub(crate) ending: bool,
}

impl ClientPublication {
    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    pub fn time_left(&self) -> u32 {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }
}

impl ClientPublicationHandle {
    /// Body-less refresh
    pub fn refresh(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.publication_send(*self, PublishKind::Refresh)
    }

    /// Publish a new document under the current entity tag
    pub fn update(
        &self,
        dum: &mut DialogUsageManager,
        content_type: MimeType,
        body: Bytes,
    ) -> DumResult<()> {
        dum.registry.get_mut(*self)?.document = Some((content_type, body));
        dum.publication_send(*self, PublishKind::Update)
    }

    /// Remove the publication (Expires: 0)
    pub fn end(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.publication_send(*self, PublishKind::Remove)
    }

    pub fn time_left(&self, dum: &DialogUsageManager) -> DumResult<u32> {
        Ok(dum.registry.get(*self)?.time_left())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublishKind {
    Refresh,
    Update,
    Remove,
    /// Full document without SIP-If-Match, after a 412
    Initial,
}

#[derive(Debug, Clone)]
pub struct ServerPublication {
    pub(crate) id: UsageId,
    pub(crate) set_id: DialogSetId,
    pub(crate) event: String,
    /// Current entity tag
    pub(crate) etag: String,
    /// PUBLISH waiting for an answer
    pub(crate) request: Request,
    pub(crate) expires: u32,
    pub(crate) deadline: Option<Instant>,
    pub(crate) timer_seq: u64,
    pub(crate) document: Option<(MimeType, Bytes)>,
    pub(crate) accepted: bool,
}

impl ServerPublication {
    pub fn id(&self) -> UsageId {
        self.id
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn document(&self) -> Option<&(MimeType, Bytes)> {
        self.document.as_ref()
    }

    pub fn time_left(&self) -> u32 {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }
}

impl ServerPublicationHandle {
    /// 200 for the pending PUBLISH, with a fresh entity tag
    pub fn accept(&self, dum: &mut DialogUsageManager) -> DumResult<()> {
        dum.server_publication_accept(*self)
    }

    pub fn reject(&self, dum: &mut DialogUsageManager, code: StatusCode) -> DumResult<()> {
        dum.server_publication_reject(*self, code)
    }

    pub fn etag(&self, dum: &DialogUsageManager) -> DumResult<String> {
        Ok(dum.registry.get(*self)?.etag.clone())
    }
}

impl DialogUsageManager {
    fn client_publication_handler(&self, event: &str) -> Option<Arc<dyn ClientPublicationHandler>> {
        self.handlers.client_publication.get(event).cloned()
    }

    fn server_publication_handler(&self, event: &str) -> Option<Arc<dyn ServerPublicationHandler>> {
        self.handlers.server_publication.get(event).cloned()
    }

    fn client_publication_for(
        &mut self,
        set_id: &DialogSetId,
    ) -> DumResult<ClientPublicationHandle> {
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
        let request = set
            .creator
            .as_ref()
            .map(|c| c.last_request().clone())
            .ok_or_else(|| DumError::internal("publication dialog set without creator"))?;
        let event = request.headers.event_type().unwrap_or_default().to_string();
        let document = request
            .headers
            .content_type
            .clone()
            .filter(|_| !request.body.is_empty())
            .map(|mime| (mime, request.body.clone()));
        let expires = request.headers.expires.unwrap_or(self.config.default_publication_expires);
        let owner = set_id.clone();
        let handle = self.registry.insert_with(|id| ClientPublication {
            id,
            set_id: owner,
            event,
            etag: None,
            document,
            expires,
            deadline: None,
            timer_seq: 0,
            ending: false,
        });
        if let Some(set) = self.dialog_sets.get_mut(set_id) {
            set.dialogless = Some(handle.id());
        }
        Ok(handle)
    }

    /// Final response to our PUBLISH
    pub(crate) fn on_publication_response(
        &mut self,
        set_id: &DialogSetId,
        response: Response,
    ) -> DumResult<()> {
        let code = response.status;
        if code.is_provisional() {
            return Ok(());
        }
        let publication = self.client_publication_for(set_id)?;
        let usage = self.registry.get_mut(publication)?;
        let ending = usage.ending;
        let event = usage.event.clone();

        if code == StatusCode::CONDITIONAL_REQUEST_FAILED && !ending && usage.document.is_some() {
            info!("Compositor lost publication {}, publishing again", publication.id());
            usage.etag = None;
            return self.publication_send(publication, PublishKind::Initial);
        }
        if code == StatusCode::INTERVAL_TOO_BRIEF && !ending {
            if let Some(min) = response.headers.min_expires {
                usage.expires = min;
                let kind = match usage.etag {
                    Some(_) => PublishKind::Refresh,
                    None => PublishKind::Initial,
                };
                return self.publication_send(publication, kind);
            }
        }

        let handler = self.client_publication_handler(&event);
        if code.is_success() {
            if ending {
                if let Some(handler) = handler {
                    handler.on_removed(self, publication, &response);
                }
                self.destroy_usage(publication.id());
                return Ok(());
            }
            let usage = self.registry.get_mut(publication)?;
            if let Some(etag) = &response.headers.sip_etag {
                usage.etag = Some(etag.clone());
            }
            if self.is_set_ending(set_id) {
                return self.publication_send(publication, PublishKind::Remove);
            }
            let usage = self.registry.get_mut(publication)?;
            let granted = response.headers.expires.unwrap_or(usage.expires);
            usage.expires = granted;
            usage.deadline = Some(Instant::now() + Duration::from_secs(granted as u64));
            if granted > 0 {
                let after = a_bit_smaller_than(granted, self.config.max_refresh_jitter_secs);
                self.schedule_usage_timer(
                    publication.id(),
                    TimeoutKind::PublicationRefresh,
                    Duration::from_secs(after as u64),
                )?;
            }
            if let Some(handler) = handler {
                handler.on_success(self, publication, &response);
            }
            return Ok(());
        }

        debug!("Publication {} failed: {}", publication.id(), code);
        if let Some(handler) = handler {
            handler.on_failure(self, publication, &response);
        }
        self.destroy_usage(publication.id());
        Ok(())
    }

    fn publication_send(
        &mut self,
        publication: ClientPublicationHandle,
        kind: PublishKind,
    ) -> DumResult<()> {
        let usage = self.registry.get(publication)?;
        if usage.ending {
            return Err(DumError::usage_use("publication is being removed"));
        }
        if kind != PublishKind::Initial && usage.etag.is_none() {
            if kind == PublishKind::Remove {
                // nothing to remove at the compositor
                self.destroy_usage(publication.id());
                return Ok(());
            }
            return Err(DumError::usage_use("no entity tag yet"));
        }
        let set_id = usage.set_id.clone();
        let etag = usage.etag.clone();
        let document = usage.document.clone();
        let expires = usage.expires;

        let mut request = self.next_creator_request(&set_id)?;
        request.headers.sip_if_match = match kind {
            PublishKind::Initial => None,
            _ => etag,
        };
        match (kind, document) {
            (PublishKind::Update | PublishKind::Initial, Some((content_type, body))) => {
                request.headers.content_type = Some(content_type);
                request.body = body;
            }
            _ => {
                request.headers.content_type = None;
                request.body = Bytes::new();
            }
        }
        request.headers.expires = Some(match kind {
            PublishKind::Remove => 0,
            _ => expires,
        });
        if kind == PublishKind::Remove {
            self.registry.get_mut(publication)?.ending = true;
        }
        self.cancel_usage_timers(publication.id());
        self.send_request(request).map(|_| ())
    }

    pub(crate) fn on_publication_refresh_timer(
        &mut self,
        publication: ClientPublicationHandle,
    ) -> DumResult<()> {
        self.publication_send(publication, PublishKind::Refresh)
    }

    /// PUBLISH with SIP-If-Match for a publication we know
    pub(crate) fn dispatch_server_publication_refresh(
        &mut self,
        publication: ServerPublicationHandle,
        request: Request,
    ) -> DumResult<()> {
        let usage = self.registry.get_mut(publication)?;
        let handler = self
            .handlers
            .server_publication
            .get(&usage.event)
            .cloned()
            .ok_or(DumError::MissingHandler {
                role: "server publication",
                key: usage.event.clone(),
            })?;
        let expires = request.headers.expires.unwrap_or(self.config.default_publication_expires);
        usage.request = request.clone();
        usage.expires = expires;
        let etag = usage.etag.clone();
        if !request.body.is_empty() {
            usage.document = request
                .headers
                .content_type
                .clone()
                .map(|mime| (mime, request.body.clone()));
        }

        if expires == 0 {
            handler.on_removed(self, publication, &etag, &request);
        } else if request.body.is_empty() {
            handler.on_refresh(self, publication, &etag, &request, expires);
        } else {
            handler.on_update(self, publication, &etag, &request, expires);
        }
        Ok(())
    }

    /// A PUBLISH without SIP-If-Match opened a server dialog set
    pub(crate) fn start_server_publication(
        &mut self,
        set_id: &DialogSetId,
        request: Request,
    ) -> DumResult<()> {
        let event = request
            .headers
            .event_type()
            .ok_or_else(|| DumError::invalid_message("PUBLISH without Event"))?
            .to_string();
        let handler = self.server_publication_handler(&event).ok_or(DumError::MissingHandler {
            role: "server publication",
            key: event.clone(),
        })?;
        let expires = request.headers.expires.unwrap_or(self.config.default_publication_expires);
        let etag = generate_etag();
        let owner = set_id.clone();
        let template = request.clone();
        let document = request
            .headers
            .content_type
            .clone()
            .filter(|_| !request.body.is_empty())
            .map(|mime| (mime, request.body.clone()));
        let tag = etag.clone();
        let handle = self.registry.insert_with(|id| ServerPublication {
            id,
            set_id: owner,
            event,
            etag: tag,
            request: template,
            expires,
            deadline: None,
            timer_seq: 0,
            document,
            accepted: false,
        });
        let set = self
            .dialog_sets
            .get_mut(set_id)
            .ok_or_else(|| DumError::dialog_set_not_found(set_id))?;
        set.dialogless = Some(handle.id());
        self.publications.insert(etag.clone(), handle);

        handler.on_initial(self, handle, &etag, &request, expires);
        Ok(())
    }

    fn server_publication_accept(&mut self, publication: ServerPublicationHandle) -> DumResult<()> {
        let usage = self.registry.get_mut(publication)?;
        let removing = usage.request.headers.expires == Some(0);
        let old_etag = usage.etag.clone();
        let new_etag = if usage.accepted { generate_etag() } else { old_etag.clone() };
        usage.etag = new_etag.clone();
        usage.accepted = true;
        usage.deadline = Some(Instant::now() + Duration::from_secs(usage.expires as u64));
        let expires = usage.expires;
        let set_id = usage.set_id.clone();
        let request = usage.request.clone();

        let mut response = self.make_set_response(&set_id, &request, StatusCode::OK);
        response.headers.sip_etag = Some(new_etag.clone());
        response.headers.expires = Some(expires);
        self.publications.remove(&old_etag);
        self.send_response(response);

        if removing || expires == 0 {
            self.destroy_usage(publication.id());
            return Ok(());
        }
        self.publications.insert(new_etag, publication);
        self.schedule_usage_timer(
            publication.id(),
            TimeoutKind::PublicationExpired,
            Duration::from_secs(expires as u64),
        )?;
        Ok(())
    }

    fn server_publication_reject(
        &mut self,
        publication: ServerPublicationHandle,
        code: StatusCode,
    ) -> DumResult<()> {
        if code.as_u16() < 300 {
            return Err(DumError::usage_use(format!("{} is not a rejection", code)));
        }
        let usage = self.registry.get(publication)?;
        let accepted = usage.accepted;
        let response = self.make_set_response(&usage.set_id, &usage.request, code);
        self.send_response(response);
        if !accepted {
            self.destroy_usage(publication.id());
        }
        Ok(())
    }

    pub(crate) fn on_server_publication_expired(
        &mut self,
        publication: ServerPublicationHandle,
    ) -> DumResult<()> {
        let usage = self.registry.get(publication)?;
        let etag = usage.etag.clone();
        info!("Publication {} expired", etag);
        if let Some(handler) = self.server_publication_handler(&usage.event) {
            handler.on_expired(self, publication, &etag);
        }
        self.destroy_usage(publication.id());
        Ok(())
    }
}
