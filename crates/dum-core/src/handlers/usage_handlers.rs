//! Application callbacks, one trait per usage role
//!
//! Every callback receives the manager mutably and a handle to the usage,
//! so the application can answer, send requests or end the usage from inside
//! the callback. The usage may be gone once the callback returns; handles
//! kept past that point report [`DumError::StaleHandle`](crate::errors::DumError::StaleHandle).

use sipdum_message::{Message, Request, Response, StatusCode};
use tracing::warn;

use crate::dialog::DialogSetId;
use crate::errors::DumResult;
use crate::manager::DialogUsageManager;
use crate::usage::{
    ClientOutOfDialogHandle, ClientPublicationHandle, ClientRegistrationHandle,
    ClientSubscriptionHandle, InviteEndReason, InviteSessionHandle, ServerOutOfDialogHandle,
    ServerPublicationHandle, ServerRegistrationHandle, ServerSubscriptionHandle,
};

fn log_failure(callback: &str, result: DumResult<()>) {
    if let Err(e) = result {
        warn!("Default {} handling failed: {}", callback, e);
    }
}

/// INVITE sessions, both roles
pub trait InviteSessionHandler: Send + Sync {
    /// An INVITE arrived; answer with `provisional`, `accept` or `reject`
    fn on_new_server_session(
        &self,
        dum: &mut DialogUsageManager,
        session: InviteSessionHandle,
        invite: &Request,
    );

    /// A provisional or 2xx response formed a dialog for our INVITE
    fn on_new_client_session(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _response: &Response,
    ) {
    }

    fn on_provisional(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _response: &Response,
    ) {
    }

    /// 2xx received (UAC) or ACK received (UAS)
    fn on_connected(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _msg: &Message,
    ) {
    }

    /// Our INVITE failed before any dialog was formed
    fn on_failure(&self, _dum: &mut DialogUsageManager, _set: &DialogSetId, _response: &Response) {}

    /// 3xx for an early session
    fn on_redirected(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _response: &Response,
    ) {
    }

    fn on_terminated(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _reason: InviteEndReason,
        _msg: Option<&Message>,
    ) {
    }

    /// re-INVITE with a new offer; answered by default with the current local body
    fn on_offer(
        &self,
        dum: &mut DialogUsageManager,
        session: InviteSessionHandle,
        _invite: &Request,
    ) {
        log_failure("re-INVITE", session.accept(dum, None));
    }

    fn on_info(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _info: &Request,
    ) {
    }

    fn on_message(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _message: &Request,
    ) {
    }

    /// NOTIFY of a REFER sent in this session, with the sipfrag status if any
    fn on_refer_notify(
        &self,
        _dum: &mut DialogUsageManager,
        _session: InviteSessionHandle,
        _notify: &Request,
        _status: Option<StatusCode>,
    ) {
    }
}

/// Subscriber side of one event package
pub trait ClientSubscriptionHandler: Send + Sync {
    /// First NOTIFY of the subscription (not called for "refer")
    fn on_new_subscription(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _notify: &Request,
    ) {
    }

    fn on_update_active(
        &self,
        dum: &mut DialogUsageManager,
        sub: ClientSubscriptionHandle,
        notify: &Request,
    );

    fn on_update_pending(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _notify: &Request,
    ) {
    }

    /// Unknown Subscription-State value, or sipfrag progress of a REFER
    fn on_update_extension(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _notify: &Request,
    ) {
    }

    /// The subscription ended; the handle goes stale after this returns
    fn on_terminated(
        &self,
        dum: &mut DialogUsageManager,
        sub: ClientSubscriptionHandle,
        msg: Option<&Message>,
    );

    /// Retry after a failure; `Some(delay)` resubscribes after `delay` seconds
    fn on_request_retry(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ClientSubscriptionHandle,
        _retry_after: u32,
        _msg: &Message,
    ) -> Option<u32> {
        None
    }
}

/// Notifier side of one event package
pub trait ServerSubscriptionHandler: Send + Sync {
    /// A new SUBSCRIBE; answer with `accept` (and a NOTIFY) or `reject`
    fn on_new_subscription(
        &self,
        dum: &mut DialogUsageManager,
        sub: ServerSubscriptionHandle,
        subscribe: &Request,
    );

    /// A REFER created an implicit subscription; declined unless overridden
    fn on_new_subscription_from_refer(
        &self,
        dum: &mut DialogUsageManager,
        sub: ServerSubscriptionHandle,
        _refer: &Request,
    ) {
        log_failure("REFER", sub.reject(dum, StatusCode::DECLINE));
    }

    /// A refreshing SUBSCRIBE; accepted with a NOTIFY of the current state by default
    fn on_refresh(
        &self,
        dum: &mut DialogUsageManager,
        sub: ServerSubscriptionHandle,
        _subscribe: &Request,
    ) {
        log_failure("refresh", sub.accept(dum, StatusCode::OK));
        log_failure("refresh NOTIFY", sub.neutral_notify(dum));
    }

    fn on_terminated(&self, _dum: &mut DialogUsageManager, _sub: ServerSubscriptionHandle) {}

    /// The subscription timed out; a terminating NOTIFY was already sent
    fn on_expired(&self, _dum: &mut DialogUsageManager, _sub: ServerSubscriptionHandle) {}

    fn on_notify_rejected(
        &self,
        _dum: &mut DialogUsageManager,
        _sub: ServerSubscriptionHandle,
        _response: &Response,
    ) {
    }

    /// Shortest acceptable Expires; shorter requests get 423
    fn min_expires(&self) -> Option<u32> {
        None
    }

    /// Expires granted when the SUBSCRIBE has none
    fn default_expires(&self) -> Option<u32> {
        None
    }
}

/// The pre-registered "refer" handler: declines every REFER
pub struct DefaultReferHandler;

impl ServerSubscriptionHandler for DefaultReferHandler {
    fn on_new_subscription(
        &self,
        dum: &mut DialogUsageManager,
        sub: ServerSubscriptionHandle,
        _subscribe: &Request,
    ) {
        log_failure("refer SUBSCRIBE", sub.reject(dum, StatusCode::DECLINE));
    }
}

pub trait ClientRegistrationHandler: Send + Sync {
    fn on_success(
        &self,
        dum: &mut DialogUsageManager,
        reg: ClientRegistrationHandle,
        response: &Response,
    );

    fn on_removed(
        &self,
        _dum: &mut DialogUsageManager,
        _reg: ClientRegistrationHandle,
        _response: &Response,
    ) {
    }

    fn on_failure(
        &self,
        dum: &mut DialogUsageManager,
        reg: ClientRegistrationHandle,
        response: &Response,
    );

    /// `Some(delay)` re-registers after `delay` seconds
    fn on_request_retry(
        &self,
        _dum: &mut DialogUsageManager,
        _reg: ClientRegistrationHandle,
        _retry_after: u32,
        _response: &Response,
    ) -> Option<u32> {
        None
    }
}

pub trait ServerRegistrationHandler: Send + Sync {
    /// A REGISTER adding or refreshing bindings; answer with `accept` or `reject`
    fn on_register(
        &self,
        dum: &mut DialogUsageManager,
        reg: ServerRegistrationHandle,
        register: &Request,
    );

    /// A REGISTER with Expires: 0
    fn on_remove(
        &self,
        dum: &mut DialogUsageManager,
        reg: ServerRegistrationHandle,
        _register: &Request,
    ) {
        log_failure("un-REGISTER", reg.accept(dum));
    }
}

pub trait ClientPublicationHandler: Send + Sync {
    fn on_success(
        &self,
        dum: &mut DialogUsageManager,
        publication: ClientPublicationHandle,
        response: &Response,
    );

    fn on_removed(
        &self,
        _dum: &mut DialogUsageManager,
        _publication: ClientPublicationHandle,
        _response: &Response,
    ) {
    }

    fn on_failure(
        &self,
        dum: &mut DialogUsageManager,
        publication: ClientPublicationHandle,
        response: &Response,
    );
}

pub trait ServerPublicationHandler: Send + Sync {
    /// A PUBLISH without SIP-If-Match
    fn on_initial(
        &self,
        dum: &mut DialogUsageManager,
        publication: ServerPublicationHandle,
        etag: &str,
        publish: &Request,
        expires: u32,
    );

    /// Body-less refresh
    fn on_refresh(
        &self,
        dum: &mut DialogUsageManager,
        publication: ServerPublicationHandle,
        _etag: &str,
        _publish: &Request,
        _expires: u32,
    ) {
        log_failure("PUBLISH refresh", publication.accept(dum));
    }

    /// Refresh carrying a new body
    fn on_update(
        &self,
        dum: &mut DialogUsageManager,
        publication: ServerPublicationHandle,
        _etag: &str,
        _publish: &Request,
        _expires: u32,
    ) {
        log_failure("PUBLISH update", publication.accept(dum));
    }

    fn on_removed(
        &self,
        dum: &mut DialogUsageManager,
        publication: ServerPublicationHandle,
        _etag: &str,
        _publish: &Request,
    ) {
        log_failure("PUBLISH removal", publication.accept(dum));
    }

    fn on_expired(
        &self,
        _dum: &mut DialogUsageManager,
        _publication: ServerPublicationHandle,
        _etag: &str,
    ) {
    }
}

pub trait ClientOutOfDialogHandler: Send + Sync {
    fn on_success(
        &self,
        dum: &mut DialogUsageManager,
        req: ClientOutOfDialogHandle,
        response: &Response,
    );

    fn on_failure(
        &self,
        dum: &mut DialogUsageManager,
        req: ClientOutOfDialogHandle,
        response: &Response,
    );
}

pub trait ServerOutOfDialogHandler: Send + Sync {
    /// Answer with `accept`, `reject` or `send`
    fn on_received(
        &self,
        dum: &mut DialogUsageManager,
        req: ServerOutOfDialogHandle,
        request: &Request,
    );
}
