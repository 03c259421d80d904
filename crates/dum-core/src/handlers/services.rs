//! Collaborator services the manager calls out to
//!
//! Authentication, identity and decryption are opaque to the dialog layer:
//! it only decides *when* to ask and what to do with the answer.

use std::sync::Arc;

use bytes::Bytes;

use sipdum_message::{Request, Response, StatusCode};

use crate::dialog::DialogSetId;

/// Adds credentials to outbound requests
pub trait ClientAuthManager: Send + Sync {
    /// Prepare a retry of `request` answering the 401/407 `challenge`
    ///
    /// Returns `false` when no credentials apply; the failure is then
    /// reported to the usage as is.
    fn handle_challenge(&self, request: &mut Request, challenge: &Response) -> bool;

    /// Add cached credentials to a request about to be sent
    fn add_authorization(&self, _request: &mut Request) {}
}

/// Result of checking an inbound request's credentials
#[derive(Debug, Clone)]
pub enum ServerAuthOutcome {
    /// Continue processing
    Accepted,
    /// Send this challenge (401/407) and stop
    Challenge(Response),
    /// Reject with this status and stop
    Rejected(StatusCode),
    /// Decision comes later through `DumEvent::AuthResult`
    Pending,
}

/// Authenticates inbound requests
pub trait ServerAuthManager: Send + Sync {
    fn authenticate(&self, request: &Request) -> ServerAuthOutcome;
}

/// Identity signing/verification and body decryption (RFC 4474, S/MIME)
pub trait Security: Send + Sync {
    /// `true` when the certificate of `domain` is known
    fn has_domain_cert(&self, domain: &str) -> bool;

    /// Store a certificate fetched from `domain`
    fn add_domain_cert(&self, domain: &str, cert: &[u8]);

    /// Check the Identity header value of a request signed by `domain`
    fn verify_identity(&self, domain: &str, request: &Request, identity: &str) -> bool;

    /// Identity header value for a request sent from `domain`
    fn compute_identity(&self, domain: &str, request: &Request) -> Option<String>;

    /// Decrypt an encrypted body; `None` when it cannot be decrypted
    fn decrypt(&self, body: &Bytes) -> Option<Bytes>;
}

/// Application state attached to a dialog set
pub trait AppDialogSet: Send + Sync {
    /// The dialog set is gone; no callback refers to it anymore
    fn on_dialog_set_destroyed(&self, _id: &DialogSetId) {}
}

/// Builds the [`AppDialogSet`] of dialog sets created by inbound requests
pub trait AppDialogSetFactory: Send + Sync {
    fn create(&self, request: &Request) -> Option<Arc<dyn AppDialogSet>>;
}

/// Told once when a requested shutdown has completed
pub trait DumShutdownHandler: Send + Sync {
    fn on_dum_can_be_deleted(&self);
}
