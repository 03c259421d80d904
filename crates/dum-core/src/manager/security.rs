//! Server authentication and identity checks
//!
//! Both steps may defer a request: the server auth manager can answer
//! `Pending` and decide later through [`DumEvent::AuthResult`], and an
//! Identity signed by a domain whose certificate we lack is held until an
//! OPTIONS probe to that domain returns. Deferred requests are parked by
//! transaction id and re-enter the pipeline where they left it. An auth
//! decision that does not arrive within the transaction lifetime is
//! answered with 408.
//!
//! [`DumEvent::AuthResult`]: crate::events::DumEvent::AuthResult

use tracing::{debug, info, trace, warn};

use sipdum_message::{
    CSeq, IdentityStrength, Method, MimeType, NameAddr, Request, Response, SecurityAttributes,
    StatusCode, Uri,
};

use super::DialogUsageManager;
use crate::dialog::dialog_utils::{generate_branch, generate_call_id, generate_tag};
use crate::handlers::ServerAuthOutcome;
use crate::timer::{TimeoutKind, TRANSACTION_LIFETIME};

/// Requests waiting for the certificate of `domain`
#[derive(Debug, Clone)]
pub struct PendingIdentity {
    pub domain: String,
    pub requests: Vec<Request>,
}

fn is_encrypted(request: &Request) -> bool {
    request
        .headers
        .content_type
        .as_ref()
        .map(|mime| mime.matches(&MimeType::new("application", "pkcs7-mime")))
        .unwrap_or(false)
}

fn signer_domain(request: &Request) -> Option<String> {
    request.headers.from.as_ref().map(|from| from.uri.host.clone())
}

impl DialogUsageManager {
    /// Ask the server auth manager; `Some` when processing continues now
    pub(crate) fn authenticate_request(&mut self, request: Request) -> Option<Request> {
        let Some(auth) = self.handlers.server_auth.clone() else {
            return Some(request);
        };
        if request.method.is_ack_or_cancel() {
            return Some(request);
        }
        match auth.authenticate(&request) {
            ServerAuthOutcome::Accepted => Some(request),
            ServerAuthOutcome::Challenge(challenge) => {
                debug!("Challenging {}", request.method);
                self.reply_with(&request, challenge);
                None
            }
            ServerAuthOutcome::Rejected(code) => {
                debug!("Authentication rejected {} with {}", request.method, code);
                self.reply(&request, code);
                None
            }
            ServerAuthOutcome::Pending => {
                let key =
                    request.headers.branch().map(str::to_string).unwrap_or_else(generate_branch);
                trace!("Parking {} until auth result {}", request.method, key);
                self.pending_auth.insert(key.clone(), request);
                self.schedule_detached(
                    TimeoutKind::AuthExpired { transaction_id: key },
                    TRANSACTION_LIFETIME,
                );
                None
            }
        }
    }

    pub(crate) fn on_auth_result(&mut self, transaction_id: &str, accepted: bool) {
        let Some(request) = self.pending_auth.remove(transaction_id) else {
            warn!("Auth result for unknown transaction {}", transaction_id);
            return;
        };
        if accepted {
            self.check_identity(request);
        } else {
            debug!("Deferred authentication rejected {}", request.method);
            self.reply(&request, StatusCode::FORBIDDEN);
        }
    }

    pub(crate) fn on_auth_expired(&mut self, transaction_id: &str) {
        if let Some(request) = self.pending_auth.remove(transaction_id) {
            warn!("No auth decision for {} {}, giving up", request.method, transaction_id);
            self.reply(&request, StatusCode::REQUEST_TIMEOUT);
        }
    }

    /// Decrypt the body and check the Identity header, probing for the
    /// signer's certificate when needed
    pub(crate) fn check_identity(&mut self, mut request: Request) {
        let Some(security) = self.handlers.security.clone() else {
            self.dispatch_request(request);
            return;
        };

        let encrypted = is_encrypted(&request);
        let mut decryption_failed = false;
        if encrypted {
            match security.decrypt(&request.body) {
                Some(plain) => request.body = plain,
                None => {
                    warn!("Could not decrypt {} body", request.method);
                    decryption_failed = true;
                }
            }
        }
        request.metadata.security = Some(SecurityAttributes {
            identity: request.headers.from.as_ref().map(|f| f.uri.aor()).unwrap_or_default(),
            strength: IdentityStrength::From,
            encrypted,
            decryption_failed,
        });

        let domain = match (&request.headers.identity, signer_domain(&request)) {
            (Some(_), Some(domain)) => domain,
            _ => {
                self.dispatch_request(request);
                return;
            }
        };
        if security.has_domain_cert(&domain) {
            self.verify_and_dispatch(request);
            return;
        }

        if let Some(pending) = self.pending_identity.values_mut().find(|p| p.domain == domain) {
            trace!("Queueing {} behind certificate probe of {}", request.method, domain);
            pending.requests.push(request);
            return;
        }
        let probe = self.certificate_probe(&domain);
        match self.send_request(probe) {
            Ok(Some(branch)) => {
                info!("Fetching certificate of {}", domain);
                self.pending_identity.insert(
                    branch,
                    PendingIdentity {
                        domain,
                        requests: vec![request],
                    },
                );
            }
            Ok(None) | Err(_) => {
                warn!("Could not probe {}, dispatching unverified", domain);
                self.verify_and_dispatch(request);
            }
        }
    }

    fn certificate_probe(&self, domain: &str) -> Request {
        let uri = Uri::sip(None, domain);
        let mut probe = Request::new(Method::Options, uri.clone());
        let h = &mut probe.headers;
        h.from = Some(self.config.local_identity.clone().with_tag(generate_tag()));
        h.to = Some(NameAddr::new(uri));
        h.call_id = Some(generate_call_id(&self.config.via_host));
        h.cseq = Some(CSeq::new(1, Method::Options));
        h.accept = vec![MimeType::new("application", "pkix-cert")];
        probe
    }

    fn verify_and_dispatch(&mut self, mut request: Request) {
        if let (Some(security), Some(identity), Some(domain)) = (
            self.handlers.security.clone(),
            request.headers.identity.clone(),
            signer_domain(&request),
        ) {
            let verified = security.has_domain_cert(&domain)
                && security.verify_identity(&domain, &request, &identity);
            let strength = if verified {
                IdentityStrength::Identity
            } else {
                debug!("Identity of {} did not verify", domain);
                IdentityStrength::FailedIdentity
            };
            if let Some(attributes) = request.metadata.security.as_mut() {
                attributes.strength = strength;
            }
        }
        self.dispatch_request(request);
    }

    /// Final response to a certificate probe: store the certificate and resume
    pub(crate) fn on_identity_probe_response(&mut self, branch: &str, response: Response) {
        if !response.status.is_final() {
            return;
        }
        let Some(pending) = self.pending_identity.remove(branch) else {
            return;
        };
        if response.status.is_success() && !response.body.is_empty() {
            if let Some(security) = self.handlers.security.clone() {
                security.add_domain_cert(&pending.domain, &response.body);
            }
        } else {
            debug!("Certificate probe of {} failed: {}", pending.domain, response.status);
        }
        for request in pending.requests {
            self.verify_and_dispatch(request);
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_pkcs7_body_detected() {
        let uri = "sip:bob@biloxi.example.com".parse().unwrap();
        let mut request =
            Request::new(Method::Message, uri).with_body(Bytes::from_static(b"\x30\x82"));
        assert!(!is_encrypted(&request));
        let enveloped = "application/pkcs7-mime;smime-type=enveloped-data";
        request.headers.content_type = Some(enveloped.parse().unwrap());
        assert!(is_encrypted(&request));
    }
}
