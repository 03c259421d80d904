//! Inbound request validation
//!
//! Each check answers the request itself when it fails and returns `false`
//! ("stop"); nothing here is an error for the caller.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use sipdum_message::{Method, MimeType, Request, StatusCode};

use super::{DialogUsageManager, MergedEntry};
use crate::config::ContentValidation;
use crate::dialog::MergedRequestKey;

impl DialogUsageManager {
    /// Run every validator in order; `false` when the request was answered
    pub(crate) fn validate_request(&mut self, request: &Request) -> bool {
        self.validate_method_and_scheme(request)
            && self.validate_required_options(request)
            && self.validate_content(request)
            && self.validate_accept(request)
            && self.check_merged_request(request)
    }

    fn validate_method_and_scheme(&mut self, request: &Request) -> bool {
        if !self.config.supports_method(&request.method) {
            debug!("Rejecting unsupported method {}", request.method);
            let mut response = self.make_reply(request, StatusCode::METHOD_NOT_ALLOWED);
            response.headers.allow = self.config.supported_methods.clone();
            self.reply_with(request, response);
            return false;
        }
        if !self.config.supports_scheme(request.uri.scheme.as_str()) {
            debug!("Rejecting unsupported URI scheme {}", request.uri.scheme);
            self.reply(request, StatusCode::UNSUPPORTED_URI_SCHEME);
            return false;
        }
        true
    }

    fn validate_required_options(&mut self, request: &Request) -> bool {
        if request.method.is_ack_or_cancel() {
            return true;
        }
        let unsupported: Vec<String> = request
            .headers
            .require
            .iter()
            .filter(|tag| !self.config.supports_option_tag(tag))
            .cloned()
            .collect();
        if unsupported.is_empty() {
            return true;
        }
        debug!("Rejecting request requiring {:?}", unsupported);
        let mut response = self.make_reply(request, StatusCode::BAD_EXTENSION);
        response.headers.unsupported = unsupported;
        self.reply_with(request, response);
        false
    }

    fn validate_content(&mut self, request: &Request) -> bool {
        if request.body.is_empty() {
            return true;
        }
        let check = match self.config.content_validation {
            ContentValidation::Always => true,
            ContentValidation::WhenHandlingRequired => request
                .headers
                .content_disposition
                .as_ref()
                .and_then(|d| d.param("handling"))
                .map(|h| h.eq_ignore_ascii_case("required"))
                .unwrap_or(false),
            ContentValidation::Never => false,
        };
        if !check {
            return true;
        }

        let h = &request.headers;
        if let Some(content_type) = &h.content_type {
            if !self.config.supports_mime_type(content_type) {
                debug!("Unsupported Content-Type {}", content_type);
                let mut response = self.make_reply(request, StatusCode::UNSUPPORTED_MEDIA_TYPE);
                response.headers.accept = self.config.supported_mime_types.clone();
                self.reply_with(request, response);
                return false;
            }
        }
        if h.content_encoding.iter().any(|e| !self.config.supports_encoding(e)) {
            debug!("Unsupported Content-Encoding {:?}", h.content_encoding);
            let mut response = self.make_reply(request, StatusCode::UNSUPPORTED_MEDIA_TYPE);
            response.headers.accept_encoding = self.config.supported_encodings.clone();
            self.reply_with(request, response);
            return false;
        }
        if h.content_language.iter().any(|l| !self.config.supports_language(l)) {
            debug!("Unsupported Content-Language {:?}", h.content_language);
            let mut response = self.make_reply(request, StatusCode::UNSUPPORTED_MEDIA_TYPE);
            response.headers.accept_language = self.config.supported_languages.clone();
            self.reply_with(request, response);
            return false;
        }
        true
    }

    fn validate_accept(&mut self, request: &Request) -> bool {
        if !self.config.validate_accept || request.method.is_ack_or_cancel() {
            return true;
        }
        let implied;
        let accepted: &[MimeType] = if request.headers.accept.is_empty() {
            match request.method {
                Method::Invite | Method::Options => {
                    implied = [MimeType::new("application", "sdp")];
                    &implied
                }
                _ => return true,
            }
        } else {
            &request.headers.accept
        };
        let acceptable = accepted
            .iter()
            .all(|mime| self.config.supported_mime_types.iter().any(|ours| ours.accepts(mime)));
        if acceptable {
            return true;
        }
        debug!("Peer accepts nothing we can send for {}", request.method);
        let mut response = self.make_reply(request, StatusCode::NOT_ACCEPTABLE);
        response.headers.accept = self.config.supported_mime_types.clone();
        self.reply_with(request, response);
        false
    }

    /// RFC 3261 §8.2.2.2: the same tag-less request arriving over two paths
    fn check_merged_request(&mut self, request: &Request) -> bool {
        if request.headers.to_tag().is_some() || request.method.is_ack_or_cancel() {
            return true;
        }
        let Some(key) = MergedRequestKey::from_request(request) else {
            return true;
        };
        let now = Instant::now();
        let window = Duration::from_secs(self.config.merged_request_window_secs);
        self.merged_requests.retain(|_, entry| now.duration_since(entry.seen) < window);

        let branch = request.headers.branch().map(str::to_string);
        match self.merged_requests.get(&key) {
            Some(entry) if entry.branch == branch => {
                trace!("Dropping retransmitted {}", request.method);
                false
            }
            Some(_) => {
                debug!("Merged {} from {}", request.method, key.from_tag);
                let response = self
                    .make_reply(request, StatusCode::LOOP_DETECTED)
                    .with_reason("Merged Request");
                self.reply_with(request, response);
                false
            }
            None => {
                self.merged_requests.insert(key, MergedEntry { branch, seen: now });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DumConfig;
    use crate::transport::ChannelTransport;
    use crate::transport::TransportCommand;
    use sipdum_message::{CSeq, Message, Via};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn manager(config: DumConfig) -> (DialogUsageManager, UnboundedReceiver<TransportCommand>) {
        let (transport, rx) = ChannelTransport::new();
        (DialogUsageManager::new(config, Arc::new(transport)), rx)
    }

    fn request(method: Method) -> Request {
        let mut req = Request::new(method.clone(), "sip:bob@biloxi.example.com".parse().unwrap());
        req.headers.via =
            vec![Via::new("UDP", "pc33.atlanta.example.com", None).with_branch("z9hG4bK74bf9")];
        req.headers.from = Some("<sip:alice@atlanta.example.com>;tag=9fxced76sl".parse().unwrap());
        req.headers.to = Some("<sip:bob@biloxi.example.com>".parse().unwrap());
        req.headers.call_id = Some("3848276298220188511@atlanta.example.com".into());
        req.headers.cseq = Some(CSeq::new(1, method));
        req
    }

    fn answered(rx: &mut UnboundedReceiver<TransportCommand>) -> Option<u16> {
        match rx.try_recv().ok()? {
            TransportCommand::Send(Message::Response(r))
            | TransportCommand::SendTo(Message::Response(r), _) => Some(r.status.as_u16()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_required_option_rejected_with_unsupported() {
        let (mut dum, mut rx) = manager(DumConfig::default());
        let mut req = request(Method::Options);
        req.headers.require = vec!["100rel".into()];
        assert!(!dum.validate_request(&req));
        assert_eq!(answered(&mut rx), Some(420));
    }

    #[tokio::test]
    async fn test_content_checked_only_when_required() {
        let config =
            DumConfig::default().with_content_validation(ContentValidation::WhenHandlingRequired);
        let (mut dum, mut rx) = manager(config);
        let mut req = request(Method::Message).with_body("hello");
        req.headers.content_type = Some("application/vnd.unknown".parse().unwrap());
        assert!(dum.validate_request(&req));

        let mut req = request(Method::Message).with_body("hello");
        req.headers.call_id = Some("other-call".into());
        req.headers.content_type = Some("application/vnd.unknown".parse().unwrap());
        req.headers.content_disposition = Some("render;handling=required".parse().unwrap());
        assert!(!dum.validate_request(&req));
        assert_eq!(answered(&mut rx), Some(415));
    }

    #[tokio::test]
    async fn test_retransmission_dropped_merge_rejected() {
        let (mut dum, mut rx) = manager(DumConfig::default());
        let first = request(Method::Invite);
        assert!(dum.validate_request(&first));
        assert!(!dum.validate_request(&first));
        assert_eq!(answered(&mut rx), None);

        let mut merged = request(Method::Invite);
        merged.headers.via[0].set_branch("z9hG4bKother");
        assert!(!dum.validate_request(&merged));
        assert_eq!(answered(&mut rx), Some(482));
    }

    #[tokio::test]
    async fn test_accept_must_be_supported() {
        let (mut dum, mut rx) = manager(DumConfig::default());
        let mut req = request(Method::Options);
        req.headers.accept = vec!["application/sdp".parse().unwrap(), "image/png".parse().unwrap()];
        assert!(!dum.validate_request(&req));
        assert_eq!(answered(&mut rx), Some(406));
    }
}
