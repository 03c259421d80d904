//! Configuration for the Dialog Usage Manager
//!
//! [`DumConfig`] is the "profile" of the local user agent: what it supports
//! (methods, URI schemes, option tags, body types), what it advertises, how
//! it fills outbound requests and the policy knobs of the usage state
//! machines.
//!
//! ## Examples
//!
//! ### Builder style
//!
//! ```rust
//! use sipdum_core::config::{DumConfig, SubscriptionRetryPolicy};
//!
//! let config = DumConfig::new("alice", "atlanta.example.com")
//!     .with_user_agent("sipdum/0.1")
//!     .with_default_subscription_expires(600)
//!     .with_subscription_retry(SubscriptionRetryPolicy::Immediate);
//!
//! assert_eq!(config.default_subscription_expires, 600);
//! ```
//!
//! ### From JSON
//!
//! ```rust
//! use sipdum_core::config::DumConfig;
//!
//! let json = r#"{ "via_host": "10.0.0.1", "via_port": 5070 }"#;
//! let config = DumConfig::from_json_str(json).unwrap();
//! assert_eq!(config.via_port, Some(5070));
//! assert_eq!(config.max_forwards, 70);
//! ```

use serde::{Deserialize, Serialize};

use sipdum_message::{Method, MimeType, NameAddr, Uri};

use crate::errors::{DumError, DumResult};

/// When inbound bodies are checked against the supported content lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentValidation {
    /// Every request carrying a body
    Always,
    /// Only bodies with `Content-Disposition: ...;handling=required`
    WhenHandlingRequired,
    /// Never
    Never,
}

/// What a client subscription does after a failure response not covered by
/// Retry-After, 408, 423 or 481
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionRetryPolicy {
    /// Resubscribe after the given number of seconds
    FixedDelay(u32),
    /// Resubscribe at once
    Immediate,
    /// Give up and terminate the subscription
    Terminate,
}

/// Dialog usage manager profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DumConfig {
    /// Local address-of-record used as From/To for generated requests
    pub local_identity: NameAddr,
    /// Contact placed in dialog-forming requests and responses
    pub local_contact: NameAddr,
    /// Transport token of the Via header
    pub via_transport: String,
    pub via_host: String,
    pub via_port: Option<u16>,
    pub user_agent: Option<String>,
    /// Added as a loose route to requests that have no Route
    pub outbound_proxy: Option<Uri>,
    pub max_forwards: u32,

    pub supported_methods: Vec<Method>,
    /// Lowercase URI scheme names accepted in the Request-URI
    pub supported_schemes: Vec<String>,
    pub supported_option_tags: Vec<String>,
    pub supported_mime_types: Vec<MimeType>,
    pub supported_encodings: Vec<String>,
    pub supported_languages: Vec<String>,
    pub content_validation: ContentValidation,
    pub validate_accept: bool,
    /// Add Allow/Accept-Encoding/Accept-Language/Supported to INVITEs
    pub advertise_capabilities: bool,

    /// Subscription duration assumed when a NOTIFY or SUBSCRIBE has none
    pub default_subscription_expires: u32,
    pub default_registration_expires: u32,
    pub default_publication_expires: u32,
    pub subscription_retry: SubscriptionRetryPolicy,
    /// Upper bound of the random amount subtracted from refresh intervals
    pub max_refresh_jitter_secs: u32,
    /// How long a merged-request key is remembered
    pub merged_request_window_secs: u64,
    /// Sign outbound requests through the installed security service
    pub compute_identity: bool,
}

impl Default for DumConfig {
    fn default() -> Self {
        Self::new("anonymous", "localhost")
    }
}

impl DumConfig {
    /// Profile for `user@host`, contact and Via pointing at `host`
    pub fn new(user: &str, host: &str) -> Self {
        let identity = NameAddr::new(Uri::sip(Some(user), host));
        Self {
            local_contact: identity.clone(),
            local_identity: identity,
            via_transport: "UDP".to_string(),
            via_host: host.to_string(),
            via_port: None,
            user_agent: None,
            outbound_proxy: None,
            max_forwards: 70,
            supported_methods: vec![
                Method::Invite,
                Method::Ack,
                Method::Cancel,
                Method::Bye,
                Method::Options,
                Method::Register,
                Method::Subscribe,
                Method::Notify,
                Method::Refer,
                Method::Publish,
                Method::Message,
                Method::Info,
                Method::Prack,
                Method::Update,
            ],
            supported_schemes: vec!["sip".into(), "sips".into(), "tel".into()],
            supported_option_tags: Vec::new(),
            supported_mime_types: vec![
                MimeType::new("application", "sdp"),
                MimeType::new("message", "sipfrag"),
                MimeType::new("text", "plain"),
                MimeType::new("application", "pidf+xml"),
                MimeType::new("application", "pkcs7-mime"),
            ],
            supported_encodings: vec!["identity".into()],
            supported_languages: vec!["en".into()],
            content_validation: ContentValidation::Always,
            validate_accept: true,
            advertise_capabilities: true,
            default_subscription_expires: 3600,
            default_registration_expires: 3600,
            default_publication_expires: 3600,
            subscription_retry: SubscriptionRetryPolicy::FixedDelay(20),
            max_refresh_jitter_secs: 5,
            merged_request_window_secs: 32,
            compute_identity: false,
        }
    }

    /// Load a profile from JSON; absent fields take their defaults
    pub fn from_json_str(json: &str) -> DumResult<Self> {
        serde_json::from_str(json).map_err(|e| DumError::Configuration {
            message: e.to_string(),
        })
    }

    pub fn with_local_contact(mut self, contact: NameAddr) -> Self {
        self.local_contact = contact;
        self
    }

    pub fn with_via(mut self, transport: &str, host: &str, port: Option<u16>) -> Self {
        self.via_transport = transport.to_string();
        self.via_host = host.to_string();
        self.via_port = port;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_outbound_proxy(mut self, proxy: Uri) -> Self {
        self.outbound_proxy = Some(proxy);
        self
    }

    pub fn with_option_tag(mut self, tag: impl Into<String>) -> Self {
        self.supported_option_tags.push(tag.into());
        self
    }

    pub fn with_mime_type(mut self, mime: MimeType) -> Self {
        if !self.supported_mime_types.iter().any(|m| m.matches(&mime)) {
            self.supported_mime_types.push(mime);
        }
        self
    }

    pub fn with_content_validation(mut self, validation: ContentValidation) -> Self {
        self.content_validation = validation;
        self
    }

    pub fn with_accept_validation(mut self, enabled: bool) -> Self {
        self.validate_accept = enabled;
        self
    }

    pub fn with_default_subscription_expires(mut self, secs: u32) -> Self {
        self.default_subscription_expires = secs;
        self
    }

    pub fn with_subscription_retry(mut self, policy: SubscriptionRetryPolicy) -> Self {
        self.subscription_retry = policy;
        self
    }

    pub fn with_refresh_jitter(mut self, secs: u32) -> Self {
        self.max_refresh_jitter_secs = secs;
        self
    }

    pub fn with_identity(mut self, enabled: bool) -> Self {
        self.compute_identity = enabled;
        self
    }

    pub fn supports_method(&self, method: &Method) -> bool {
        self.supported_methods.contains(method)
    }

    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.supported_schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme))
    }

    pub fn supports_option_tag(&self, tag: &str) -> bool {
        self.supported_option_tags.iter().any(|t| t.eq_ignore_ascii_case(tag))
    }

    pub fn supports_mime_type(&self, mime: &MimeType) -> bool {
        self.supported_mime_types.iter().any(|m| m.matches(mime))
    }

    pub fn supports_encoding(&self, encoding: &str) -> bool {
        self.supported_encodings.iter().any(|e| e.eq_ignore_ascii_case(encoding))
    }

    pub fn supports_language(&self, language: &str) -> bool {
        self.supported_languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DumConfig::default();
        assert_eq!(config.default_subscription_expires, 3600);
        assert_eq!(config.subscription_retry, SubscriptionRetryPolicy::FixedDelay(20));
        assert!(config.supports_method(&Method::Subscribe));
        assert!(config.supports_scheme("SIP"));
        assert!(!config.supports_scheme("mailto"));
        assert!(config.supports_mime_type(&MimeType::new("Application", "SDP")));
    }

    #[test]
    fn test_json_overrides() {
        let json = r#"{
            "subscription_retry": "Immediate",
            "supported_option_tags": ["100rel"],
            "content_validation": "Never"
        }"#;
        let config = DumConfig::from_json_str(json).unwrap();
        assert_eq!(config.subscription_retry, SubscriptionRetryPolicy::Immediate);
        assert!(config.supports_option_tag("100rel"));
        assert_eq!(config.content_validation, ContentValidation::Never);

        assert!(matches!(
            DumConfig::from_json_str("{ \"max_forwards\": \"many\" }"),
            Err(DumError::Configuration { .. })
        ));
    }
}
