//! Subscription-State values, termination reasons (RFC 6665) and failure
//! dispositions (RFC 5057)

use std::fmt;

use sipdum_message::{StatusCode, Token};

/// Value of the Subscription-State header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Active,
    Pending,
    Terminated,
    Extension(String),
}

impl SubscriptionStatus {
    pub fn from_token(token: &Token) -> Self {
        match token.value.to_ascii_lowercase().as_str() {
            "active" => SubscriptionStatus::Active,
            "pending" => SubscriptionStatus::Pending,
            "terminated" => SubscriptionStatus::Terminated,
            _ => SubscriptionStatus::Extension(token.value.clone()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Terminated => "terminated",
            SubscriptionStatus::Extension(value) => value,
        }
    }
}

/// `reason` parameter of a terminated Subscription-State
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminateReason {
    Deactivated,
    Probation,
    Rejected,
    Timeout,
    Giveup,
    NoResource,
    Invariant,
    Other(String),
}

impl TerminateReason {
    pub fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "deactivated" => TerminateReason::Deactivated,
            "probation" => TerminateReason::Probation,
            "rejected" => TerminateReason::Rejected,
            "timeout" => TerminateReason::Timeout,
            "giveup" => TerminateReason::Giveup,
            "noresource" => TerminateReason::NoResource,
            "invariant" => TerminateReason::Invariant,
            _ => TerminateReason::Other(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TerminateReason::Deactivated => "deactivated",
            TerminateReason::Probation => "probation",
            TerminateReason::Rejected => "rejected",
            TerminateReason::Timeout => "timeout",
            TerminateReason::Giveup => "giveup",
            TerminateReason::NoResource => "noresource",
            TerminateReason::Invariant => "invariant",
            TerminateReason::Other(value) => value,
        }
    }

    /// The subscriber should resubscribe at once (RFC 6665 §4.1.3)
    pub fn resubscribe_immediately(&self) -> bool {
        matches!(self, TerminateReason::Deactivated | TerminateReason::Timeout)
    }

    /// The subscriber may resubscribe after Retry-After
    pub fn resubscribe_later(&self) -> bool {
        matches!(self, TerminateReason::Probation | TerminateReason::Giveup)
    }
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a failure response to an in-dialog request ends (RFC 5057 §5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Only the transaction failed
    Transaction,
    /// The usage the request belonged to is gone
    Usage,
    /// The whole dialog is gone
    Dialog,
}

impl FailureDisposition {
    pub fn for_status(code: StatusCode) -> Self {
        match code.as_u16() {
            405 | 408 | 481 | 489 | 501 => FailureDisposition::Usage,
            404 | 410 | 416 | 482 | 483 | 484 | 485 | 502 | 604 => FailureDisposition::Dialog,
            _ => FailureDisposition::Transaction,
        }
    }
}

/// Build a Subscription-State header value
pub fn subscription_state_header(
    status: &SubscriptionStatus,
    expires: Option<u32>,
    reason: Option<&TerminateReason>,
) -> Token {
    let mut token = Token::new(status.as_str());
    if let Some(reason) = reason {
        token = token.with_param("reason", reason.as_str());
    }
    if let Some(expires) = expires {
        token = token.with_param("expires", expires.to_string());
    }
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_header() {
        let token: Token = "Active;expires=600".parse().unwrap();
        assert_eq!(SubscriptionStatus::from_token(&token), SubscriptionStatus::Active);
        let token: Token = "waiting".parse().unwrap();
        assert_eq!(
            SubscriptionStatus::from_token(&token),
            SubscriptionStatus::Extension("waiting".into()),
        );
    }

    #[test]
    fn test_header_rendering() {
        let header = subscription_state_header(
            &SubscriptionStatus::Terminated,
            None,
            Some(&TerminateReason::Timeout),
        );
        assert_eq!(header.to_string(), "terminated;reason=timeout");
        let header = subscription_state_header(&SubscriptionStatus::Active, Some(60), None);
        assert_eq!(header.to_string(), "active;expires=60");
    }

    #[test]
    fn test_dispositions() {
        assert_eq!(
            FailureDisposition::for_status(StatusCode::CALL_OR_TRANSACTION_DOES_NOT_EXIST),
            FailureDisposition::Usage,
        );
        assert_eq!(
            FailureDisposition::for_status(StatusCode::NOT_FOUND),
            FailureDisposition::Dialog,
        );
        assert_eq!(
            FailureDisposition::for_status(StatusCode::BUSY_HERE),
            FailureDisposition::Transaction,
        );
    }
}
