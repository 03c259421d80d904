//! Dialog usage manager errors

use thiserror::Error;

use sipdum_message::MessageError;

use crate::usage::UsageId;

/// Result type for dialog usage manager operations
pub type DumResult<T> = Result<T, DumError>;

/// Errors returned by the dialog usage manager and usage handles
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DumError {
    /// New work refused after `shutdown()` was requested
    #[error("Dialog usage manager is shutting down")]
    ShuttingDown,

    /// The usage behind a handle has been destroyed
    #[error("Stale usage handle {id}")]
    StaleHandle { id: UsageId },

    /// Operation not valid for the usage in its current state
    #[error("Usage misuse: {message}")]
    UsageUse { message: String },

    /// A handler is already registered for this role and key
    #[error("Handler already registered for {role} '{key}'")]
    DuplicateHandler { role: &'static str, key: String },

    /// No handler registered for the requested role and key
    #[error("No handler registered for {role} '{key}'")]
    MissingHandler { role: &'static str, key: String },

    /// Dialog set lookup failed
    #[error("Dialog set not found: {id}")]
    DialogSetNotFound { id: String },

    /// Dialog lookup failed
    #[error("Dialog not found: {id}")]
    DialogNotFound { id: String },

    /// Inbound message lacks what the operation needs
    #[error("Invalid message: {message}")]
    InvalidMessage { message: String },

    /// Message model error
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Configuration could not be loaded
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DumError {
    /// Create a usage misuse error
    pub fn usage_use(message: impl Into<String>) -> Self {
        Self::UsageUse {
            message: message.into(),
        }
    }

    /// Create an invalid message error
    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::InvalidMessage {
            message: message.into(),
        }
    }

    /// Create a dialog set not found error
    pub fn dialog_set_not_found(id: impl ToString) -> Self {
        Self::DialogSetNotFound { id: id.to_string() }
    }

    /// Create a dialog not found error
    pub fn dialog_not_found(id: impl ToString) -> Self {
        Self::DialogNotFound { id: id.to_string() }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Stale handles are recoverable: the usage is simply gone
    pub fn is_stale_handle(&self) -> bool {
        matches!(self, Self::StaleHandle { .. })
    }
}
