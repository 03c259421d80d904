//! Error types for the message model

use thiserror::Error;

/// Result type for message model operations
pub type MessageResult<T> = Result<T, MessageError>;

/// Errors raised while building or parsing message values
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    /// A textual value could not be parsed
    #[error("Failed to parse {kind}: '{input}'")]
    Parse {
        kind: &'static str,
        input: String,
    },

    /// A header required for the operation is absent
    #[error("Missing header: {header}")]
    MissingHeader { header: &'static str },

    /// Status code outside 100..=699
    #[error("Invalid status code: {code}")]
    InvalidStatus { code: u16 },
}

impl MessageError {
    /// Create a parse error for the given value kind
    pub fn parse(kind: &'static str, input: impl Into<String>) -> Self {
        Self::Parse {
            kind,
            input: input.into(),
        }
    }

    /// Create a missing-header error
    pub fn missing(header: &'static str) -> Self {
        Self::MissingHeader { header }
    }
}
