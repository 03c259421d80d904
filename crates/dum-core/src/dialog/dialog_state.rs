//! Dialog state and type

use serde::{Deserialize, Serialize};

/// Explicit lifecycle of a dialog
///
/// ```text
/// Forming ──▶ Established ──▶ Terminating
///    │                             ▲
///    └─────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogState {
    /// Early dialog or dialog whose usages have not been confirmed yet
    Forming,
    /// A usage confirmed the dialog (2xx to INVITE, active subscription, ...)
    Established,
    /// Ending; no new usages are attached
    Terminating,
}

impl DialogState {
    pub fn is_terminating(&self) -> bool {
        matches!(self, DialogState::Terminating)
    }
}

impl std::fmt::Display for DialogState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DialogState::Forming => write!(f, "Forming"),
            DialogState::Established => write!(f, "Established"),
            DialogState::Terminating => write!(f, "Terminating"),
        }
    }
}

/// What created the dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DialogType {
    Invitation,
    Subscription,
    /// Placeholder holding a client subscription whose initial SUBSCRIBE
    /// failed, so that the retry policy has a usage to run in
    Fake,
}
