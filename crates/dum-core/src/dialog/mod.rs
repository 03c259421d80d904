//! Dialogs, dialog sets and their identifiers
//!
//! - [`DialogId`] / [`DialogSetId`]: map keys, local point of view
//! - [`Dialog`]: one leg; route set, CSeq counters, attached usages
//! - [`DialogSet`]: dialogs from one initial request plus its [`Creator`]
//! - [`dialog_utils`]: tag/branch/Call-ID generation and CANCEL building
//!
//! ## Ownership
//!
//! ```text
//! DialogUsageManager
//!   └── DialogSet (by DialogSetId)
//!         ├── Creator
//!         ├── Dialog (by DialogId) ── handles ──▶ usages in the registry
//!         └── dialog-less usage handle
//! ```

pub mod creator;
pub mod dialog_id;
pub mod dialog_impl;
pub mod dialog_set;
pub mod dialog_state;
pub mod dialog_utils;

// Re-export main types
pub use creator::{Creator, CreatorKind};
pub use dialog_id::{DialogId, DialogSetId, MergedRequestKey};
pub use dialog_impl::Dialog;
pub use dialog_set::{DialogSet, DialogSetState};
pub use dialog_state::{DialogState, DialogType};
