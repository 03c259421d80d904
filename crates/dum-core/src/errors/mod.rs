//! Error types for sipdum-core
//!
//! Protocol-level rejections (405, 481, 489, ...) are answered on the wire
//! and never show up here. [`DumError`] covers API misuse by the embedding
//! application, stale usage handles and internal failures.

pub mod dum_errors;

// Re-export main error types
pub use dum_errors::{DumError, DumResult};
