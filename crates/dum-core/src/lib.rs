//! # sipdum-core
//!
//! Dialog usage manager for SIP user agents.
//!
//! This crate sits between a SIP transaction/transport layer and the
//! application. It provides:
//! - Dialog and dialog set tracking (RFC 3261 §12), including forked
//!   responses and NOTIFYs that overtake the 2xx of their SUBSCRIBE
//! - Usage state machines: invite sessions, client and server
//!   subscriptions (RFC 6665, REFER per RFC 3515), registrations,
//!   publications (RFC 3903) and out-of-dialog requests
//! - Inbound validation (405, 415, 416, 420, 406, merged requests)
//! - Outbound decoration: CSeq, Via branch, credentials, outbound proxy
//!   and strict-route handling
//! - Refresh, retry and expiry timers that never need cancelling
//!
//! ## Architecture
//!
//! The [`DialogUsageManager`] owns every dialog set, dialog and usage.
//! Applications refer to usages through typed, copyable [`Handle`]s that
//! turn stale (`DumError::StaleHandle`) once the usage is destroyed, and
//! receive callbacks through the handler traits in [`handlers`]. Every
//! callback gets `&mut DialogUsageManager` so it can act immediately.
//!
//! The manager is synchronous; [`DumRunner`] drives it from a tokio task,
//! interleaving inbound events with due timers.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sipdum_core::{ChannelTransport, DialogUsageManager, DumConfig, DumRunner};
//!
//! # async fn example() {
//! let (transport, _network) = ChannelTransport::new();
//! let config = DumConfig::new("alice", "atlanta.example.com");
//! let dum = DialogUsageManager::new(config, Arc::new(transport));
//! let (runner, sender) = DumRunner::new(dum);
//! let task = tokio::spawn(runner.run());
//!
//! // the network task calls sender.incoming(message) for every parsed message
//! drop(sender);
//! let _dum = task.await;
//! # }
//! ```

pub mod config;
pub mod dialog;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod manager;
pub mod runner;
pub mod timer;
pub mod transport;
pub mod usage;

pub use config::{ContentValidation, DumConfig, SubscriptionRetryPolicy};
pub use dialog::{Dialog, DialogId, DialogSet, DialogSetId};
pub use errors::{DumError, DumResult};
pub use events::DumEvent;
pub use handlers::{
    AppDialogSet, AppDialogSetFactory, ClientAuthManager, ClientOutOfDialogHandler,
    ClientPublicationHandler, ClientRegistrationHandler, ClientSubscriptionHandler,
    DumShutdownHandler, InviteSessionHandler, Security, ServerAuthManager, ServerAuthOutcome,
    ServerOutOfDialogHandler, ServerPublicationHandler, ServerRegistrationHandler,
    ServerSubscriptionHandler,
};
pub use manager::{DialogUsageManager, ShutdownState};
pub use runner::{DumRunner, DumSender};
pub use timer::{DumTimeout, TimeoutKind};
pub use transport::{ChannelTransport, SipTransport, TransportCommand};
pub use usage::{
    ClientOutOfDialogHandle, ClientPublicationHandle, ClientRegistrationHandle,
    ClientSubscriptionHandle, FailureDisposition, Handle, InviteSessionHandle,
    ServerOutOfDialogHandle, ServerPublicationHandle, ServerRegistrationHandle,
    ServerSubscriptionHandle, SubscriptionStatus, TerminateReason,
};

// The message model is part of the public API
pub use sipdum_message;
