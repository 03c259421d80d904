//! Application-facing handler traits and collaborator services
//!
//! - [`usage_handlers`]: callbacks per usage role (invite, subscriptions,
//!   registrations, publications, out-of-dialog requests)
//! - [`services`]: authentication, security, application dialog sets and
//!   shutdown notification
//! - [`registry`]: the per-manager table of installed handlers

pub mod registry;
pub mod services;
pub mod usage_handlers;

pub use registry::HandlerRegistry;
pub use services::{
    AppDialogSet, AppDialogSetFactory, ClientAuthManager, DumShutdownHandler, Security,
    ServerAuthManager, ServerAuthOutcome,
};
pub use usage_handlers::{
    ClientOutOfDialogHandler, ClientPublicationHandler, ClientRegistrationHandler,
    ClientSubscriptionHandler, DefaultReferHandler, InviteSessionHandler, ServerOutOfDialogHandler,
    ServerPublicationHandler, ServerRegistrationHandler, ServerSubscriptionHandler,
};
