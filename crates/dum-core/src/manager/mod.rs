//! # Dialog Usage Manager
//!
//! [`DialogUsageManager`] is the single entry point for the transport layer
//! and the application. It owns every dialog set (and through them every
//! dialog), the usage registry, the timer queue, the handler registry and
//! the pending tables used for deferred processing.
//!
//! ## Modules
//!
//! The manager's behaviour is split by concern into `impl` blocks:
//!
//! - [`send`]: outbound decoration (branch, credentials, proxy, strict routes)
//! - [`factory`]: `make_*` request factories
//! - [`validation`]: the inbound request validation pipeline
//! - [`security`]: server authentication and identity checks
//! - [`routing`]: inbound request demultiplexing
//! - [`response_routing`]: inbound response demultiplexing
//! - [`lifecycle`]: timers, usage destruction and `possibly_die`
//! - [`shutdown`]: the shutdown state machine
//!
//! Usage-specific dispatch lives next to each usage in [`crate::usage`].
//!
//! ## Control flow
//!
//! ```text
//! DumEvent ─▶ process ─▶ validate ─▶ auth ─▶ identity ─▶ dispatch
//!                                                          │
//!            DialogSet (by DialogSetId) ◀──────────────────┘
//!                 └─▶ Dialog (by DialogId) ─▶ usage ─▶ handler callback
//! ```

pub mod factory;
pub mod lifecycle;
pub mod response_routing;
pub mod routing;
pub mod security;
pub mod send;
pub mod shutdown;
pub mod validation;

pub use security::PendingIdentity;
pub use shutdown::ShutdownState;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use sipdum_message::{Method, Request};

use crate::config::DumConfig;
use crate::dialog::{Creator, Dialog, DialogId, DialogSet, DialogSetId, MergedRequestKey};
use crate::errors::DumResult;
use crate::events::DumEvent;
use crate::handlers::*;
use crate::timer::{DumTimeout, TimerQueue};
use crate::transport::SipTransport;
use crate::usage::{Handle, ServerPublicationHandle, UsageKind, UsageRegistry};

/// First sighting of a tag-less request
#[derive(Debug, Clone)]
pub(crate) struct MergedEntry {
    pub branch: Option<String>,
    pub seen: Instant,
}

/// The dialog usage manager
pub struct DialogUsageManager {
    pub(crate) config: DumConfig,
    pub(crate) transport: Arc<dyn SipTransport>,
    pub(crate) dialog_sets: BTreeMap<DialogSetId, DialogSet>,
    /// (Call-ID, From tag) of inbound initial requests, for CANCEL
    pub(crate) uas_sets: HashMap<(String, String), DialogSetId>,
    pub(crate) registry: UsageRegistry,
    pub(crate) timers: TimerQueue,
    pub(crate) merged_requests: HashMap<MergedRequestKey, MergedEntry>,
    pub(crate) handlers: HandlerRegistry,
    /// Requests waiting for a server auth decision, by transaction id
    pub(crate) pending_auth: HashMap<String, Request>,
    /// Requests waiting for an identity probe, by probe transaction id
    pub(crate) pending_identity: HashMap<String, PendingIdentity>,
    /// Server publications by current entity tag
    pub(crate) publications: HashMap<String, ServerPublicationHandle>,
    pub(crate) shutdown_state: ShutdownState,
}

impl DialogUsageManager {
    pub fn new(config: DumConfig, transport: Arc<dyn SipTransport>) -> Self {
        debug!("Creating dialog usage manager for {}", config.local_identity);
        Self {
            config,
            transport,
            dialog_sets: BTreeMap::new(),
            uas_sets: HashMap::new(),
            registry: UsageRegistry::new(),
            timers: TimerQueue::new(),
            merged_requests: HashMap::new(),
            handlers: HandlerRegistry::default(),
            pending_auth: HashMap::new(),
            pending_identity: HashMap::new(),
            publications: HashMap::new(),
            shutdown_state: ShutdownState::Running,
        }
    }

    pub fn config(&self) -> &DumConfig {
        &self.config
    }

    /// Demultiplexing entry point for everything the transport and timers deliver
    pub fn process(&mut self, event: DumEvent) {
        match event {
            DumEvent::Incoming(sipdum_message::Message::Request(request)) => {
                self.process_request(request)
            }
            DumEvent::Incoming(sipdum_message::Message::Response(response)) => {
                self.process_response(response)
            }
            DumEvent::Timeout(timeout) => self.on_timeout(timeout),
            DumEvent::ParseFailure { source, reason } => {
                warn!("Dropping unparseable message from {:?}: {}", source, reason);
            }
            DumEvent::AuthResult {
                transaction_id,
                accepted,
            } => self.on_auth_result(&transaction_id, accepted),
        }
    }

    // Handler registration

    pub fn set_invite_session_handler(
        &mut self,
        handler: Arc<dyn InviteSessionHandler>,
    ) -> DumResult<()> {
        self.handlers.set_invite(handler)
    }

    pub fn add_client_subscription_handler(
        &mut self,
        event: &str,
        handler: Arc<dyn ClientSubscriptionHandler>,
    ) -> DumResult<()> {
        self.handlers.add_client_subscription(event, handler)
    }

    /// Register a notifier; "refer" replaces the built-in handler once
    pub fn add_server_subscription_handler(
        &mut self,
        event: &str,
        handler: Arc<dyn ServerSubscriptionHandler>,
    ) -> DumResult<()> {
        self.handlers.add_server_subscription(event, handler)
    }

    pub fn add_client_publication_handler(
        &mut self,
        event: &str,
        handler: Arc<dyn ClientPublicationHandler>,
    ) -> DumResult<()> {
        self.handlers.add_client_publication(event, handler)
    }

    pub fn add_server_publication_handler(
        &mut self,
        event: &str,
        handler: Arc<dyn ServerPublicationHandler>,
    ) -> DumResult<()> {
        self.handlers.add_server_publication(event, handler)
    }

    pub fn set_client_registration_handler(
        &mut self,
        handler: Arc<dyn ClientRegistrationHandler>,
    ) -> DumResult<()> {
        self.handlers.set_client_registration(handler)
    }

    pub fn set_server_registration_handler(
        &mut self,
        handler: Arc<dyn ServerRegistrationHandler>,
    ) -> DumResult<()> {
        self.handlers.set_server_registration(handler)
    }

    pub fn add_client_out_of_dialog_handler(
        &mut self,
        method: Method,
        handler: Arc<dyn ClientOutOfDialogHandler>,
    ) -> DumResult<()> {
        self.handlers.add_client_out_of_dialog(method, handler)
    }

    pub fn add_server_out_of_dialog_handler(
        &mut self,
        method: Method,
        handler: Arc<dyn ServerOutOfDialogHandler>,
    ) -> DumResult<()> {
        self.handlers.add_server_out_of_dialog(method, handler)
    }

    pub fn set_client_auth_manager(
        &mut self,
        manager: Arc<dyn ClientAuthManager>,
    ) -> DumResult<()> {
        self.handlers.set_client_auth(manager)
    }

    pub fn set_server_auth_manager(
        &mut self,
        manager: Arc<dyn ServerAuthManager>,
    ) -> DumResult<()> {
        self.handlers.set_server_auth(manager)
    }

    pub fn set_security(&mut self, security: Arc<dyn Security>) -> DumResult<()> {
        self.handlers.set_security(security)
    }

    pub fn set_app_dialog_set_factory(
        &mut self,
        factory: Arc<dyn AppDialogSetFactory>,
    ) -> DumResult<()> {
        self.handlers.set_app_dialog_set_factory(factory)
    }

    pub fn set_shutdown_handler(&mut self, handler: Arc<dyn DumShutdownHandler>) -> DumResult<()> {
        self.handlers.set_shutdown(handler)
    }

    // Lookups

    pub fn find_dialog_set(&self, id: &DialogSetId) -> Option<&DialogSet> {
        self.dialog_sets.get(id)
    }

    pub fn find_dialog(&self, id: &DialogId) -> Option<&Dialog> {
        self.dialog_sets.get(&id.dialog_set_id())?.dialogs.get(id)
    }

    pub fn find_creator(&self, id: &DialogSetId) -> Option<&Creator> {
        self.dialog_sets.get(id)?.creator.as_ref()
    }

    /// Resolve a handle; fails with `StaleHandle` once the usage is gone
    pub fn get_usage<K: UsageKind>(&self, handle: Handle<K>) -> DumResult<&K> {
        self.registry.get(handle)
    }

    pub fn app_dialog_set(&self, id: &DialogSetId) -> Option<Arc<dyn AppDialogSet>> {
        self.dialog_sets.get(id)?.app_dialog_set.clone()
    }

    pub fn dialog_set_count(&self) -> usize {
        self.dialog_sets.len()
    }

    pub fn usage_count(&self) -> usize {
        self.registry.len()
    }

    /// Scheduled timeouts with their deadlines
    pub fn pending_timers(&self) -> impl Iterator<Item = (Instant, &DumTimeout)> {
        self.timers.pending()
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    pub(crate) fn dialog_mut(&mut self, id: &DialogId) -> Option<&mut Dialog> {
        dialog_entry(&mut self.dialog_sets, id)
    }
}

/// Dialog lookup borrowing only the dialog set map
pub(crate) fn dialog_entry<'a>(
    sets: &'a mut BTreeMap<DialogSetId, DialogSet>,
    id: &DialogId,
) -> Option<&'a mut Dialog> {
    sets.get_mut(&id.dialog_set_id())?.dialogs.get_mut(id)
}
