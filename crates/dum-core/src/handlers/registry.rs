//! Handler registries
//!
//! One handler per event package and role, one per out-of-dialog method and
//! single slots for everything else. Registering twice for the same key is a
//! programming error; the only exception is the built-in "refer" notifier,
//! which an application may replace once.

use std::collections::HashMap;
use std::sync::Arc;

use sipdum_message::Method;

use super::services::{
    AppDialogSetFactory, ClientAuthManager, DumShutdownHandler, Security, ServerAuthManager,
};
use super::usage_handlers::*;
use crate::errors::{DumError, DumResult};

fn insert_unique<K, V>(
    map: &mut HashMap<K, V>,
    key: K,
    value: V,
    role: &'static str,
) -> DumResult<()>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
{
    if map.contains_key(&key) {
        return Err(DumError::DuplicateHandler {
            role,
            key: key.to_string(),
        });
    }
    map.insert(key, value);
    Ok(())
}

fn set_once<V>(slot: &mut Option<V>, value: V, role: &'static str) -> DumResult<()> {
    if slot.is_some() {
        return Err(DumError::DuplicateHandler {
            role,
            key: String::new(),
        });
    }
    *slot = Some(value);
    Ok(())
}

/// Every handler installed on a manager
pub struct HandlerRegistry {
    pub invite: Option<Arc<dyn InviteSessionHandler>>,
    pub client_subscription: HashMap<String, Arc<dyn ClientSubscriptionHandler>>,
    pub server_subscription: HashMap<String, Arc<dyn ServerSubscriptionHandler>>,
    refer_overridden: bool,
    pub client_publication: HashMap<String, Arc<dyn ClientPublicationHandler>>,
    pub server_publication: HashMap<String, Arc<dyn ServerPublicationHandler>>,
    pub client_registration: Option<Arc<dyn ClientRegistrationHandler>>,
    pub server_registration: Option<Arc<dyn ServerRegistrationHandler>>,
    pub client_out_of_dialog: HashMap<Method, Arc<dyn ClientOutOfDialogHandler>>,
    pub server_out_of_dialog: HashMap<Method, Arc<dyn ServerOutOfDialogHandler>>,
    pub client_auth: Option<Arc<dyn ClientAuthManager>>,
    pub server_auth: Option<Arc<dyn ServerAuthManager>>,
    pub security: Option<Arc<dyn Security>>,
    pub app_dialog_set_factory: Option<Arc<dyn AppDialogSetFactory>>,
    pub shutdown: Option<Arc<dyn DumShutdownHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        let mut server_subscription: HashMap<String, Arc<dyn ServerSubscriptionHandler>> =
            HashMap::new();
        server_subscription.insert("refer".to_string(), Arc::new(DefaultReferHandler));
        Self {
            invite: None,
            client_subscription: HashMap::new(),
            server_subscription,
            refer_overridden: false,
            client_publication: HashMap::new(),
            server_publication: HashMap::new(),
            client_registration: None,
            server_registration: None,
            client_out_of_dialog: HashMap::new(),
            server_out_of_dialog: HashMap::new(),
            client_auth: None,
            server_auth: None,
            security: None,
            app_dialog_set_factory: None,
            shutdown: None,
        }
    }
}

impl HandlerRegistry {
    pub fn set_invite(&mut self, handler: Arc<dyn InviteSessionHandler>) -> DumResult<()> {
        set_once(&mut self.invite, handler, "invite session")
    }

    pub fn add_client_subscription(
        &mut self,
        event: &str,
        handler: Arc<dyn ClientSubscriptionHandler>,
    ) -> DumResult<()> {
        insert_unique(
            &mut self.client_subscription,
            event.to_string(),
            handler,
            "client subscription",
        )
    }

    pub fn add_server_subscription(
        &mut self,
        event: &str,
        handler: Arc<dyn ServerSubscriptionHandler>,
    ) -> DumResult<()> {
        if event == "refer" && !self.refer_overridden {
            self.refer_overridden = true;
            self.server_subscription.insert(event.to_string(), handler);
            return Ok(());
        }
        insert_unique(
            &mut self.server_subscription,
            event.to_string(),
            handler,
            "server subscription",
        )
    }

    pub fn add_client_publication(
        &mut self,
        event: &str,
        handler: Arc<dyn ClientPublicationHandler>,
    ) -> DumResult<()> {
        insert_unique(
            &mut self.client_publication,
            event.to_string(),
            handler,
            "client publication",
        )
    }

    pub fn add_server_publication(
        &mut self,
        event: &str,
        handler: Arc<dyn ServerPublicationHandler>,
    ) -> DumResult<()> {
        insert_unique(
            &mut self.server_publication,
            event.to_string(),
            handler,
            "server publication",
        )
    }

    pub fn set_client_registration(
        &mut self,
        handler: Arc<dyn ClientRegistrationHandler>,
    ) -> DumResult<()> {
        set_once(&mut self.client_registration, handler, "client registration")
    }

    pub fn set_server_registration(
        &mut self,
        handler: Arc<dyn ServerRegistrationHandler>,
    ) -> DumResult<()> {
        set_once(&mut self.server_registration, handler, "server registration")
    }

    pub fn add_client_out_of_dialog(
        &mut self,
        method: Method,
        handler: Arc<dyn ClientOutOfDialogHandler>,
    ) -> DumResult<()> {
        insert_unique(&mut self.client_out_of_dialog, method, handler, "client out-of-dialog")
    }

    pub fn add_server_out_of_dialog(
        &mut self,
        method: Method,
        handler: Arc<dyn ServerOutOfDialogHandler>,
    ) -> DumResult<()> {
        insert_unique(&mut self.server_out_of_dialog, method, handler, "server out-of-dialog")
    }

    pub fn set_client_auth(&mut self, manager: Arc<dyn ClientAuthManager>) -> DumResult<()> {
        set_once(&mut self.client_auth, manager, "client auth manager")
    }

    pub fn set_server_auth(&mut self, manager: Arc<dyn ServerAuthManager>) -> DumResult<()> {
        set_once(&mut self.server_auth, manager, "server auth manager")
    }

    pub fn set_security(&mut self, security: Arc<dyn Security>) -> DumResult<()> {
        set_once(&mut self.security, security, "security")
    }

    pub fn set_app_dialog_set_factory(
        &mut self,
        factory: Arc<dyn AppDialogSetFactory>,
    ) -> DumResult<()> {
        set_once(&mut self.app_dialog_set_factory, factory, "app dialog set factory")
    }

    pub fn set_shutdown(&mut self, handler: Arc<dyn DumShutdownHandler>) -> DumResult<()> {
        set_once(&mut self.shutdown, handler, "shutdown handler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::DialogUsageManager;
    use crate::usage::ServerSubscriptionHandle;
    use sipdum_message::Request;

    struct Notifier;

    impl ServerSubscriptionHandler for Notifier {
        fn on_new_subscription(
            &self,
            _dum: &mut DialogUsageManager,
            _sub: ServerSubscriptionHandle,
            _subscribe: &Request,
        ) {
        }
    }

    #[test]
    fn test_duplicate_event_rejected() {
        let mut registry = HandlerRegistry::default();
        registry.add_server_subscription("presence", Arc::new(Notifier)).unwrap();
        let err = registry.add_server_subscription("presence", Arc::new(Notifier)).unwrap_err();
        assert!(matches!(err, DumError::DuplicateHandler { role: "server subscription", .. }));
    }

    #[test]
    fn test_refer_overridable_once() {
        let mut registry = HandlerRegistry::default();
        assert!(registry.server_subscription.contains_key("refer"));
        registry.add_server_subscription("refer", Arc::new(Notifier)).unwrap();
        assert!(registry.add_server_subscription("refer", Arc::new(Notifier)).is_err());
    }
}
