//! The module contract: how service implementations plug into the node.
//!
//! The runtime resolves service types by name from a [`ModuleRegistry`]
//! installed at startup. A [`Module`] is the factory; the [`Service`] it
//! creates is the single-threaded instance driven by the dispatcher.
//! Release is `Drop`; the signal entry point is a thread-safe hook
//! captured at launch, because signals may arrive while a dispatch is
//! running on another thread.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use warren_core::Message;

use crate::scope::ServiceScope;

/// Error returned by a failing [`Service::init`]; the service is retired
/// and its pending mailbox drained with error replies.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ServiceError(pub String);

impl ServiceError {
    pub fn new(message: impl Into<String>) -> ServiceError {
        ServiceError(message.into())
    }
}

/// A thread-safe signal entry point.
pub type SignalHook = Arc<dyn Fn(i32) + Send + Sync>;

/// A service instance. The dispatcher guarantees `init` and `dispatch`
/// are never invoked concurrently for one instance.
pub trait Service: Send {
    /// One-time initialization. The service may already send, register
    /// names, and launch other services here; failure retires it.
    fn init(&mut self, scope: &ServiceScope<'_>, args: &str) -> Result<(), ServiceError>;

    /// Handle one mailbox message. The message is owned: dropping it
    /// frees the payload, keeping or forwarding it is a move.
    fn dispatch(&mut self, scope: &ServiceScope<'_>, message: Message);

    /// Optional thread-safe hook invoked by the `SIGNAL` command, even
    /// while a dispatch is running. Captured once after init.
    fn signal_hook(&self) -> Option<SignalHook> {
        None
    }
}

/// A named service factory.
pub trait Module: Send + Sync {
    fn create(&self) -> Box<dyn Service>;
}

/// Plain constructor functions work as modules.
impl<F> Module for F
where
    F: Fn() -> Box<dyn Service> + Send + Sync,
{
    fn create(&self) -> Box<dyn Service> {
        self()
    }
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Name → factory table, installed by the embedding host before the node
/// starts.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<HashMap<String, Arc<dyn Module>>>,
}

impl ModuleRegistry {
    pub fn new() -> ModuleRegistry {
        ModuleRegistry::default()
    }

    /// Install a factory under `name`, replacing any previous one.
    pub fn install(&self, name: impl Into<String>, module: Arc<dyn Module>) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), module);
    }

    pub fn query(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("ModuleRegistry").field("modules", &names).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl Service for Nop {
        fn init(&mut self, _scope: &ServiceScope<'_>, _args: &str) -> Result<(), ServiceError> {
            Ok(())
        }

        fn dispatch(&mut self, _scope: &ServiceScope<'_>, _message: Message) {}
    }

    #[test]
    fn closures_are_modules() {
        let registry = ModuleRegistry::new();
        registry.install(
            "nop",
            Arc::new(|| Box::new(Nop) as Box<dyn Service>),
        );
        assert!(registry.query("nop").is_some());
        assert!(registry.query("missing").is_none());
        let _instance = registry.query("nop").unwrap().create();
    }
}
