//! Namespaces and their event handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;

use super::packet::Arg;
use super::socket::NamespaceSocket;
use crate::core::{HandlerError, ROOT_NAMESPACE};

/// Boxed event handler.
///
/// Receives the namespace-scoped socket and the decoded arguments; the
/// returned values become the acknowledgement payload when the sender asked
/// for one.
pub type EventHandler = Arc<
    dyn Fn(NamespaceSocket, Vec<Arg>) -> BoxFuture<'static, Result<Vec<Arg>, HandlerError>>
        + Send
        + Sync,
>;

/// A named sub-channel with its own event handlers.
pub struct Namespace {
    name: String,
    handlers: RwLock<HashMap<String, EventHandler>>,
}

impl Namespace {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Namespace name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `handler` for `event`, replacing any previous one.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F)
    where
        F: Fn(NamespaceSocket, Vec<Arg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<Arg>, HandlerError>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |socket, args| Box::pin(handler(socket, args)));
        self.handlers.write().insert(event.into(), handler);
    }

    /// Handler registered for `event`.
    pub fn handler(&self, event: &str) -> Option<EventHandler> {
        self.handlers.read().get(event).cloned()
    }

    /// Registered event names.
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.handlers.read().keys().cloned().collect();
        events.sort();
        events
    }
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace")
            .field("name", &self.name)
            .field("events", &self.events())
            .finish()
    }
}

/// Namespaces owned by one engine.
///
/// Namespaces are created on first reference and live as long as the
/// registry. The root namespace always exists.
#[derive(Debug)]
pub struct NamespaceRegistry {
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
}

impl NamespaceRegistry {
    /// Create a registry holding only the root namespace.
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(
            ROOT_NAMESPACE.to_string(),
            Arc::new(Namespace::new(ROOT_NAMESPACE)),
        );
        Self {
            namespaces: RwLock::new(namespaces),
        }
    }

    /// Get `name`, creating it if needed.
    pub fn get_or_create(&self, name: &str) -> Arc<Namespace> {
        if let Some(ns) = self.get(name) {
            return ns;
        }
        self.namespaces
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Namespace::new(name)))
            .clone()
    }

    /// Get `name` if it has been referenced.
    pub fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces.read().get(name).cloned()
    }

    /// Known namespace names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for NamespaceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
