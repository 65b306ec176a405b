//! Store-scoped event dispatch.
//!
//! The pub/sub bus belongs to the host application. A remote store only
//! prefixes event names with its own name (`"<store>:<event>"`) before
//! handing them to the bus.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use couchsync_common::{ChangeKind, Error, RemoteObject};

/// Data carried by an event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// No arguments.
    Empty,
    /// A single object (`add`, `update:<type>`, ...).
    Object(RemoteObject),
    /// Kind plus object (`change`, `change:<type>`, ...).
    Change(ChangeKind, RemoteObject),
    /// A failure reported by the pull loop.
    Error(Error),
}

/// Event handler. Receives the full event name and the payload.
pub type Handler = Arc<dyn Fn(&str, &EventPayload) + Send + Sync>;

/// External pub/sub bus.
pub trait EventBus: Send + Sync {
    /// Subscribe `handler` to every whitespace-separated name in `events`.
    fn subscribe(&self, events: &str, handler: Handler);

    /// Remove `handler` from every whitespace-separated name in `events`.
    fn unsubscribe(&self, events: &str, handler: &Handler);

    /// Deliver `payload` to the subscribers of `event`.
    fn emit(&self, event: &str, payload: &EventPayload);
}

/// Simple in-process bus.
#[derive(Default)]
pub struct MemoryBus {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers subscribed to `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .map_or(0, Vec::len)
    }
}

impl EventBus for MemoryBus {
    fn subscribe(&self, events: &str, handler: Handler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for event in events.split_whitespace() {
            handlers
                .entry(event.to_string())
                .or_default()
                .push(handler.clone());
        }
    }

    fn unsubscribe(&self, events: &str, handler: &Handler) {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        for event in events.split_whitespace() {
            if let Some(list) = handlers.get_mut(event) {
                list.retain(|h| !Arc::ptr_eq(h, handler));
                if list.is_empty() {
                    handlers.remove(event);
                }
            }
        }
    }

    fn emit(&self, event: &str, payload: &EventPayload) {
        // Handlers run outside the lock so they may subscribe or emit.
        let subscribers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event)
            .cloned()
            .unwrap_or_default();

        for handler in subscribers {
            handler(event, payload);
        }
    }
}

/// Prefixes event names with a store name before delegating to a bus.
#[derive(Clone)]
pub struct EventNamespace {
    name: String,
    bus: Arc<dyn EventBus>,
}

impl EventNamespace {
    /// Scope `bus` to the store called `name`.
    pub fn new(name: impl Into<String>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            name: name.into(),
            bus,
        }
    }

    /// Store name used as prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace every whitespace-separated event name in `events`.
    pub fn qualify(&self, events: &str) -> String {
        events
            .split_whitespace()
            .map(|event| format!("{}:{}", self.name, event))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Subscribe to one or more store events with a single bus call.
    pub fn on(&self, events: &str, handler: Handler) {
        self.bus.subscribe(&self.qualify(events), handler);
    }

    /// Unsubscribe from one or more store events.
    pub fn off(&self, events: &str, handler: &Handler) {
        self.bus.unsubscribe(&self.qualify(events), handler);
    }

    /// Emit a store event.
    pub fn trigger(&self, event: &str, payload: EventPayload) {
        self.bus
            .emit(&format!("{}:{}", self.name, event), &payload);
    }
}
