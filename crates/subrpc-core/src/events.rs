//! Typed publish/subscribe register used by providers to announce
//! connection state changes.
//!
//! Handlers for one event kind run in registration order. `once` handlers
//! are removed from the register before any handler of that emission runs,
//! and handlers are invoked with the register unlocked, so a handler may
//! itself call `on`/`off`/`emit`.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};

use crate::error::TransportError;

/// Connection lifecycle events published by providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderEvent {
    Connected,
    Disconnected,
    Error,
}

impl std::fmt::Display for ProviderEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connected => write!(f, "connected"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A shared event handler.
pub type EventHandler<P> = Arc<dyn Fn(&P) + Send + Sync>;

/// Payload of a provider event: the error for `Error`/`Disconnected`.
pub type ProviderEventData = Option<TransportError>;

/// Emitter specialised for provider lifecycle events.
pub type ProviderEmitter = EventEmitter<ProviderEvent, ProviderEventData>;

/// Handle returned by [`ProviderEmitter::on`].
pub type ProviderListener = Listener<ProviderEvent, ProviderEventData>;

/// Identifies one registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Entry<P> {
    id: HandlerId,
    once: bool,
    handler: EventHandler<P>,
}

struct Registry<K, P> {
    next_id: u64,
    handlers: HashMap<K, Vec<Entry<P>>>,
}

impl<K: Hash + Eq, P> Registry<K, P> {
    fn remove(&mut self, kind: &K, id: HandlerId) -> bool {
        let Some(list) = self.handlers.get_mut(kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| e.id != id);
        before != list.len()
    }
}

/// Clonable handler register keyed by event kind `K`, carrying payload `P`.
pub struct EventEmitter<K, P> {
    registry: Arc<Mutex<Registry<K, P>>>,
}

impl<K, P> Clone for EventEmitter<K, P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<K, P> Default for EventEmitter<K, P> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                handlers: HashMap::new(),
            })),
        }
    }
}

impl<K, P> EventEmitter<K, P>
where
    K: Hash + Eq + Copy,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every future `kind` emission.
    pub fn on<F>(&self, kind: K, handler: F) -> Listener<K, P>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), false)
    }

    /// Register a shared handler.
    pub fn on_shared(&self, kind: K, handler: EventHandler<P>) -> Listener<K, P> {
        self.register(kind, handler, false)
    }

    /// Register `handler` for the next `kind` emission only.
    pub fn once<F>(&self, kind: K, handler: F) -> Listener<K, P>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), true)
    }

    /// Remove a handler. Returns `false` if it was not registered.
    pub fn off(&self, kind: K, id: HandlerId) -> bool {
        self.registry.lock().unwrap().remove(&kind, id)
    }

    /// Invoke every handler registered for `kind`; returns how many ran.
    pub fn emit(&self, kind: K, payload: &P) -> usize {
        let snapshot: Vec<EventHandler<P>> = {
            let mut registry = self.registry.lock().unwrap();
            let Some(list) = registry.handlers.get_mut(&kind) else {
                return 0;
            };
            let snapshot = list.iter().map(|e| Arc::clone(&e.handler)).collect();
            list.retain(|e| !e.once);
            snapshot
        };

        for handler in &snapshot {
            handler(payload);
        }
        snapshot.len()
    }

    pub fn listener_count(&self, kind: K) -> usize {
        self.registry
            .lock()
            .unwrap()
            .handlers
            .get(&kind)
            .map_or(0, Vec::len)
    }

    fn register(&self, kind: K, handler: EventHandler<P>, once: bool) -> Listener<K, P> {
        let mut registry = self.registry.lock().unwrap();
        let id = HandlerId(registry.next_id);
        registry.next_id += 1;
        registry
            .handlers
            .entry(kind)
            .or_default()
            .push(Entry { id, once, handler });
        Listener {
            registry: Arc::downgrade(&self.registry),
            kind,
            id,
        }
    }
}

/// Registration handle; call [`Listener::remove`] to unregister.
///
/// Dropping the handle leaves the handler registered.
pub struct Listener<K, P> {
    registry: Weak<Mutex<Registry<K, P>>>,
    kind: K,
    id: HandlerId,
}

impl<K: Hash + Eq + Copy, P> Listener<K, P> {
    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn kind(&self) -> K {
        self.kind
    }

    /// Unregister the handler. Returns `false` if it was already gone.
    pub fn remove(self) -> bool {
        match self.registry.upgrade() {
            Some(registry) => registry.lock().unwrap().remove(&self.kind, self.id),
            None => false,
        }
    }
}

impl<K: std::fmt::Debug, P> std::fmt::Debug for Listener<K, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}
