//! Typed event bus shared by the signaling client and call sessions.
//!
//! The client publishes every inbound [`SipMessage`](crate::SipMessage) on its
//! bus; sessions publish [`SessionEvent`](crate::SessionEvent)s on their own.
//! Handlers are plain closures keyed by event type.
//!
//! ## Notes
//! - Handlers run on the emitting thread, after the handler table lock is
//!   released, so a handler may unsubscribe itself (or others) while running.
//! - [`Subscription`] removes its handler on drop; prefer it over raw
//!   [`HandlerId`]s for anything that must not outlive its owner.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

/// Anything that can travel on the bus
pub trait Event: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Event for T {}

/// Shared handler for events of type `E`
pub type SyncHandler<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Handler ID for unsubscribing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

type HandlerTable = HashMap<TypeId, Vec<(HandlerId, Box<dyn Any + Send + Sync>)>>;

/// Event bus for managing and dispatching events
pub struct EventBus {
    handlers: RwLock<HandlerTable>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    fn next_handler_id(&self) -> HandlerId {
        HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register a handler for `E`
    pub fn on<E: Event, F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler_id = self.next_handler_id();
        let boxed_handler: SyncHandler<E> = Arc::new(handler);

        self.handlers
            .write()
            .entry(TypeId::of::<E>())
            .or_default()
            .push((handler_id, Box::new(boxed_handler) as Box<dyn Any + Send + Sync>));

        handler_id
    }

    /// Remove a handler by ID; false when it was already gone
    pub fn off(&self, handler_id: HandlerId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for entries in handlers.values_mut() {
            let before = entries.len();
            entries.retain(|(id, _)| *id != handler_id);
            removed |= entries.len() != before;
        }
        removed
    }

    /// Deliver `event` to every handler registered for its type
    pub fn emit<E: Event>(&self, event: &E) {
        let snapshot: Vec<SyncHandler<E>> = {
            let handlers = self.handlers.read();
            handlers
                .get(&TypeId::of::<E>())
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(|(_, h)| h.downcast_ref::<SyncHandler<E>>().cloned())
                        .collect()
                })
                .unwrap_or_default()
        };

        for handler in snapshot {
            handler(event);
        }
    }

    pub fn handler_count<E: Event>(&self) -> usize {
        self.handlers
            .read()
            .get(&TypeId::of::<E>())
            .map_or(0, Vec::len)
    }

    /// Register a handler that is removed when the returned handle drops
    pub fn subscribe<E: Event, F>(self: &Arc<Self>, handler: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let handler_id = self.on(handler);
        Subscription {
            bus: Arc::downgrade(self),
            handler_id,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle that automatically unsubscribes when dropped
pub struct Subscription {
    bus: Weak<EventBus>,
    handler_id: HandlerId,
}

impl Subscription {
    pub fn id(&self) -> HandlerId {
        self.handler_id
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.off(self.handler_id);
        }
    }
}
