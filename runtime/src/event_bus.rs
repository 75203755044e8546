//! In-process event bus owned by the worker.
//!
//! [`LocalEventBus`] is the default [`EventBus`] for a worker. It keeps
//! subscriptions in registration order and invokes handlers synchronously
//! on the calling thread. Handlers are collected before any of them runs,
//! so a handler may subscribe, unsubscribe or trigger without deadlocking.

use persistent_worker_core::event_bus::{
    matches_pattern, Event, EventBus, EventHandler, SubscriptionId,
};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

struct Subscription {
    id: SubscriptionId,
    event_pattern: String,
    sender_pattern: String,
    handler: EventHandler,
}

/// Synchronous, wildcard-matching event bus.
pub struct LocalEventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LocalEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalEventBus")
            .field("subscriptions", &self.subscription_count())
            .finish()
    }
}

impl LocalEventBus {
    /// Create an empty bus.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl EventBus for LocalEventBus {
    fn subscribe(
        &self,
        event_pattern: &str,
        sender_pattern: &str,
        handler: EventHandler,
    ) -> SubscriptionId {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                event_pattern: event_pattern.to_string(),
                sender_pattern: sender_pattern.to_string(),
                handler,
            });
        tracing::trace!(%id, event_pattern, sender_pattern, "Subscribed");
        id
    }

    fn unsubscribe(&self, event_pattern: &str, sender_pattern: &str, handler: &EventHandler) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|sub| {
            !(sub.event_pattern == event_pattern
                && sub.sender_pattern == sender_pattern
                && Arc::ptr_eq(&sub.handler, handler))
        });
        before != subscriptions.len()
    }

    fn unsubscribe_id(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|sub| sub.id != id);
        before != subscriptions.len()
    }

    fn unsubscribe_all(&self) -> usize {
        let mut subscriptions = self
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = subscriptions.len();
        subscriptions.clear();
        removed
    }

    fn trigger(&self, event: &Event) -> usize {
        let handlers: Vec<EventHandler> = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|sub| {
                matches_pattern(&sub.event_pattern, event.name())
                    && matches_pattern(&sub.sender_pattern, event.sender().id())
            })
            .map(|sub| Arc::clone(&sub.handler))
            .collect();

        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    fn subscription_ids(&self) -> Vec<SubscriptionId> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|sub| sub.id)
            .collect()
    }

    fn subscription_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
