//! Event bus abstraction shared by every request a worker serves.
//!
//! The bus lives in the worker state and therefore outlives any single
//! request. Subscriptions are keyed by an event-name pattern and a
//! sender-id pattern; both accept `*` wildcards, so `("*", "*")` observes
//! every event fired through the bus.
//!
//! # Senders
//!
//! An [`Event`] carries an [`EventSender`] describing who fired it. Senders
//! that keep their own listener lists (components that support `on`/`off`
//! style registration) implement [`Detachable`] and hand the bus a weak
//! reference, so the request lifecycle can ask them to drop listeners that
//! were attached during the request. Senders without that capability are
//! simply skipped.
//!
//! # Example
//!
//! ```rust,ignore
//! use persistent_worker_core::event_bus::{Event, EventBus, EventSender};
//! use std::sync::Arc;
//!
//! fn example(bus: &dyn EventBus) {
//!     let id = bus.subscribe("order.*", "*", Arc::new(|event: &Event| {
//!         tracing::info!(event = %event.name(), "order event");
//!     }));
//!
//!     bus.trigger(&Event::new("order.placed", EventSender::named("checkout")));
//!     bus.unsubscribe_id(id);
//! }
//! ```

use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Weak};

/// Handler invoked for every matching event.
///
/// Handlers are compared by `Arc` identity when unsubscribing.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifier assigned to a subscription by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Capability of an event sender to drop its own listeners by event name.
pub trait Detachable: Send + Sync {
    /// Detach every listener the sender holds for `event_name`.
    ///
    /// Returns how many listeners were removed. Detaching a name that has no
    /// listeners is not an error and returns 0.
    fn detach_listeners(&self, event_name: &str) -> usize;
}

/// Identity of whoever fired an event.
#[derive(Debug, Clone)]
pub struct EventSender {
    id: String,
    detachable: Option<Weak<dyn Detachable>>,
}

impl EventSender {
    /// A sender that cannot detach listeners.
    #[must_use]
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            detachable: None,
        }
    }

    /// A sender backed by a [`Detachable`] target.
    ///
    /// Only a weak reference is kept, so firing an event never extends the
    /// sender's lifetime.
    #[must_use]
    pub fn detachable<T: Detachable + 'static>(id: impl Into<String>, target: &Arc<T>) -> Self {
        let weak: Weak<dyn Detachable> = Arc::downgrade(target) as Weak<T>;
        Self {
            id: id.into(),
            detachable: Some(weak),
        }
    }

    /// Sender identifier, matched against subscription sender patterns.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Weak handle to the sender's detach capability, if any.
    #[must_use]
    pub const fn detach_handle(&self) -> Option<&Weak<dyn Detachable>> {
        self.detachable.as_ref()
    }
}

/// An event fired through the bus.
#[derive(Debug, Clone)]
pub struct Event {
    name: String,
    sender: EventSender,
    payload: Value,
}

impl Event {
    /// Create an event with a null payload.
    #[must_use]
    pub fn new(name: impl Into<String>, sender: EventSender) -> Self {
        Self {
            name: name.into(),
            sender,
            payload: Value::Null,
        }
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Event name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Who fired the event.
    #[must_use]
    pub const fn sender(&self) -> &EventSender {
        &self.sender
    }

    /// Event payload.
    #[must_use]
    pub const fn payload(&self) -> &Value {
        &self.payload
    }
}

/// Publish/subscribe bus with wildcard matching on event and sender.
///
/// Implementations must tolerate re-entrancy: handlers may subscribe,
/// unsubscribe or trigger further events while being invoked.
///
/// Unsubscribing something that is no longer subscribed is a silent no-op
/// that returns `false`.
pub trait EventBus: Send + Sync {
    /// Register `handler` for events whose name matches `event_pattern`
    /// fired by senders whose id matches `sender_pattern`.
    fn subscribe(
        &self,
        event_pattern: &str,
        sender_pattern: &str,
        handler: EventHandler,
    ) -> SubscriptionId;

    /// Remove every subscription registered with exactly these patterns and
    /// this handler (by `Arc` identity).
    ///
    /// Returns `true` if anything was removed.
    fn unsubscribe(&self, event_pattern: &str, sender_pattern: &str, handler: &EventHandler) -> bool;

    /// Remove a single subscription by id.
    ///
    /// Returns `true` if it was still registered.
    fn unsubscribe_id(&self, id: SubscriptionId) -> bool;

    /// Remove every subscription. Returns how many were removed.
    fn unsubscribe_all(&self) -> usize;

    /// Invoke every matching handler. Returns how many handlers ran.
    fn trigger(&self, event: &Event) -> usize;

    /// Ids of all current subscriptions.
    fn subscription_ids(&self) -> Vec<SubscriptionId>;

    /// Number of current subscriptions.
    fn subscription_count(&self) -> usize {
        self.subscription_ids().len()
    }
}

/// Match `value` against a pattern where `*` stands for any run of
/// characters (including none).
#[must_use]
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    let pattern = pattern.as_bytes();
    let value = value.as_bytes();

    let mut p = 0;
    let mut v = 0;
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while v < value.len() {
        match pattern.get(p) {
            Some(b'*') => {
                star = Some(p);
                p += 1;
                resume = v;
            }
            Some(&byte) if byte == value[v] => {
                p += 1;
                v += 1;
            }
            _ => match star {
                Some(star_at) => {
                    p = star_at + 1;
                    resume += 1;
                    v = resume;
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&byte| byte == b'*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl Detachable for Counter {
        fn detach_listeners(&self, _event_name: &str) -> usize {
            self.0.fetch_add(1, Ordering::SeqCst);
            1
        }
    }

    #[test]
    fn test_exact_match() {
        assert!(matches_pattern("beforeRequest", "beforeRequest"));
        assert!(!matches_pattern("beforeRequest", "afterRequest"));
    }

    #[test]
    fn test_wildcards() {
        assert!(matches_pattern("*", ""));
        assert!(matches_pattern("*", "anything"));
        assert!(matches_pattern("order.*", "order.placed"));
        assert!(!matches_pattern("order.*", "payment.placed"));
        assert!(matches_pattern("*Request", "afterRequest"));
        assert!(matches_pattern("a*c*e", "abcde"));
        assert!(!matches_pattern("a*c*e", "abcdf"));
        assert!(matches_pattern("app\\*", "app\\models\\User"));
    }

    #[test]
    fn test_detachable_sender_does_not_keep_target_alive() {
        let target = Arc::new(Counter(AtomicUsize::new(0)));
        let sender = EventSender::detachable("counter", &target);

        let handle = sender.detach_handle().and_then(Weak::upgrade);
        assert!(handle.is_some());
        drop(handle);

        drop(target);
        assert!(sender.detach_handle().and_then(Weak::upgrade).is_none());
    }

    #[test]
    fn test_named_sender_has_no_detach_handle() {
        let event = Event::new("ping", EventSender::named("application"));
        assert_eq!(event.sender().id(), "application");
        assert!(event.sender().detach_handle().is_none());
        assert!(event.payload().is_null());
    }
}
