//! Event-handler leak guard.
//!
//! The worker's event bus outlives every request, so anything a request
//! subscribes must be removed before the next one starts. The guard records
//! every event fired while it is tracking, asks each [`Detachable`] sender
//! to drop its listeners for those events (newest first), then sweeps
//! whatever subscriptions are left over.
//!
//! [`Detachable`]: persistent_worker_core::event_bus::Detachable

use persistent_worker_core::event_bus::{Detachable, Event, EventBus, SubscriptionId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// How much the safety-net sweep removes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepScope {
    /// Subscriptions created since tracking started
    #[default]
    Request,
    /// Every subscription on the bus
    Global,
}

/// An event observed while tracking.
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Event name
    pub name: String,
    /// Sender id
    pub sender_id: String,
    sender: Option<Weak<dyn Detachable>>,
}

impl RecordedEvent {
    fn from_event(event: &Event) -> Self {
        Self {
            name: event.name().to_string(),
            sender_id: event.sender().id().to_string(),
            sender: event.sender().detach_handle().cloned(),
        }
    }

    /// Whether the sender can detach listeners.
    #[must_use]
    pub const fn is_detachable(&self) -> bool {
        self.sender.is_some()
    }
}

/// Outcome of [`EventLeakGuard::stop_and_detach`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DetachReport {
    /// Events recorded while tracking
    pub events_recorded: usize,
    /// Listeners removed by their senders
    pub listeners_detached: usize,
    /// Recorded senders that no longer existed
    pub senders_gone: usize,
    /// Subscriptions removed by the sweep
    pub swept: usize,
}

struct Tracking {
    catch_all: SubscriptionId,
    baseline: HashSet<SubscriptionId>,
    recorded: Arc<Mutex<Vec<RecordedEvent>>>,
}

/// Records events for one request and detaches their listeners afterwards.
pub struct EventLeakGuard {
    bus: Arc<dyn EventBus>,
    sweep: SweepScope,
    tracking: Option<Tracking>,
}

impl std::fmt::Debug for EventLeakGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLeakGuard")
            .field("sweep", &self.sweep)
            .field("tracking", &self.is_tracking())
            .finish_non_exhaustive()
    }
}

impl EventLeakGuard {
    /// Guard for `bus`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, sweep: SweepScope) -> Self {
        Self {
            bus,
            sweep,
            tracking: None,
        }
    }

    /// Whether tracking is active.
    #[must_use]
    pub const fn is_tracking(&self) -> bool {
        self.tracking.is_some()
    }

    /// Events recorded so far.
    #[must_use]
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.tracking.as_ref().map_or_else(Vec::new, |tracking| {
            tracking
                .recorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Snapshot the bus and register the catch-all recorder.
    ///
    /// Tracking left over from an earlier cycle is stopped first.
    pub fn start_tracking(&mut self) {
        if self.is_tracking() {
            tracing::warn!("Leak guard was still tracking, detaching previous cycle");
            self.stop_and_detach();
        }

        let baseline = self.bus.subscription_ids().into_iter().collect();
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&recorded);
        let catch_all = self.bus.subscribe(
            "*",
            "*",
            Arc::new(move |event: &Event| {
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(RecordedEvent::from_event(event));
            }),
        );

        self.tracking = Some(Tracking {
            catch_all,
            baseline,
            recorded,
        });
    }

    /// Remove the recorder, detach recorded listeners newest first, then sweep.
    ///
    /// Without a prior [`start_tracking`](Self::start_tracking) this does
    /// nothing. Senders that have been dropped are skipped.
    pub fn stop_and_detach(&mut self) -> DetachReport {
        let Some(tracking) = self.tracking.take() else {
            return DetachReport::default();
        };

        self.bus.unsubscribe_id(tracking.catch_all);
        let recorded = std::mem::take(
            &mut *tracking
                .recorded
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );

        let mut report = DetachReport {
            events_recorded: recorded.len(),
            ..DetachReport::default()
        };

        for event in recorded.iter().rev() {
            let Some(handle) = &event.sender else {
                continue;
            };
            match handle.upgrade() {
                Some(sender) => report.listeners_detached += sender.detach_listeners(&event.name),
                None => report.senders_gone += 1,
            }
        }

        report.swept = match self.sweep {
            SweepScope::Request => self
                .bus
                .subscription_ids()
                .into_iter()
                .filter(|id| !tracking.baseline.contains(id))
                .filter(|id| self.bus.unsubscribe_id(*id))
                .count(),
            SweepScope::Global => self.bus.unsubscribe_all(),
        };

        metrics::counter!("worker_listeners_detached_total")
            .increment((report.listeners_detached + report.swept) as u64);
        tracing::debug!(
            events = report.events_recorded,
            detached = report.listeners_detached,
            senders_gone = report.senders_gone,
            swept = report.swept,
            "Event listeners detached"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::event_bus::LocalEventBus;
    use persistent_worker_core::event_bus::{EventHandler, EventSender};

    /// Sender owning listeners it registers on the shared bus.
    struct Widget {
        bus: Arc<dyn EventBus>,
        listeners: Mutex<Vec<(String, SubscriptionId)>>,
    }

    impl Widget {
        fn on(&self, name: &str) {
            let handler: EventHandler = Arc::new(|_: &Event| {});
            let id = self.bus.subscribe(name, "widget", handler);
            self.listeners.lock().unwrap().push((name.to_string(), id));
        }
    }

    impl Detachable for Widget {
        fn detach_listeners(&self, event_name: &str) -> usize {
            let mut listeners = self.listeners.lock().unwrap();
            let mut removed = 0;
            listeners.retain(|(name, id)| {
                if name == event_name {
                    if self.bus.unsubscribe_id(*id) {
                        removed += 1;
                    }
                    false
                } else {
                    true
                }
            });
            removed
        }
    }

    fn setup() -> (Arc<dyn EventBus>, EventLeakGuard) {
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        let guard = EventLeakGuard::new(Arc::clone(&bus), SweepScope::Request);
        (bus, guard)
    }

    #[test]
    fn test_start_then_stop_leaves_bus_unchanged() {
        let (bus, mut guard) = setup();
        let existing = bus.subscribe("boot", "*", Arc::new(|_: &Event| {}));

        guard.start_tracking();
        assert_eq!(bus.subscription_count(), 2);
        let report = guard.stop_and_detach();

        assert_eq!(report, DetachReport::default());
        assert_eq!(bus.subscription_ids(), vec![existing]);
    }

    #[test]
    fn test_detaches_through_sender() {
        let (bus, mut guard) = setup();
        let widget = Arc::new(Widget {
            bus: Arc::clone(&bus),
            listeners: Mutex::new(Vec::new()),
        });

        guard.start_tracking();
        widget.on("click");
        bus.trigger(&Event::new("click", EventSender::detachable("widget", &widget)));
        let report = guard.stop_and_detach();

        assert_eq!(report.events_recorded, 1);
        assert_eq!(report.listeners_detached, 1);
        assert_eq!(report.swept, 0);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_sweep_catches_direct_subscriptions() {
        let (bus, mut guard) = setup();
        let kept = bus.subscribe("boot", "*", Arc::new(|_: &Event| {}));

        guard.start_tracking();
        bus.subscribe("stray", "*", Arc::new(|_: &Event| {}));
        let report = guard.stop_and_detach();

        assert_eq!(report.swept, 1);
        assert_eq!(bus.subscription_ids(), vec![kept]);
    }

    #[test]
    fn test_global_sweep_clears_everything() {
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        let mut guard = EventLeakGuard::new(Arc::clone(&bus), SweepScope::Global);
        bus.subscribe("boot", "*", Arc::new(|_: &Event| {}));

        guard.start_tracking();
        let report = guard.stop_and_detach();

        assert_eq!(report.swept, 1);
        assert_eq!(bus.subscription_count(), 0);
    }

    #[test]
    fn test_vanished_sender_is_tolerated() {
        let (bus, mut guard) = setup();
        guard.start_tracking();
        {
            let widget = Arc::new(Widget {
                bus: Arc::clone(&bus),
                listeners: Mutex::new(Vec::new()),
            });
            bus.trigger(&Event::new("gone", EventSender::detachable("widget", &widget)));
        }
        let report = guard.stop_and_detach();
        assert_eq!(report.senders_gone, 1);
        assert_eq!(report.listeners_detached, 0);
    }

    #[test]
    fn test_stop_without_start_is_noop() {
        let (_, mut guard) = setup();
        assert_eq!(guard.stop_and_detach(), DetachReport::default());
        assert!(!guard.is_tracking());
    }

    #[test]
    fn test_sweep_scope_serde() {
        assert_eq!(serde_json::to_string(&SweepScope::Global).unwrap(), "\"global\"");
    }
}
