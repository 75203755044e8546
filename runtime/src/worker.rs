//! Process-wide worker state.

use crate::config::WorkerConfig;
use crate::memory::{MemoryGovernor, MemoryProbe};
use chrono::{DateTime, Utc};
use persistent_worker_core::component::{ComponentId, ComponentRegistry, ComponentSet, RequestScopeConfig};
use persistent_worker_core::context::{OutputBuffer, RequestLog, RouteState, UploadCache};
use persistent_worker_core::event_bus::EventBus;
use persistent_worker_core::session::SessionStore;
use std::sync::Arc;

/// Dependency wiring resolved once per worker.
///
/// Caches the order in which request-scoped components are rebuilt so later
/// requests do not walk the whole registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    build_order: Vec<ComponentId>,
    scoped_order: Vec<ComponentId>,
    wired_at: DateTime<Utc>,
}

impl Container {
    /// Resolve the build order of `registry` under `scope`.
    #[must_use]
    pub fn wire(registry: &ComponentRegistry, scope: &RequestScopeConfig) -> Self {
        let build_order: Vec<ComponentId> = registry.entries().iter().map(|(id, _)| id.clone()).collect();
        let scoped_order = build_order
            .iter()
            .filter(|id| scope.contains(id))
            .cloned()
            .collect();
        tracing::debug!(components = build_order.len(), "Container wired");
        Self {
            build_order,
            scoped_order,
            wired_at: Utc::now(),
        }
    }

    /// Every component id in build order.
    #[must_use]
    pub fn build_order(&self) -> &[ComponentId] {
        &self.build_order
    }

    /// Request-scoped ids in build order.
    #[must_use]
    pub fn scoped_order(&self) -> &[ComponentId] {
        &self.scoped_order
    }

    /// When the wiring happened.
    #[must_use]
    pub const fn wired_at(&self) -> DateTime<Utc> {
        self.wired_at
    }
}

/// State that lives for the whole life of the worker process.
///
/// Request-local caches (uploads, route state, output, buffered log) are
/// fields here rather than statics, and the lifecycle clears them
/// explicitly.
pub struct WorkerState {
    pub(crate) components: ComponentSet,
    pub(crate) blueprint: WorkerConfig,
    pub(crate) container: Option<Container>,
    pub(crate) memory: MemoryGovernor,
    pub(crate) bus: Arc<dyn EventBus>,
    pub(crate) session: Box<dyn SessionStore>,
    pub(crate) uploads: UploadCache,
    pub(crate) route: RouteState,
    pub(crate) output: OutputBuffer,
    pub(crate) log: RequestLog,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerState")
            .field("components", &self.components)
            .field("container", &self.container)
            .field("memory", &self.memory)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl WorkerState {
    /// Fresh worker state; components are built on the first request.
    #[must_use]
    pub fn new(
        blueprint: WorkerConfig,
        bus: Arc<dyn EventBus>,
        session: Box<dyn SessionStore>,
        probe: Box<dyn MemoryProbe>,
    ) -> Self {
        let memory = MemoryGovernor::new(
            probe,
            blueprint.memory_limit.clone(),
            blueprint.recycle_threshold_percent,
        );
        Self {
            components: ComponentSet::new(),
            blueprint,
            container: None,
            memory,
            bus,
            session,
            uploads: UploadCache::new(),
            route: RouteState::default(),
            output: OutputBuffer::new(),
            log: RequestLog::new(),
            started_at: Utc::now(),
        }
    }

    /// Live components.
    #[must_use]
    pub const fn components(&self) -> &ComponentSet {
        &self.components
    }

    /// Configuration the worker was started with.
    #[must_use]
    pub const fn blueprint(&self) -> &WorkerConfig {
        &self.blueprint
    }

    /// Wiring, once the first request has built it.
    #[must_use]
    pub const fn container(&self) -> Option<&Container> {
        self.container.as_ref()
    }

    /// The worker's event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    /// The persistent session engine.
    #[must_use]
    pub fn session(&self) -> &dyn SessionStore {
        self.session.as_ref()
    }

    /// Uploaded-file cache of the current request.
    #[must_use]
    pub const fn uploads(&self) -> &UploadCache {
        &self.uploads
    }

    /// Route resolution state of the current request.
    #[must_use]
    pub const fn route(&self) -> &RouteState {
        &self.route
    }

    /// When the worker started.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Clear every request-local cache.
    pub(crate) fn clear_request_caches(&mut self) {
        self.uploads.reset();
        self.route.reset();
        self.output = OutputBuffer::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persistent_worker_core::component::Component;
    use persistent_worker_core::error::ConfigurationError;

    struct Unit;

    impl Component for Unit {
        fn as_any(&self) -> &dyn std::any::Any {
            self
        }
    }

    fn unit(_: &ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError> {
        Ok(Arc::new(Unit))
    }

    #[test]
    fn test_container_keeps_registration_order_for_scope() {
        let registry = ComponentRegistry::new()
            .with("user", unit)
            .with("view", unit)
            .with("request", unit);
        let container = Container::wire(&registry, &RequestScopeConfig::new(["request", "user"]));

        let scoped: Vec<_> = container.scoped_order().iter().map(ComponentId::as_str).collect();
        assert_eq!(scoped, vec!["user", "request"]);
        assert_eq!(container.build_order().len(), 3);
    }
}
