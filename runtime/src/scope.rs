//! Request-scoped versus persistent components.

use crate::worker::{Container, WorkerState};
use persistent_worker_core::component::{ComponentId, ComponentRegistry, ComponentSet, RequestScopeConfig};
use persistent_worker_core::error::ConfigurationError;
use serde::Serialize;

/// What one reset did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    /// Every component was built (first request of the worker)
    pub full_build: bool,
    /// Components built during this reset, in build order
    pub rebuilt: Vec<String>,
    /// Persistent components asked to clear request-local state
    pub persistent_reset: usize,
}

/// Rebuilds request-scoped components and keeps the rest.
///
/// The first successful reset builds the whole registry and wires the
/// [`Container`]. Later resets rebuild only the ids listed in the
/// [`RequestScopeConfig`]. A failed reset leaves the live component set
/// untouched, and a failed first build is retried in full next time.
#[derive(Debug)]
pub struct ComponentScopeManager {
    registry: ComponentRegistry,
    scope: RequestScopeConfig,
    is_first_request: bool,
}

impl ComponentScopeManager {
    /// Manager for `registry` with `scope` rebuilt per request.
    #[must_use]
    pub const fn new(registry: ComponentRegistry, scope: RequestScopeConfig) -> Self {
        Self {
            registry,
            scope,
            is_first_request: true,
        }
    }

    /// Whether the next reset is a full build.
    #[must_use]
    pub const fn is_first_request(&self) -> bool {
        self.is_first_request
    }

    /// The request scope.
    #[must_use]
    pub const fn scope(&self) -> &RequestScopeConfig {
        &self.scope
    }

    /// The component registry.
    #[must_use]
    pub const fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    /// Prepare the components of `state` for the next request.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the scope list does not match the
    /// registry or a factory fails. The worker stays usable.
    pub fn reset(&mut self, state: &mut WorkerState) -> Result<ResetReport, ConfigurationError> {
        self.scope.validate(&self.registry)?;

        if self.is_first_request {
            let report = self.full_build(state)?;
            self.is_first_request = false;
            return Ok(report);
        }

        let container = match state.container.take() {
            Some(container) => container,
            None => Container::wire(&self.registry, &self.scope),
        };
        let result = self.scoped_rebuild(&container, state);
        state.container = Some(container);
        result
    }

    fn full_build(&self, state: &mut WorkerState) -> Result<ResetReport, ConfigurationError> {
        let mut fresh = ComponentSet::new();
        let mut rebuilt = Vec::with_capacity(self.registry.len());
        for (id, factory) in self.registry.entries() {
            let component = factory.build(&fresh)?;
            fresh.insert(id.clone(), component);
            rebuilt.push(id.to_string());
        }

        state.container = Some(Container::wire(&self.registry, &self.scope));
        state.components = fresh;
        tracing::info!(components = rebuilt.len(), "Worker components built");

        Ok(ResetReport {
            full_build: true,
            rebuilt,
            persistent_reset: 0,
        })
    }

    fn scoped_rebuild(&self, container: &Container, state: &mut WorkerState) -> Result<ResetReport, ConfigurationError> {
        let mut next = state.components.without_scope(&self.scope);

        let mut persistent_reset = 0;
        for (_, component) in next.iter() {
            component.reset_request_state();
            persistent_reset += 1;
        }

        let mut rebuilt = Vec::with_capacity(container.scoped_order().len());
        for id in container.scoped_order() {
            let factory = self
                .registry
                .resolve(id)
                .ok_or_else(|| ConfigurationError::UnresolvableComponent(id.to_string()))?;
            let component = factory.build(&next)?;
            next.insert(id.clone(), component);
            rebuilt.push(id.to_string());
        }

        state.components = next;
        tracing::debug!(rebuilt = rebuilt.len(), persistent_reset, "Request-scoped components rebuilt");

        Ok(ResetReport {
            full_build: false,
            rebuilt,
            persistent_reset,
        })
    }

    /// Whether `id` is rebuilt per request.
    #[must_use]
    pub fn is_request_scoped(&self, id: &ComponentId) -> bool {
        self.scope.contains(id)
    }
}
