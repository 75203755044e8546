//! Application subcomponents and their scope.
//!
//! Every subcomponent is produced by a [`ComponentFactory`] registered under
//! a [`ComponentId`] in the [`ComponentRegistry`]. The
//! [`RequestScopeConfig`] names the ids that are rebuilt for every request;
//! everything else is built once per worker and reused.

use crate::error::ConfigurationError;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Identifier of a component (`"request"`, `"session"`, `"url-manager"`…).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId(String);

impl ComponentId {
    /// Create an id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ComponentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ComponentId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An application subcomponent.
///
/// Components are shared through `Arc` and must use interior mutability for
/// any state they change while a request runs.
pub trait Component: Any + Send + Sync {
    /// Clear request-local fields.
    ///
    /// Called on every persistent component at the start of each request.
    /// Request-scoped components are rebuilt instead and never see this call.
    fn reset_request_state(&self) {}

    /// Upcast for typed lookups.
    fn as_any(&self) -> &dyn Any;
}

/// Builds one component.
///
/// `deps` holds the components already available, in registration order,
/// so a factory may look up what it depends on.
pub trait ComponentFactory: Send + Sync {
    /// Build a fresh instance.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the component cannot be built
    /// from the current configuration.
    fn build(&self, deps: &ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError>;
}

impl<F> ComponentFactory for F
where
    F: Fn(&ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError> + Send + Sync,
{
    fn build(&self, deps: &ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError> {
        self(deps)
    }
}

/// The live components of a worker.
#[derive(Clone, Default)]
pub struct ComponentSet {
    components: BTreeMap<ComponentId, Arc<dyn Component>>,
}

impl fmt::Debug for ComponentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.components.keys()).finish()
    }
}

impl ComponentSet {
    /// Empty set.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            components: BTreeMap::new(),
        }
    }

    /// Insert or replace a component.
    pub fn insert(&mut self, id: ComponentId, component: Arc<dyn Component>) {
        self.components.insert(id, component);
    }

    /// Remove a component.
    pub fn remove(&mut self, id: &ComponentId) -> Option<Arc<dyn Component>> {
        self.components.remove(id)
    }

    /// Look up a component.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<dyn Component>> {
        self.components.get(&ComponentId::new(id))
    }

    /// Look up a component and downcast it.
    #[must_use]
    pub fn get_as<T: Component>(&self, id: &str) -> Option<&T> {
        self.get(id)
            .and_then(|component| component.as_any().downcast_ref::<T>())
    }

    /// Whether `id` is present.
    #[must_use]
    pub fn contains(&self, id: &ComponentId) -> bool {
        self.components.contains_key(id)
    }

    /// Ids in sorted order.
    pub fn ids(&self) -> impl Iterator<Item = &ComponentId> {
        self.components.keys()
    }

    /// Components in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&ComponentId, &Arc<dyn Component>)> {
        self.components.iter()
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Copy of this set without the request-scoped components.
    #[must_use]
    pub fn without_scope(&self, scope: &RequestScopeConfig) -> Self {
        Self {
            components: self
                .components
                .iter()
                .filter(|(id, _)| !scope.contains(id))
                .map(|(id, component)| (id.clone(), Arc::clone(component)))
                .collect(),
        }
    }
}

/// Factories by component id, kept in registration order.
#[derive(Clone, Default)]
pub struct ComponentRegistry {
    entries: Vec<(ComponentId, Arc<dyn ComponentFactory>)>,
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(id, _)| id))
            .finish()
    }
}

impl ComponentRegistry {
    /// Empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Register a factory, replacing any previous one for the same id.
    ///
    /// Components are built in registration order, so register
    /// dependencies first.
    #[must_use]
    pub fn with(mut self, id: impl Into<ComponentId>, factory: impl ComponentFactory + 'static) -> Self {
        self.register(id, factory);
        self
    }

    /// Register a factory in place.
    pub fn register(&mut self, id: impl Into<ComponentId>, factory: impl ComponentFactory + 'static) {
        let id = id.into();
        let factory: Arc<dyn ComponentFactory> = Arc::new(factory);
        if let Some(entry) = self.entries.iter_mut().find(|(existing, _)| *existing == id) {
            entry.1 = factory;
        } else {
            self.entries.push((id, factory));
        }
    }

    /// Factory registered for `id`.
    #[must_use]
    pub fn resolve(&self, id: &ComponentId) -> Option<&Arc<dyn ComponentFactory>> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == id)
            .map(|(_, factory)| factory)
    }

    /// Whether `id` is registered.
    #[must_use]
    pub fn contains(&self, id: &ComponentId) -> bool {
        self.resolve(id).is_some()
    }

    /// Registered entries in registration order.
    #[must_use]
    pub fn entries(&self) -> &[(ComponentId, Arc<dyn ComponentFactory>)] {
        &self.entries
    }

    /// Number of registered factories.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ids of components rebuilt on every request.
///
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestScopeConfig {
    ids: Vec<ComponentId>,
}

impl Default for RequestScopeConfig {
    fn default() -> Self {
        Self::new([
            "request",
            "response",
            "error-handler",
            "session",
            "user",
            "url-manager",
        ])
    }
}

impl RequestScopeConfig {
    /// Build from a list of ids.
    #[must_use]
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ComponentId>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a comma-separated list; blank entries are ignored.
    #[must_use]
    pub fn parse(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty()),
        )
    }

    /// Whether `id` is request-scoped.
    #[must_use]
    pub fn contains(&self, id: &ComponentId) -> bool {
        self.ids.contains(id)
    }

    /// The ids, in configured order.
    #[must_use]
    pub fn ids(&self) -> &[ComponentId] {
        &self.ids
    }

    /// Check the list against a registry.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::EmptyScopeEntry`] for a blank id,
    /// [`ConfigurationError::DuplicateScopeEntry`] for a repeated id, and
    /// [`ConfigurationError::UnresolvableComponent`] for an id the registry
    /// has no factory for.
    pub fn validate(&self, registry: &ComponentRegistry) -> Result<(), ConfigurationError> {
        let mut seen = BTreeSet::new();
        for id in &self.ids {
            if id.as_str().trim().is_empty() {
                return Err(ConfigurationError::EmptyScopeEntry);
            }
            if !seen.insert(id) {
                return Err(ConfigurationError::DuplicateScopeEntry(id.to_string()));
            }
            if !registry.contains(id) {
                return Err(ConfigurationError::UnresolvableComponent(id.to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Marker(&'static str);

    impl Component for Marker {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn marker(label: &'static str) -> impl ComponentFactory {
        move |_: &ComponentSet| -> Result<Arc<dyn Component>, ConfigurationError> {
            Ok(Arc::new(Marker(label)))
        }
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let registry = ComponentRegistry::new()
            .with("db", marker("db"))
            .with("cache", marker("cache"))
            .with("db", marker("db2"));

        let ids: Vec<_> = registry.entries().iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["db", "cache"]);
    }

    #[test]
    fn test_typed_lookup() {
        let mut set = ComponentSet::new();
        set.insert("view".into(), Arc::new(Marker("view")));

        assert_eq!(set.get_as::<Marker>("view").map(|m| m.0), Some("view"));
        assert!(set.get_as::<Marker>("missing").is_none());
    }

    #[test]
    fn test_without_scope_drops_scoped_ids() {
        let mut set = ComponentSet::new();
        set.insert("request".into(), Arc::new(Marker("request")));
        set.insert("view".into(), Arc::new(Marker("view")));

        let persistent = set.without_scope(&RequestScopeConfig::new(["request"]));
        assert_eq!(persistent.len(), 1);
        assert!(persistent.contains(&"view".into()));
    }

    #[test]
    fn test_parse_scope_list() {
        let scope = RequestScopeConfig::parse(" request, session ,,user ");
        let ids: Vec<_> = scope.ids().iter().map(ComponentId::as_str).collect();
        assert_eq!(ids, vec!["request", "session", "user"]);
    }

    #[test]
    fn test_validate_rejects_unknown_id() {
        let registry = ComponentRegistry::new().with("request", marker("request"));
        let scope = RequestScopeConfig::new(["request", "user"]);
        assert_eq!(
            scope.validate(&registry),
            Err(ConfigurationError::UnresolvableComponent("user".to_string()))
        );
    }

    #[test]
    fn test_validate_rejects_duplicates_and_blanks() {
        let registry = ComponentRegistry::new().with("request", marker("request"));

        let duplicate = RequestScopeConfig::new(["request", "request"]);
        assert_eq!(
            duplicate.validate(&registry),
            Err(ConfigurationError::DuplicateScopeEntry("request".to_string()))
        );

        let blank = RequestScopeConfig::new([" "]);
        assert_eq!(blank.validate(&registry), Err(ConfigurationError::EmptyScopeEntry));
    }
}
