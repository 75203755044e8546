//! # Persistent Worker Testing
//!
//! Test doubles and fixtures for persistent worker applications.
//!
//! This crate provides:
//! - Mock collaborators (memory probe, error renderers)
//! - Components that hold request-local state or register event listeners
//! - A small demo application dispatcher exercising sessions, events,
//!   output buffering, uploads and failures
//! - Request builders
//!
//! ## Example
//!
//! ```
//! use persistent_worker_runtime::{LifecycleController, LocalEventBus, WorkerConfig};
//! use persistent_worker_core::EventBus;
//! use persistent_worker_testing::{demo_dispatcher, requests, standard_registry};
//! use std::sync::Arc;
//!
//! let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
//! let mut controller = LifecycleController::builder(WorkerConfig::default())
//!     .registry(standard_registry(&bus))
//!     .event_bus(Arc::clone(&bus))
//!     .dispatcher(demo_dispatcher())
//!     .build()
//!     .unwrap();
//!
//! controller.handle(&requests::with_session("GET", "/counter/set?value=1", "u1"));
//! let response = controller.handle(&requests::with_session("GET", "/counter/get", "u2"));
//! assert_eq!(response.body_text(), "not set");
//! ```

use persistent_worker_core::component::{Component, ComponentRegistry, ComponentSet};
use persistent_worker_core::error::ConfigurationError;
use persistent_worker_core::event_bus::{Detachable, Event, EventBus, EventHandler, EventSender, SubscriptionId};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Mock collaborators.
pub mod mocks {
    use persistent_worker_core::error::{DispatchError, RenderError};
    use persistent_worker_core::response::{Response, ResponseFormat};
    use persistent_worker_runtime::fallback::ErrorRenderer;
    use persistent_worker_runtime::memory::MemoryProbe;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Memory probe reporting whatever the test sets.
    ///
    /// Clones share the same reading, so a test can keep one handle and
    /// move the other into the controller.
    ///
    /// # Example
    ///
    /// ```
    /// use persistent_worker_testing::mocks::FixedMemoryProbe;
    /// use persistent_worker_runtime::MemoryProbe;
    ///
    /// let probe = FixedMemoryProbe::new(1024);
    /// let handle = probe.clone();
    /// handle.set_usage(4096);
    /// assert_eq!(probe.current_usage(), 4096);
    /// ```
    #[derive(Debug, Clone, Default)]
    pub struct FixedMemoryProbe {
        usage: Arc<AtomicU64>,
        collections: Arc<AtomicUsize>,
    }

    impl FixedMemoryProbe {
        /// Probe reporting `usage` bytes.
        #[must_use]
        pub fn new(usage: u64) -> Self {
            Self {
                usage: Arc::new(AtomicU64::new(usage)),
                collections: Arc::new(AtomicUsize::new(0)),
            }
        }

        /// Change the reported usage.
        pub fn set_usage(&self, usage: u64) {
            self.usage.store(usage, Ordering::SeqCst);
        }

        /// How many garbage collections were requested.
        #[must_use]
        pub fn collections(&self) -> usize {
            self.collections.load(Ordering::SeqCst)
        }
    }

    impl MemoryProbe for FixedMemoryProbe {
        fn collect_garbage(&mut self) {
            self.collections.fetch_add(1, Ordering::SeqCst);
        }

        fn current_usage(&self) -> u64 {
            self.usage.load(Ordering::SeqCst)
        }
    }

    /// Error renderer that always fails.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct FailingRenderer;

    impl ErrorRenderer for FailingRenderer {
        fn render(&self, _: &DispatchError, _: ResponseFormat, _: bool) -> Result<Response, RenderError> {
            Err(RenderError::Failed("error view is broken".to_string()))
        }
    }

    /// Error renderer that panics.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct PanickingRenderer;

    impl ErrorRenderer for PanickingRenderer {
        #[allow(clippy::panic)]
        fn render(&self, _: &DispatchError, _: ResponseFormat, _: bool) -> Result<Response, RenderError> {
            panic!("error view exploded");
        }
    }
}

/// Component holding one request-local value and one persistent value.
///
/// `reset_request_state` clears only the request-local value.
#[derive(Debug, Default)]
pub struct ValueComponent {
    request_local: Mutex<Option<String>>,
    persistent: Mutex<Option<String>>,
}

impl ValueComponent {
    /// Empty component.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request-local value.
    pub fn set_request_local(&self, value: impl Into<String>) {
        *self.request_local.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.into());
    }

    /// The request-local value.
    #[must_use]
    pub fn request_local(&self) -> Option<String> {
        self.request_local.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Set the persistent value.
    pub fn set_persistent(&self, value: impl Into<String>) {
        *self.persistent.lock().unwrap_or_else(PoisonError::into_inner) = Some(value.into());
    }

    /// The persistent value.
    #[must_use]
    pub fn persistent(&self) -> Option<String> {
        self.persistent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl Component for ValueComponent {
    fn reset_request_state(&self) {
        *self.request_local.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Component that registers listeners on the shared bus and can detach
/// them by event name.
pub struct TestEmitter {
    id: String,
    bus: Arc<dyn EventBus>,
    this: Weak<TestEmitter>,
    listeners: Mutex<Vec<(String, SubscriptionId)>>,
}

impl std::fmt::Debug for TestEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEmitter")
            .field("id", &self.id)
            .field("listeners", &self.listener_count())
            .finish_non_exhaustive()
    }
}

impl TestEmitter {
    /// Emitter identified as `id` on `bus`.
    #[must_use]
    pub fn new(id: impl Into<String>, bus: Arc<dyn EventBus>) -> Arc<Self> {
        let id = id.into();
        Arc::new_cyclic(|this| Self {
            id,
            bus,
            this: this.clone(),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe `handler` to `event_name` fired by this emitter.
    pub fn on(&self, event_name: &str, handler: EventHandler) -> SubscriptionId {
        let subscription = self.bus.subscribe(event_name, &self.id, handler);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((event_name.to_string(), subscription));
        subscription
    }

    /// Fire `event_name` on the bus with this emitter as sender.
    pub fn emit(&self, event_name: &str) -> usize {
        let sender = match self.this.upgrade() {
            Some(this) => EventSender::detachable(self.id.clone(), &this),
            None => EventSender::named(self.id.clone()),
        };
        self.bus.trigger(&Event::new(event_name, sender))
    }

    /// Listeners this emitter still holds.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Detachable for TestEmitter {
    fn detach_listeners(&self, event_name: &str) -> usize {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let mut detached = 0;
        listeners.retain(|(name, subscription)| {
            if name != event_name {
                return true;
            }
            if self.bus.unsubscribe_id(*subscription) {
                detached += 1;
            }
            false
        });
        detached
    }
}

impl Component for TestEmitter {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Factory building [`ValueComponent`]s.
#[must_use]
pub fn value_factory() -> impl Fn(&ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError> + Send + Sync + 'static {
    |_| Ok(Arc::new(ValueComponent::new()) as Arc<dyn Component>)
}

/// Factory building [`ValueComponent`]s and counting how often it runs.
#[must_use]
pub fn counting_factory(
    builds: &Arc<AtomicUsize>,
) -> impl Fn(&ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError> + Send + Sync + 'static {
    let builds = Arc::clone(builds);
    move |_| {
        builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ValueComponent::new()) as Arc<dyn Component>)
    }
}

/// Factory building a [`TestEmitter`] on `bus`.
#[must_use]
pub fn emitter_factory(
    id: &'static str,
    bus: &Arc<dyn EventBus>,
) -> impl Fn(&ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError> + Send + Sync + 'static {
    let bus = Arc::clone(bus);
    move |_| Ok(TestEmitter::new(id, Arc::clone(&bus)) as Arc<dyn Component>)
}

/// Factory that always fails.
#[must_use]
pub fn failing_factory(
    id: &'static str,
) -> impl Fn(&ComponentSet) -> Result<Arc<dyn Component>, ConfigurationError> + Send + Sync + 'static {
    move |_| {
        Err(ConfigurationError::ComponentBuildFailed {
            id: id.to_string(),
            reason: "factory configured to fail".to_string(),
        })
    }
}

/// Registry covering the default request scope plus two persistent
/// components: `view` (a [`ValueComponent`]) and `emitter` (a
/// [`TestEmitter`] on `bus`).
#[must_use]
pub fn standard_registry(bus: &Arc<dyn EventBus>) -> ComponentRegistry {
    ComponentRegistry::new()
        .with("view", value_factory())
        .with("emitter", emitter_factory("emitter", bus))
        .with("request", value_factory())
        .with("response", value_factory())
        .with("error-handler", value_factory())
        .with("session", value_factory())
        .with("user", value_factory())
        .with("url-manager", value_factory())
}

/// Demo application used by integration tests.
pub mod app {
    use super::{TestEmitter, ValueComponent};
    use persistent_worker_core::context::{LogLevel, RequestContext};
    use persistent_worker_core::dispatch::FnDispatcher;
    use persistent_worker_core::error::DispatchError;
    use persistent_worker_core::event_bus::Event;
    use persistent_worker_core::response::{Response, ResponseFormat};
    use serde_json::{json, Value};
    use std::sync::Arc;

    /// Dispatcher routing on the request path.
    ///
    /// | Path | Behaviour |
    /// |---|---|
    /// | `/counter/set?value=N` | stores `counter = N` in the session |
    /// | `/counter/get` | returns the counter or `not set` |
    /// | `/counter/increment` | adds one to the counter |
    /// | `/events` | subscribes through the emitter and directly on the bus |
    /// | `/echo` | writes unbuffered output before the body |
    /// | `/buffered` | leaves an output buffer open and fails |
    /// | `/uploads` | counts files uploaded under `file` |
    /// | `/route` | records route resolution state |
    /// | `/user` | writes request-local state into `view` and `user` |
    /// | `/log` | buffers one log entry per level |
    /// | `/json` | returns a JSON document |
    /// | `/fail` | returns an error without status |
    /// | `/forbidden` | returns a 403 error |
    /// | `/panic` | panics |
    /// | anything else | 404 |
    #[must_use]
    pub fn demo_dispatcher() -> FnDispatcher {
        FnDispatcher::new(route)
    }

    fn route(ctx: &mut RequestContext<'_>) -> Result<Response, DispatchError> {
        match ctx.request().path() {
            "/counter/set" => {
                let value: i64 = ctx
                    .request()
                    .query_param("value")
                    .unwrap_or("1")
                    .parse()
                    .map_err(|e| DispatchError::http(400, format!("invalid value: {e}")))?;
                ctx.session_mut().set("counter", json!(value))?;
                Ok(Response::ok("counter set"))
            }
            "/counter/get" => Ok(Response::ok(
                ctx.session()
                    .get("counter")
                    .map_or_else(|| "not set".to_string(), Value::to_string),
            )),
            "/counter/increment" => {
                let next = ctx.session().get("counter").and_then(Value::as_i64).unwrap_or(0) + 1;
                ctx.session_mut().set("counter", json!(next))?;
                Ok(Response::ok(next.to_string()))
            }
            "/events" => {
                if let Some(emitter) = ctx.component::<TestEmitter>("emitter") {
                    emitter.on("saved", Arc::new(|_: &Event| {}));
                    emitter.on("saved", Arc::new(|_: &Event| {}));
                    emitter.emit("saved");
                }
                ctx.bus().subscribe("stray", "*", Arc::new(|_: &Event| {}));
                Ok(Response::ok(format!("subscriptions={}", ctx.bus().subscription_count())))
            }
            "/echo" => {
                ctx.echo("early;");
                Ok(Response::ok("body"))
            }
            "/buffered" => {
                ctx.echo("sent;");
                ctx.output_mut().start();
                ctx.echo("half-rendered");
                Err(DispatchError::new("failed mid-render"))
            }
            "/uploads" => {
                let count = ctx.uploads("file").len();
                Ok(Response::ok(format!("files={count}")))
            }
            "/route" => {
                let path = ctx.request().path().to_string();
                let route = ctx.route_mut();
                route.requested_route = path;
                route.requested_action = Some("index".to_string());
                Ok(Response::ok("routed"))
            }
            "/user" => {
                let previous_view = ctx
                    .component::<ValueComponent>("view")
                    .and_then(ValueComponent::request_local);
                let previous_user = ctx
                    .component::<ValueComponent>("user")
                    .and_then(ValueComponent::request_local);
                if let Some(view) = ctx.component::<ValueComponent>("view") {
                    view.set_request_local("rendered");
                    view.set_persistent("compiled");
                }
                if let Some(user) = ctx.component::<ValueComponent>("user") {
                    user.set_request_local("alice");
                }
                Ok(Response::ok(format!(
                    "view={} user={}",
                    previous_view.unwrap_or_else(|| "-".to_string()),
                    previous_user.unwrap_or_else(|| "-".to_string())
                )))
            }
            "/log" => {
                ctx.log(LogLevel::Error, "app", "error entry");
                ctx.log(LogLevel::Warning, "app", "warning entry");
                ctx.log(LogLevel::Info, "app", "info entry");
                ctx.log(LogLevel::Trace, "app", "trace entry");
                Ok(Response::ok("logged"))
            }
            "/json" => Ok(Response::json(200, &json!({"ok": true})).with_format(ResponseFormat::Json)),
            "/fail" => Err(DispatchError::new("handler failed")),
            "/forbidden" => Err(DispatchError::http(403, "Access denied")),
            "/panic" => panic_route(),
            other => Err(DispatchError::not_found(format!("Page not found: {other}"))),
        }
    }

    #[allow(clippy::panic)]
    fn panic_route() -> Result<Response, DispatchError> {
        panic!("handler panicked on purpose");
    }
}

/// Request builders.
pub mod requests {
    use persistent_worker_core::request::Request;

    /// Cookie name used by the default configuration.
    pub const SESSION_COOKIE: &str = "SESSIONID";

    /// Build a request; a `?a=b&c=d` suffix becomes query parameters.
    #[must_use]
    pub fn request(method: &str, target: &str) -> Request {
        let (path, query) = target.split_once('?').unwrap_or((target, ""));
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .fold(Request::new(method, path), |request, pair| {
                let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
                request.with_query_param(name, value)
            })
    }

    /// `GET` request.
    #[must_use]
    pub fn get(target: &str) -> Request {
        request("GET", target)
    }

    /// Request carrying the session cookie `session_id`.
    #[must_use]
    pub fn with_session(method: &str, target: &str, session_id: &str) -> Request {
        request(method, target).with_cookie(SESSION_COOKIE, session_id)
    }
}

/// Install a test subscriber once; later calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub use app::demo_dispatcher;
pub use mocks::{FailingRenderer, FixedMemoryProbe, PanickingRenderer};

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use persistent_worker_runtime::LocalEventBus;

    #[test]
    fn test_emitter_detaches_its_own_listeners() {
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        let emitter = TestEmitter::new("emitter", Arc::clone(&bus));
        emitter.on("saved", Arc::new(|_: &Event| {}));
        emitter.on("deleted", Arc::new(|_: &Event| {}));

        assert_eq!(emitter.emit("saved"), 1);
        assert_eq!(emitter.detach_listeners("saved"), 1);
        assert_eq!(emitter.detach_listeners("saved"), 0);
        assert_eq!(emitter.listener_count(), 1);
        assert_eq!(bus.subscription_count(), 1);
    }

    #[test]
    fn test_value_component_reset_keeps_persistent_value() {
        let component = ValueComponent::new();
        component.set_request_local("alice");
        component.set_persistent("compiled");
        component.reset_request_state();
        assert_eq!(component.request_local(), None);
        assert_eq!(component.persistent(), Some("compiled".to_string()));
    }

    #[test]
    fn test_request_builder_parses_query() {
        let request = requests::get("/counter/set?value=7&x");
        assert_eq!(request.path(), "/counter/set");
        assert_eq!(request.query_param("value"), Some("7"));
        assert_eq!(request.query_param("x"), Some(""));
    }
}
