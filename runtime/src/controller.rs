//! The per-request lifecycle controller.
//!
//! [`LifecycleController::handle`] walks one request through
//! `Init → BeforeRequest → Handling → AfterRequest → End`:
//!
//! 1. **BeforeRequest**: start event tracking, rebuild request-scoped
//!    components, clear route state, bind the session, fire `beforeRequest`.
//! 2. **Handling**: dispatch. Errors and panics go to the
//!    [`ErrorFallbackPipeline`].
//! 3. **AfterRequest**: fire `afterRequest`, close the session and attach a
//!    session cookie if a fresh id was issued.
//! 4. **End**: detach event listeners, clear the upload cache and route
//!    state, flush the buffered log, convert to a [`WireResponse`].
//!
//! Failures in step 1 skip the dispatch but still run steps 3 and 4, so
//! the worker is always left clean.

use crate::config::WorkerConfig;
use crate::event_bus::LocalEventBus;
use crate::fallback::{DefaultErrorRenderer, ErrorFallbackPipeline, ErrorRenderer, FallbackTier};
use crate::leak_guard::{DetachReport, EventLeakGuard};
use crate::memory::{parse_memory_limit, MemoryProbe, MemoryReading, ProcMemoryProbe};
use crate::scope::{ComponentScopeManager, ResetReport};
use crate::session_binder::SessionBinder;
use crate::session_store::MemorySessionStore;
use crate::worker::WorkerState;
use chrono::{DateTime, Utc};
use persistent_worker_core::component::ComponentRegistry;
use persistent_worker_core::context::{LogLevel, RequestContext, RequestScope};
use persistent_worker_core::dispatch::Dispatcher;
use persistent_worker_core::error::{panic_message, ConfigurationError, DispatchError, LifecycleError};
use persistent_worker_core::event_bus::{Event, EventBus, EventSender};
use persistent_worker_core::lifecycle::{Lifecycle, LifecycleState};
use persistent_worker_core::request::Request;
use persistent_worker_core::response::{Response, ResponseFormat, WireResponse};
use persistent_worker_core::session::SessionStore;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Sender id of lifecycle hook events.
pub const APPLICATION_SENDER: &str = "application";

/// Name of the event fired once the reset sequence completes.
pub const BEFORE_REQUEST_EVENT: &str = "beforeRequest";

/// Name of the event fired once a response exists.
pub const AFTER_REQUEST_EVENT: &str = "afterRequest";

/// Counters describing what a worker has done so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Requests handled
    pub requests_handled: u64,
    /// Requests answered through the error fallback pipeline
    pub dispatch_errors: u64,
    /// Errors whose rendering failed as well
    pub double_faults: u64,
    /// Requests rejected by a configuration error
    pub configuration_errors: u64,
    /// Listener cleanup of the last request
    pub last_detach: Option<DetachReport>,
    /// When the worker started
    pub started_at: DateTime<Utc>,
}

impl WorkerStats {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            requests_handled: 0,
            dispatch_errors: 0,
            double_faults: 0,
            configuration_errors: 0,
            last_detach: None,
            started_at,
        }
    }
}

/// Builder for [`LifecycleController`].
///
/// Only the dispatcher is required. The event bus defaults to
/// [`LocalEventBus`], the session engine to [`MemorySessionStore`], the
/// memory probe to [`ProcMemoryProbe`] and the error renderer to
/// [`DefaultErrorRenderer`].
pub struct LifecycleControllerBuilder {
    config: WorkerConfig,
    registry: ComponentRegistry,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    bus: Option<Arc<dyn EventBus>>,
    session: Option<Box<dyn SessionStore>>,
    probe: Option<Box<dyn MemoryProbe>>,
    renderer: Option<Arc<dyn ErrorRenderer>>,
}

impl LifecycleControllerBuilder {
    /// Component registry.
    #[must_use]
    pub fn registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Routing/action layer.
    #[must_use]
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher + 'static) -> Self {
        self.dispatcher = Some(Arc::new(dispatcher));
        self
    }

    /// Event bus shared with the application.
    #[must_use]
    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Session engine.
    #[must_use]
    pub fn session_store(mut self, store: impl SessionStore + 'static) -> Self {
        self.session = Some(Box::new(store));
        self
    }

    /// Memory usage source.
    #[must_use]
    pub fn memory_probe(mut self, probe: impl MemoryProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    /// Primary error renderer.
    #[must_use]
    pub fn error_renderer(mut self, renderer: impl ErrorRenderer + 'static) -> Self {
        self.renderer = Some(Arc::new(renderer));
        self
    }

    /// Assemble the controller.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::MissingCollaborator`] without a
    /// dispatcher, the configuration's own validation errors, and
    /// [`ConfigurationError::UnresolvableComponent`] when the request scope
    /// names a component the registry cannot build.
    pub fn build(self) -> Result<LifecycleController, ConfigurationError> {
        self.config.validate()?;
        parse_memory_limit(&self.config.memory_limit)?;
        let dispatcher = self
            .dispatcher
            .ok_or(ConfigurationError::MissingCollaborator("dispatcher"))?;
        self.config.request_scope.validate(&self.registry)?;

        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(LocalEventBus::new()) as Arc<dyn EventBus>);
        let session = self
            .session
            .unwrap_or_else(|| Box::new(MemorySessionStore::new()) as Box<dyn SessionStore>);
        let probe = self
            .probe
            .unwrap_or_else(|| Box::new(ProcMemoryProbe) as Box<dyn MemoryProbe>);
        let renderer = self
            .renderer
            .unwrap_or_else(|| Arc::new(DefaultErrorRenderer) as Arc<dyn ErrorRenderer>);

        let pipeline = ErrorFallbackPipeline::new(renderer)
            .with_debug(self.config.debug)
            .with_discard_output_level(self.config.discard_output_level)
            .with_redacted_keys(self.config.redacted_keys.clone());
        let guard = EventLeakGuard::new(Arc::clone(&bus), self.config.sweep_scope);
        let binder = SessionBinder::new(self.config.session_cookie.clone());
        let scope = ComponentScopeManager::new(self.registry, self.config.request_scope.clone());
        let state = WorkerState::new(self.config, bus, session, probe);
        let stats = WorkerStats::new(state.started_at());

        Ok(LifecycleController {
            state,
            scope,
            guard,
            binder,
            pipeline,
            dispatcher,
            lifecycle: Lifecycle::new(),
            stats,
        })
    }
}

/// Runs requests through the lifecycle on one persistent worker.
///
/// `handle` never panics and never returns an error: every failure ends
/// as a response.
pub struct LifecycleController {
    state: WorkerState,
    scope: ComponentScopeManager,
    guard: EventLeakGuard,
    binder: SessionBinder,
    pipeline: ErrorFallbackPipeline,
    dispatcher: Arc<dyn Dispatcher>,
    lifecycle: Lifecycle,
    stats: WorkerStats,
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("state", &self.state)
            .field("lifecycle", &self.lifecycle.state())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl LifecycleController {
    /// Start building a controller for `config`.
    #[must_use]
    pub fn builder(config: WorkerConfig) -> LifecycleControllerBuilder {
        LifecycleControllerBuilder {
            config,
            registry: ComponentRegistry::new(),
            dispatcher: None,
            bus: None,
            session: None,
            probe: None,
            renderer: None,
        }
    }

    /// Handle one request.
    pub fn handle(&mut self, request: &Request) -> WireResponse {
        let started = Instant::now();
        let number = self.stats.requests_handled + 1;
        let span = tracing::info_span!(
            "worker_request",
            request = number,
            method = request.method(),
            path = request.path()
        );
        let _enter = span.enter();

        self.lifecycle = Lifecycle::new();
        let format = ResponseFormat::negotiate(request);

        self.transition(LifecycleState::BeforeRequest);
        let prepared = self.prepare(request);

        self.transition(LifecycleState::Handling);
        let outcome = match prepared {
            Ok(()) => self.dispatch(request, format),
            Err(err) => Err(err),
        };
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => self.recover(&err, format, request),
        };

        self.transition(LifecycleState::AfterRequest);
        if let Err(err) = self.fire_hook(AFTER_REQUEST_EVENT) {
            tracing::error!(error = %err, "afterRequest hook failed");
        }
        self.release_session(&mut response);

        self.transition(LifecycleState::End);
        let wire = self.finalize(response);

        self.stats.requests_handled = number;
        metrics::counter!("worker_requests_total").increment(1);
        metrics::histogram!("worker_request_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(status = wire.status, "Request finished");
        wire
    }

    /// Reset sequence of `BeforeRequest`: tracking, components, route, session.
    fn prepare(&mut self, request: &Request) -> Result<(), DispatchError> {
        let prepared = catch_unwind(AssertUnwindSafe(|| -> Result<(), LifecycleError> {
            self.guard.start_tracking();
            self.scope.reset(&mut self.state)?;
            self.state.route.reset();
            self.binder.bind(self.state.session.as_mut(), request)?;
            Ok(())
        }))
        .unwrap_or_else(|payload| {
            Err(LifecycleError::Dispatch(DispatchError::new(format!(
                "reset sequence panicked: {}",
                panic_message(payload.as_ref())
            ))))
        });

        match prepared {
            Ok(()) => self.fire_hook(BEFORE_REQUEST_EVENT).map(|_| ()),
            Err(LifecycleError::Configuration(err)) => {
                self.stats.configuration_errors += 1;
                metrics::counter!("worker_configuration_errors_total").increment(1);
                tracing::error!(error = %err, "Configuration error, request not dispatched");
                Err(err.into())
            }
            Err(err) => {
                tracing::error!(error = %err, "Reset sequence failed");
                Err(err.into_dispatch_error())
            }
        }
    }

    fn dispatch(&mut self, request: &Request, format: ResponseFormat) -> Result<Response, DispatchError> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let state = &mut self.state;
        let scope = RequestScope {
            uploads: &mut state.uploads,
            route: &mut state.route,
            output: &mut state.output,
            log: &mut state.log,
        };
        let mut ctx = RequestContext::new(
            request,
            &state.components,
            state.session.as_mut(),
            state.bus.as_ref(),
            scope,
            format,
        );

        catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(&mut ctx)))
            .unwrap_or_else(|payload| Err(DispatchError::from_panic(payload.as_ref())))
    }

    fn recover(&mut self, error: &DispatchError, format: ResponseFormat, request: &Request) -> Response {
        self.stats.dispatch_errors += 1;
        metrics::counter!("worker_dispatch_errors_total").increment(1);

        let recovered = self
            .pipeline
            .recover(error, format, &mut self.state.output, request);
        if recovered.tier == FallbackTier::Secondary {
            self.stats.double_faults += 1;
        }
        recovered.response
    }

    fn release_session(&mut self, response: &mut Response) {
        match self.binder.release(self.state.session.as_mut()) {
            Ok(Some(binding)) => {
                if let Some(cookie) = self.binder.cookie_for(&binding) {
                    response.add_cookie(cookie);
                }
            }
            Ok(None) => {}
            Err(err) => tracing::error!(error = %err, "Failed to close session"),
        }
    }

    /// Detach listeners, clear request caches, flush the log, convert.
    fn finalize(&mut self, response: Response) -> WireResponse {
        let report = self.guard.stop_and_detach();
        self.stats.last_detach = Some(report);

        self.state.uploads.reset();
        self.state.route.reset();
        self.flush_log();

        let leading = self.state.output.take_all();
        response.into_wire(&leading)
    }

    fn flush_log(&mut self) {
        for entry in self.state.log.drain() {
            let category = entry.category.as_str();
            match entry.level {
                LogLevel::Error => tracing::error!(category, "{}", entry.message),
                LogLevel::Warning => tracing::warn!(category, "{}", entry.message),
                LogLevel::Info => tracing::info!(category, "{}", entry.message),
                LogLevel::Trace => tracing::trace!(category, "{}", entry.message),
            }
        }
    }

    fn fire_hook(&self, name: &str) -> Result<usize, DispatchError> {
        let event = Event::new(name, EventSender::named(APPLICATION_SENDER));
        let bus = Arc::clone(&self.state.bus);
        catch_unwind(AssertUnwindSafe(|| bus.trigger(&event))).map_err(|payload| {
            DispatchError::new(format!("{name} handler panicked: {}", panic_message(payload.as_ref())))
        })
    }

    fn transition(&mut self, to: LifecycleState) {
        match self.lifecycle.advance(to) {
            Ok(()) => tracing::debug!(state = %to, "Lifecycle transition"),
            Err(err) => tracing::error!(error = %err, "Lifecycle out of order"),
        }
    }

    /// Run the state reset outside of a request.
    ///
    /// Rebuilds request-scoped components, clears request caches, closes
    /// any open session and detaches everything subscribed meanwhile.
    /// Calling it repeatedly keeps persistent components and leaves the
    /// bus as it was.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Configuration`] if components cannot be
    /// prepared, or [`LifecycleError::Session`] if the session cannot close.
    pub fn reset(&mut self) -> Result<ResetReport, LifecycleError> {
        self.guard.start_tracking();
        let result = self.scope.reset(&mut self.state);
        self.stats.last_detach = Some(self.guard.stop_and_detach());

        self.state.clear_request_caches();
        self.state.log.drain();
        self.binder.release(self.state.session.as_mut())?;
        result.map_err(LifecycleError::from)
    }

    /// Whether the supervisor should retire this worker.
    pub fn should_recycle(&mut self) -> bool {
        self.state.memory.should_recycle()
    }

    /// Pin the memory limit, or invalidate it with `bytes <= 0`.
    pub fn set_memory_limit(&mut self, bytes: i64) {
        self.state.memory.set_limit(bytes);
    }

    /// Current memory usage against the limit.
    pub fn memory_reading(&mut self) -> MemoryReading {
        self.state.memory.reading()
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    /// Worker-lifetime state.
    #[must_use]
    pub const fn state(&self) -> &WorkerState {
        &self.state
    }

    /// Lifecycle state of the last request.
    #[must_use]
    pub const fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// The configuration the worker runs with.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        self.state.blueprint()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use persistent_worker_core::component::RequestScopeConfig;
    use persistent_worker_core::dispatch::FnDispatcher;

    fn controller(dispatcher: FnDispatcher) -> LifecycleController {
        LifecycleController::builder(WorkerConfig::default().with_request_scope(RequestScopeConfig::new(Vec::<String>::new())))
            .dispatcher(dispatcher)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_dispatcher() {
        let result = LifecycleController::builder(WorkerConfig::default()).build();
        assert!(matches!(
            result,
            Err(ConfigurationError::MissingCollaborator("dispatcher"))
        ));
    }

    #[test]
    fn test_build_rejects_scope_the_registry_cannot_resolve() {
        let result = LifecycleController::builder(WorkerConfig::default())
            .dispatcher(FnDispatcher::new(|_| Ok(Response::ok("ok"))))
            .build();
        assert!(matches!(
            result,
            Err(ConfigurationError::UnresolvableComponent(id)) if id == "request"
        ));
    }

    #[test]
    fn test_build_rejects_bad_memory_limit() {
        let result = LifecycleController::builder(WorkerConfig::default().with_memory_limit("lots"))
            .dispatcher(FnDispatcher::new(|_| Ok(Response::ok("ok"))))
            .build();
        assert!(matches!(result, Err(ConfigurationError::InvalidMemoryLimit { .. })));
    }

    #[test]
    fn test_handle_reaches_end() {
        let mut controller = controller(FnDispatcher::new(|ctx| {
            ctx.echo("early ");
            Ok(Response::ok("body"))
        }));
        let wire = controller.handle(&Request::new("GET", "/"));

        assert_eq!(wire.status, 200);
        assert_eq!(wire.body_text(), "early body");
        assert_eq!(controller.lifecycle_state(), LifecycleState::End);
        assert_eq!(controller.stats().requests_handled, 1);
    }
}
