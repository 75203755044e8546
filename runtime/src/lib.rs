//! # Persistent Worker Runtime
//!
//! Runs a request-per-process style application inside a long-lived worker.
//!
//! A single [`LifecycleController`] owns the [`WorkerState`] of one worker
//! and, for each request, resets request-scoped state, dispatches, and
//! cleans up so that nothing from one request is observable by the next.
//!
//! ## Core Components
//!
//! - **`LifecycleController`**: the per-request state machine
//! - **`ComponentScopeManager`**: rebuilds request-scoped components
//! - **`EventLeakGuard`**: detaches event listeners a request left behind
//! - **`SessionBinder`**: isolates sessions between requests
//! - **`MemoryGovernor`**: signals when the worker should be recycled
//! - **`ErrorFallbackPipeline`**: turns every failure into a response
//!
//! ## Example
//!
//! ```
//! use persistent_worker_core::{FnDispatcher, Request, Response};
//! use persistent_worker_core::component::RequestScopeConfig;
//! use persistent_worker_runtime::{LifecycleController, WorkerConfig};
//!
//! let config = WorkerConfig::default().with_request_scope(RequestScopeConfig::new(Vec::<String>::new()));
//! let mut controller = LifecycleController::builder(config)
//!     .dispatcher(FnDispatcher::new(|ctx| {
//!         Ok(Response::ok(format!("hello {}", ctx.request().path())))
//!     }))
//!     .build()
//!     .expect("valid configuration");
//!
//! let response = controller.handle(&Request::new("GET", "/world"));
//! assert_eq!(response.body_text(), "hello /world");
//!
//! if controller.should_recycle() {
//!     // tell the supervisor to retire this worker
//! }
//! ```

/// Worker configuration
pub mod config;

/// The per-request lifecycle controller
pub mod controller;

/// Default in-process event bus
pub mod event_bus;

/// Two-tier error recovery
pub mod fallback;

/// Event listener leak guard
pub mod leak_guard;

/// Memory-pressure governor
pub mod memory;

/// Metric descriptions
pub mod metrics;

/// Request-scoped component rebuilds
pub mod scope;

/// Per-request session binding
pub mod session_binder;

/// Default in-memory session engine
pub mod session_store;

/// Process-wide worker state
pub mod worker;

pub use config::{WorkerConfig, DEFAULT_REDACTED_KEYS};
pub use controller::{
    LifecycleController, LifecycleControllerBuilder, WorkerStats, AFTER_REQUEST_EVENT, APPLICATION_SENDER,
    BEFORE_REQUEST_EVENT,
};
pub use event_bus::LocalEventBus;
pub use fallback::{
    DefaultErrorRenderer, ErrorFallbackPipeline, ErrorRenderer, FallbackTier, Recovered, GENERIC_ERROR_MESSAGE,
};
pub use leak_guard::{DetachReport, EventLeakGuard, RecordedEvent, SweepScope};
pub use memory::{parse_memory_limit, MemoryGovernor, MemoryProbe, MemoryReading, ProcMemoryProbe};
pub use scope::{ComponentScopeManager, ResetReport};
pub use session_binder::{is_valid_session_id, SessionBinder};
pub use session_store::MemorySessionStore;
pub use worker::{Container, WorkerState};
