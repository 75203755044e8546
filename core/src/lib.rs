//! # Persistent Worker Core
//!
//! Core traits and types for running a stateful, request-per-process web
//! application inside a persistent worker that serves many requests in
//! sequence without restarting.
//!
//! This crate provides the vocabulary shared by the runtime and by host
//! applications:
//!
//! - **Request / Response**: the generic inbound request and the outbound
//!   response the lifecycle populates, plus the wire-level form handed to
//!   the emission layer
//! - **EventBus**: a wildcard-capable publish/subscribe bus that outlives
//!   individual requests, and the [`event_bus::Detachable`] capability for
//!   senders that can drop their own listeners
//! - **SessionStore**: the persistent session engine contract
//! - **Components**: request-scoped and persistent subcomponents built
//!   through a [`component::ComponentRegistry`]
//! - **Lifecycle**: the strictly forward per-request state machine
//! - **RequestContext**: everything a [`dispatch::Dispatcher`] may touch
//!   while handling one request
//!
//! ## Example
//!
//! ```
//! use persistent_worker_core::{
//!     dispatch::FnDispatcher,
//!     request::Request,
//!     response::Response,
//! };
//!
//! let dispatcher = FnDispatcher::new(|ctx| {
//!     let greeting = format!("hello from {}", ctx.request().path());
//!     Ok(Response::ok(greeting))
//! });
//! # let _ = dispatcher;
//! # let _ = Request::new("GET", "/");
//! ```

pub mod component;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod request;
pub mod response;
pub mod session;

pub use component::{Component, ComponentFactory, ComponentId, ComponentRegistry, ComponentSet, RequestScopeConfig};
pub use context::{LogEntry, LogLevel, OutputBuffer, RequestContext, RequestLog, RequestScope, RouteState, UploadCache};
pub use dispatch::{Dispatcher, FnDispatcher};
pub use error::{ConfigurationError, DispatchError, LifecycleError, RenderError};
pub use event_bus::{Detachable, Event, EventBus, EventHandler, EventSender, SubscriptionId};
pub use lifecycle::{Lifecycle, LifecycleState};
pub use request::{Request, UploadedFile};
pub use response::{Cookie, Response, ResponseFormat, WireResponse};
pub use session::{SessionBinding, SessionError, SessionStore};
