//! Axum hosting adapter for a persistent worker.
//!
//! The worker itself is synchronous and handles one request at a time.
//! This crate puts it behind an axum [`Router`]:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         axum (async, many tasks)        │  ← HTTP parsing, health probes
//! ├─────────────────────────────────────────┤
//! │   WorkerHandle (mutex, blocking pool)   │  ← one request in flight
//! ├─────────────────────────────────────────┤
//! │        LifecycleController              │  ← reset, dispatch, cleanup
//! └─────────────────────────────────────────┘
//! ```
//!
//! Every path except `/health` and `/health/ready` goes to the worker.
//! When memory crosses the recycle threshold the response carries
//! `X-Worker-Recycle: 1` and readiness turns to 503.
//!
//! # Example
//!
//! ```ignore
//! use persistent_worker_web::worker_router;
//!
//! let controller = LifecycleController::builder(WorkerConfig::from_env()?)
//!     .dispatcher(app_dispatcher())
//!     .build()?;
//!
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//! axum::serve(listener, worker_router(controller)).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod convert;
pub mod error;
pub mod handlers;
pub mod state;

use axum::{routing::get, Router};
use persistent_worker_runtime::LifecycleController;

pub use convert::{into_http_response, into_worker_request, parse_cookie_header};
pub use error::WebError;
pub use handlers::{health_check, readiness, serve_request, Readiness, RECYCLE_HEADER};
pub use state::{Served, WorkerHandle, DEFAULT_BODY_LIMIT};

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, WebError>;

/// Router serving `controller`.
#[must_use]
pub fn worker_router(controller: LifecycleController) -> Router {
    router(WorkerHandle::new(controller))
}

/// Router serving an existing handle.
#[must_use]
pub fn router(worker: WorkerHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness))
        .fallback(serve_request)
        .with_state(worker)
}
