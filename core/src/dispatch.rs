//! Routing/dispatch seam.
//!
//! The worker never routes requests itself. It hands a prepared
//! [`RequestContext`] to a [`Dispatcher`] supplied by the application and
//! treats whatever comes back (a response, an error, or a panic) uniformly.

use crate::context::RequestContext;
use crate::error::DispatchError;
use crate::response::Response;
use std::fmt;

/// Routing/action layer invoked once per request.
pub trait Dispatcher: Send + Sync {
    /// Handle the request described by `ctx`.
    ///
    /// # Errors
    ///
    /// Any [`DispatchError`] is recovered by the worker's error fallback
    /// pipeline; it never terminates the worker.
    fn dispatch(&self, ctx: &mut RequestContext<'_>) -> Result<Response, DispatchError>;
}

type DispatchFn = dyn Fn(&mut RequestContext<'_>) -> Result<Response, DispatchError> + Send + Sync;

/// Dispatcher backed by a closure.
///
/// # Example
///
/// ```
/// use persistent_worker_core::{dispatch::FnDispatcher, error::DispatchError, response::Response};
///
/// let dispatcher = FnDispatcher::new(|ctx| match ctx.request().path() {
///     "/" => Ok(Response::ok("home")),
///     other => Err(DispatchError::not_found(format!("no route for {other}"))),
/// });
/// # let _ = dispatcher;
/// ```
pub struct FnDispatcher {
    handler: Box<DispatchFn>,
}

impl FnDispatcher {
    /// Wrap a closure.
    #[must_use]
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&mut RequestContext<'_>) -> Result<Response, DispatchError> + Send + Sync + 'static,
    {
        Self {
            handler: Box::new(handler),
        }
    }
}

impl fmt::Debug for FnDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnDispatcher").finish_non_exhaustive()
    }
}

impl Dispatcher for FnDispatcher {
    fn dispatch(&self, ctx: &mut RequestContext<'_>) -> Result<Response, DispatchError> {
        (self.handler)(ctx)
    }
}
