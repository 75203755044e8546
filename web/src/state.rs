//! Shared handle to the worker behind the router.
//!
//! The controller is single-threaded by contract: one request is in
//! flight at a time. The handle serializes access through a mutex and keeps
//! the recycle signal in an atomic so readiness probes never wait for an
//! in-flight request.

use persistent_worker_core::request::Request;
use persistent_worker_core::response::WireResponse;
use persistent_worker_runtime::{LifecycleController, WorkerStats};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Default maximum request body size (2 MiB).
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Result of running one request through the worker.
#[derive(Debug)]
pub struct Served {
    /// Response to emit
    pub response: WireResponse,
    /// Memory crossed the recycle threshold during this request
    pub recycle: bool,
}

/// Cloneable state shared by all handlers.
#[derive(Clone)]
pub struct WorkerHandle {
    controller: Arc<Mutex<LifecycleController>>,
    recycle: Arc<AtomicBool>,
    served: Arc<AtomicU64>,
    body_limit: usize,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("recycle", &self.recycle_requested())
            .field("served", &self.requests_served())
            .field("body_limit", &self.body_limit)
            .finish_non_exhaustive()
    }
}

impl WorkerHandle {
    /// Wrap `controller` for use by the router.
    #[must_use]
    pub fn new(controller: LifecycleController) -> Self {
        Self {
            controller: Arc::new(Mutex::new(controller)),
            recycle: Arc::new(AtomicBool::new(false)),
            served: Arc::new(AtomicU64::new(0)),
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Maximum accepted request body size in bytes.
    #[must_use]
    pub const fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Maximum accepted request body size in bytes.
    #[must_use]
    pub const fn body_limit(&self) -> usize {
        self.body_limit
    }

    /// Whether any request has crossed the memory threshold.
    ///
    /// Once set, the flag stays set for the lifetime of the worker.
    #[must_use]
    pub fn recycle_requested(&self) -> bool {
        self.recycle.load(Ordering::Acquire)
    }

    /// Requests run through the controller so far.
    #[must_use]
    pub fn requests_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Snapshot of the controller's counters.
    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.lock().stats().clone()
    }

    /// Run `request` through the worker, blocking the current thread.
    ///
    /// Call from a blocking context such as `spawn_blocking`.
    #[must_use]
    pub fn serve_blocking(&self, request: &Request) -> Served {
        let (response, recycle) = {
            let mut controller = self.lock();
            let response = controller.handle(request);
            (response, controller.should_recycle())
        };
        self.served.fetch_add(1, Ordering::Relaxed);

        if recycle && !self.recycle.swap(true, Ordering::AcqRel) {
            tracing::warn!(
                requests = self.requests_served(),
                "Memory threshold crossed, worker should be recycled"
            );
        }
        Served { response, recycle }
    }

    // `handle` catches every panic, so poisoning only follows a panic in
    // our own bookkeeping and the controller is still usable.
    fn lock(&self) -> MutexGuard<'_, LifecycleController> {
        self.controller.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use persistent_worker_core::component::RequestScopeConfig;
    use persistent_worker_core::dispatch::FnDispatcher;
    use persistent_worker_core::response::Response;
    use persistent_worker_runtime::WorkerConfig;

    fn handle() -> WorkerHandle {
        let config = WorkerConfig::default()
            .with_memory_limit("-1")
            .with_request_scope(RequestScopeConfig::new(Vec::<String>::new()));
        let controller = LifecycleController::builder(config)
            .dispatcher(FnDispatcher::new(|_| Ok(Response::ok("ok"))))
            .build()
            .unwrap();
        WorkerHandle::new(controller)
    }

    #[test]
    fn test_state_is_clone() {
        fn assert_clone<T: Clone + Send + Sync>() {}
        assert_clone::<WorkerHandle>();
    }

    #[test]
    fn test_serve_blocking_counts_requests() {
        let worker = handle();
        let served = worker.serve_blocking(&Request::new("GET", "/"));
        assert_eq!(served.response.status, 200);
        assert!(!served.recycle);
        assert_eq!(worker.requests_served(), 1);
        assert_eq!(worker.stats().requests_handled, 1);
        assert!(!worker.recycle_requested());
    }
}
