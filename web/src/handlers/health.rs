//! Health check endpoints.
//!
//! These endpoints are used by the supervisor to decide when to retire
//! the worker. Neither of them touches the controller, so they answer
//! while a request is in flight.

use crate::state::WorkerHandle;
use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

/// Simple health check endpoint (for basic liveness).
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Readiness report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// `ready` or `recycle`
    pub status: &'static str,
    /// Requests served so far
    pub requests_served: u64,
}

/// Readiness endpoint.
///
/// # Status Codes
///
/// - 200 OK: the worker can take more requests
/// - 503 Service Unavailable: memory crossed the recycle threshold
///
/// # Endpoint
///
/// ```text
/// GET /health/ready
/// ```
#[allow(clippy::unused_async)]
pub async fn readiness(State(worker): State<WorkerHandle>) -> (StatusCode, Json<Readiness>) {
    let recycle = worker.recycle_requested();
    let status = if recycle {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(Readiness {
            status: if recycle { "recycle" } else { "ready" },
            requests_served: worker.requests_served(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }
}
