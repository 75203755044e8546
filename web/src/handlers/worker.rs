//! The catch-all handler that feeds requests to the worker.

use crate::convert::{into_http_response, into_worker_request};
use crate::error::WebError;
use crate::state::WorkerHandle;
use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    response::Response,
};

/// Header set to `1` on a response after which the worker should retire.
pub const RECYCLE_HEADER: &str = "x-worker-recycle";

/// Run the request through the worker on a blocking thread.
///
/// # Errors
///
/// Returns a [`WebError`] if the request cannot be converted, the worker
/// task fails, or the worker's response is not valid HTTP.
pub async fn serve_request(State(worker): State<WorkerHandle>, request: Request) -> Result<Response, WebError> {
    let (parts, body) = request.into_parts();
    let limit = worker.body_limit();
    let bytes = axum::body::to_bytes(body, limit)
        .await
        .map_err(|_| WebError::BodyTooLarge { limit })?;
    let request = into_worker_request(&parts.method, &parts.uri, &parts.headers, &bytes)?;

    let served = tokio::task::spawn_blocking(move || worker.serve_blocking(&request))
        .await
        .map_err(|e| WebError::Worker(e.to_string()))?;

    let mut response = into_http_response(served.response)?;
    if served.recycle {
        response
            .headers_mut()
            .insert(HeaderName::from_static(RECYCLE_HEADER), HeaderValue::from_static("1"));
    }
    Ok(response)
}
