//! Errors raised by the hosting adapter itself.
//!
//! Anything that goes wrong inside the worker is already a response by the
//! time it reaches this crate. These errors cover the edges: reading the
//! inbound request, handing it to the blocking worker thread, and turning
//! the worker's output back into an HTTP response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Adapter error, converted into a JSON error response.
#[derive(Debug, Error)]
pub enum WebError {
    /// The request body could not be read within the configured limit
    #[error("request body unreadable or larger than {limit} bytes")]
    BodyTooLarge {
        /// Configured limit in bytes
        limit: usize,
    },

    /// The query string is not valid `application/x-www-form-urlencoded`
    #[error("invalid query string: {0}")]
    Query(#[source] serde_urlencoded::de::Error),

    /// A form body is not valid `application/x-www-form-urlencoded`
    #[error("invalid form body: {0}")]
    Form(#[source] serde_urlencoded::de::Error),

    /// A JSON body does not parse
    #[error("invalid JSON body: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker produced a status code `http` rejects
    #[error("worker returned invalid status {0}")]
    InvalidStatus(u16),

    /// The worker produced a header `http` rejects
    #[error("worker returned invalid header {0}")]
    InvalidHeader(String),

    /// The blocking worker task did not complete
    #[error("worker task failed: {0}")]
    Worker(String),
}

impl WebError {
    /// HTTP status for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Query(_) | Self::Form(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::InvalidStatus(_) | Self::InvalidHeader(_) | Self::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable code for clients.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BodyTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::Query(_) | Self::Form(_) | Self::Json(_) => "BAD_REQUEST",
            Self::InvalidStatus(_) | Self::InvalidHeader(_) | Self::Worker(_) => "INTERNAL_SERVER_ERROR",
        }
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Worker-side details stay in the log.
        let message = if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Worker adapter failure");
            "An internal server error occurred.".to_string()
        } else {
            tracing::debug!(status = %status, error = %self, "Rejected request");
            self.to_string()
        };

        let body = ErrorResponse {
            code: self.code(),
            message,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_map_to_4xx() {
        assert_eq!(WebError::BodyTooLarge { limit: 10 }.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json_error = serde_json::from_str::<serde_json::Value>("{").err();
        assert!(json_error.is_some_and(|e| WebError::from(e).status() == StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_server_errors_hide_details() {
        let response = WebError::InvalidHeader("bad\nname".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_display() {
        assert_eq!(WebError::InvalidStatus(42).to_string(), "worker returned invalid status 42");
    }
}
