//! Two-tier error recovery.
//!
//! The primary tier renders a [`DispatchError`] through an
//! [`ErrorRenderer`] in the negotiated format. If that renderer fails or
//! panics, the secondary tier produces a hardcoded plain-text response that
//! makes no external calls and cannot fail.

use persistent_worker_core::context::OutputBuffer;
use persistent_worker_core::error::{panic_message, DispatchError, RenderError};
use persistent_worker_core::request::Request;
use persistent_worker_core::response::{Response, ResponseFormat};
use serde_json::json;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Message shown whenever details must not leak.
pub const GENERIC_ERROR_MESSAGE: &str = "An internal server error occurred.";

/// Renders a dispatch error into a response.
pub trait ErrorRenderer: Send + Sync {
    /// Render `error` in `format`.
    ///
    /// # Errors
    ///
    /// Returns a [`RenderError`] if no response can be produced.
    fn render(&self, error: &DispatchError, format: ResponseFormat, debug: bool) -> Result<Response, RenderError>;
}

/// Renders HTML, JSON or plain text error pages.
///
/// Errors without an explicit status are shown with the generic message
/// unless debug is enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorRenderer;

impl DefaultErrorRenderer {
    fn visible_message(error: &DispatchError, debug: bool) -> String {
        if debug {
            error.describe()
        } else if error.explicit_status().is_some() {
            error.message().to_string()
        } else {
            GENERIC_ERROR_MESSAGE.to_string()
        }
    }
}

impl ErrorRenderer for DefaultErrorRenderer {
    fn render(&self, error: &DispatchError, format: ResponseFormat, debug: bool) -> Result<Response, RenderError> {
        let status = error.status_code();
        let status_code = http::StatusCode::from_u16(status)
            .map_err(|e| RenderError::Failed(format!("invalid status {status}: {e}")))?;
        let reason = status_code.canonical_reason().unwrap_or("Error");
        let message = Self::visible_message(error, debug);

        let response = match format {
            ResponseFormat::Json => Response::json(
                status,
                &json!({
                    "name": reason,
                    "message": message,
                    "status": status,
                }),
            ),
            ResponseFormat::Plain => Response::new(status)
                .with_body(format!("{status} {reason}: {message}"))
                .with_format(ResponseFormat::Plain),
            ResponseFormat::Html => Response::new(status)
                .with_body(format!(
                    "<!DOCTYPE html>\n<html>\n<head><title>{status} {reason}</title></head>\n<body>\n<h1>{reason}</h1>\n<p>{}</p>\n</body>\n</html>\n",
                    escape_html(&message)
                ))
                .with_format(ResponseFormat::Html),
        };
        Ok(response)
    }
}

/// Escape text for inclusion in HTML.
#[must_use]
pub fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#039;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Which tier produced the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackTier {
    /// The error renderer succeeded
    Primary,
    /// The renderer failed and the hardcoded response was used
    Secondary,
}

/// A response recovered from an error.
#[derive(Debug)]
pub struct Recovered {
    /// Response to send
    pub response: Response,
    /// Tier that produced it
    pub tier: FallbackTier,
}

/// Turns dispatch errors into responses, whatever happens.
#[derive(Clone)]
pub struct ErrorFallbackPipeline {
    renderer: Arc<dyn ErrorRenderer>,
    debug: bool,
    discard_output_level: usize,
    redacted_keys: Vec<String>,
}

impl std::fmt::Debug for ErrorFallbackPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorFallbackPipeline")
            .field("debug", &self.debug)
            .field("discard_output_level", &self.discard_output_level)
            .field("redacted_keys", &self.redacted_keys)
            .finish_non_exhaustive()
    }
}

impl ErrorFallbackPipeline {
    /// Pipeline using `renderer` for the primary tier.
    #[must_use]
    pub fn new(renderer: Arc<dyn ErrorRenderer>) -> Self {
        Self {
            renderer,
            debug: false,
            discard_output_level: 0,
            redacted_keys: Vec::new(),
        }
    }

    /// Include error details in responses.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Output level preserved when discarding buffered output.
    #[must_use]
    pub const fn with_discard_output_level(mut self, level: usize) -> Self {
        self.discard_output_level = level;
        self
    }

    /// Server parameters removed from debug output.
    #[must_use]
    pub fn with_redacted_keys(mut self, keys: Vec<String>) -> Self {
        self.redacted_keys = keys;
        self
    }

    /// Whether debug output is enabled.
    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.debug
    }

    /// Log `error`, discard buffered output and render a response.
    pub fn recover(
        &self,
        error: &DispatchError,
        format: ResponseFormat,
        output: &mut OutputBuffer,
        request: &Request,
    ) -> Recovered {
        tracing::error!(
            status = error.status_code(),
            error = %error.describe(),
            "Request failed"
        );

        let discarded = output.discard_to(self.discard_output_level);
        if discarded > 0 {
            tracing::debug!(bytes = discarded, "Discarded buffered output");
        }

        let rendered = catch_unwind(AssertUnwindSafe(|| self.renderer.render(error, format, self.debug)))
            .unwrap_or_else(|payload| Err(RenderError::Panicked(panic_message(payload.as_ref()))));

        match rendered {
            Ok(response) => Recovered {
                response,
                tier: FallbackTier::Primary,
            },
            Err(secondary) => Recovered {
                response: self.double_fault(error, &secondary, request),
                tier: FallbackTier::Secondary,
            },
        }
    }

    /// Hardcoded response for a failure while rendering an error.
    #[must_use]
    pub fn double_fault(&self, primary: &DispatchError, secondary: &RenderError, request: &Request) -> Response {
        metrics::counter!("worker_double_faults_total").increment(1);
        tracing::error!(
            primary = %primary.describe(),
            secondary = %secondary,
            "Double fault while rendering error"
        );

        let mut body = String::from(GENERIC_ERROR_MESSAGE);
        if self.debug {
            let server = serde_json::to_string_pretty(&self.redacted_server_params(request)).unwrap_or_default();
            body.push_str(&format!(
                "\n\nError: {}\n\nPrevious error: {}\n\nServer: {server}\n",
                secondary,
                primary.describe()
            ));
        }
        Response::new(500)
            .with_body(body)
            .with_format(ResponseFormat::Plain)
    }

    /// Server parameters with redacted names removed.
    #[must_use]
    pub fn redacted_server_params(&self, request: &Request) -> BTreeMap<String, String> {
        request
            .server_params()
            .iter()
            .filter(|(name, _)| !self.redacted_keys.iter().any(|key| key == *name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::panic)]

    use super::*;

    struct Broken;

    impl ErrorRenderer for Broken {
        fn render(&self, _: &DispatchError, _: ResponseFormat, _: bool) -> Result<Response, RenderError> {
            Err(RenderError::Failed("template missing".to_string()))
        }
    }

    struct Exploding;

    impl ErrorRenderer for Exploding {
        fn render(&self, _: &DispatchError, _: ResponseFormat, _: bool) -> Result<Response, RenderError> {
            panic!("renderer exploded");
        }
    }

    fn request() -> Request {
        Request::new("GET", "/")
            .with_server_param("SERVER_NAME", "worker.local")
            .with_server_param("DB_PASSWORD", "hunter2")
    }

    fn pipeline(renderer: Arc<dyn ErrorRenderer>) -> ErrorFallbackPipeline {
        ErrorFallbackPipeline::new(renderer).with_redacted_keys(vec!["DB_PASSWORD".to_string()])
    }

    #[test]
    fn test_primary_uses_explicit_status() {
        let recovered = pipeline(Arc::new(DefaultErrorRenderer)).recover(
            &DispatchError::not_found("No such page"),
            ResponseFormat::Plain,
            &mut OutputBuffer::new(),
            &request(),
        );
        assert_eq!(recovered.tier, FallbackTier::Primary);
        assert_eq!(recovered.response.status(), 404);
        assert_eq!(recovered.response.body(), "404 Not Found: No such page");
    }

    #[test]
    fn test_primary_hides_details_in_production() {
        let recovered = pipeline(Arc::new(DefaultErrorRenderer)).recover(
            &DispatchError::new("db password is hunter2"),
            ResponseFormat::Json,
            &mut OutputBuffer::new(),
            &request(),
        );
        let body: serde_json::Value = serde_json::from_str(recovered.response.body()).unwrap();
        assert_eq!(body["status"], 500);
        assert_eq!(body["message"], GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn test_html_is_escaped() {
        let response = DefaultErrorRenderer
            .render(&DispatchError::http(400, "<script>"), ResponseFormat::Html, false)
            .unwrap();
        assert!(response.body().contains("&lt;script&gt;"));
        assert!(response.body().contains("<title>400 Bad Request</title>"));
    }

    #[test]
    fn test_primary_discards_buffered_output() {
        let mut output = OutputBuffer::new();
        output.start();
        output.write("harness");
        output.start();
        output.write("half-rendered page");

        pipeline(Arc::new(DefaultErrorRenderer))
            .with_discard_output_level(1)
            .recover(&DispatchError::new("boom"), ResponseFormat::Html, &mut output, &request());
        assert_eq!(output.take_all(), "harness");
    }

    #[test]
    fn test_double_fault_without_debug_is_generic() {
        let recovered = pipeline(Arc::new(Broken)).recover(
            &DispatchError::new("primary failure"),
            ResponseFormat::Html,
            &mut OutputBuffer::new(),
            &request(),
        );
        assert_eq!(recovered.tier, FallbackTier::Secondary);
        assert_eq!(recovered.response.status(), 500);
        assert_eq!(recovered.response.body(), GENERIC_ERROR_MESSAGE);
    }

    #[test]
    fn test_double_fault_with_debug_shows_both_errors_redacted() {
        let recovered = pipeline(Arc::new(Exploding)).with_debug(true).recover(
            &DispatchError::new("primary failure"),
            ResponseFormat::Html,
            &mut OutputBuffer::new(),
            &request(),
        );
        let body = recovered.response.body();
        assert_eq!(recovered.tier, FallbackTier::Secondary);
        assert!(body.starts_with(GENERIC_ERROR_MESSAGE));
        assert!(body.contains("primary failure"));
        assert!(body.contains("renderer exploded"));
        assert!(body.contains("worker.local"));
        assert!(!body.contains("hunter2"));
    }
}
