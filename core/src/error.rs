//! Error taxonomy for the request lifecycle.
//!
//! - [`ConfigurationError`]: malformed scope list, unresolvable or failing
//!   component factory, invalid settings. Fatal for the current request only.
//! - [`DispatchError`]: anything the routing/action layer raised. Recovered
//!   into a response by the error fallback pipeline.
//! - [`RenderError`]: the primary error renderer itself failed. Recovered by
//!   the hardcoded secondary fallback (a double fault).
//! - [`LifecycleError`]: umbrella type for the reset sequence.
//!
//! Memory pressure is deliberately not an error: it is an advisory boolean.

use crate::lifecycle::LifecycleState;
use crate::session::SessionError;
use std::any::Any;
use std::fmt;
use thiserror::Error;

/// Configuration problems detected before any request work begins.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// A request-scoped id has no factory in the registry.
    #[error("Component '{0}' is listed as request-scoped but has no registered factory")]
    UnresolvableComponent(String),

    /// The request scope lists the same id twice.
    #[error("Request scope lists component '{0}' more than once")]
    DuplicateScopeEntry(String),

    /// The request scope contains an empty id.
    #[error("Request scope contains an empty component identifier")]
    EmptyScopeEntry,

    /// A factory refused to build its component.
    #[error("Failed to build component '{id}': {reason}")]
    ComponentBuildFailed {
        /// Component that failed
        id: String,
        /// Reason reported by the factory
        reason: String,
    },

    /// A configuration value could not be used.
    #[error("Invalid setting '{key}': {reason}")]
    InvalidSetting {
        /// Setting name
        key: String,
        /// Why it was rejected
        reason: String,
    },

    /// A memory limit string could not be parsed.
    #[error("Invalid memory limit '{value}': {reason}")]
    InvalidMemoryLimit {
        /// The offending value
        value: String,
        /// Why it was rejected
        reason: String,
    },

    /// A required collaborator was not supplied.
    #[error("Missing required collaborator: {0}")]
    MissingCollaborator(&'static str),
}

/// Failure raised while dispatching a request.
///
/// Carries an optional HTTP status (500 is used when absent) and an optional
/// source error kept for logging and debug output.
#[derive(Debug)]
pub struct DispatchError {
    status: Option<u16>,
    message: String,
    source: Option<anyhow::Error>,
}

impl DispatchError {
    /// Create an error without an explicit status.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Create an error carrying an HTTP status.
    #[must_use]
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
            source: None,
        }
    }

    /// Create a 404 error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::http(404, message)
    }

    /// Attach a source error.
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// Build from a caught panic payload.
    #[must_use]
    pub fn from_panic(payload: &(dyn Any + Send)) -> Self {
        Self::new(format!("handler panicked: {}", panic_message(payload)))
    }

    /// Status to render: the explicit one, or 500.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        self.status.unwrap_or(500)
    }

    /// The explicit status, if any.
    #[must_use]
    pub const fn explicit_status(&self) -> Option<u16> {
        self.status
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Message followed by the full source chain, for logs and debug output.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.source {
            Some(source) => format!("{}: {source:#}", self.message),
            None => self.message.clone(),
        }
    }
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status_code(), self.message)
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<anyhow::Error> for DispatchError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string()).with_source(err)
    }
}

impl From<ConfigurationError> for DispatchError {
    fn from(err: ConfigurationError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<SessionError> for DispatchError {
    fn from(err: SessionError) -> Self {
        Self::new(err.to_string())
    }
}

/// The primary error renderer failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenderError {
    /// The renderer returned an error.
    #[error("Error renderer failed: {0}")]
    Failed(String),

    /// The renderer panicked.
    #[error("Error renderer panicked: {0}")]
    Panicked(String),
}

/// Errors surfaced by the lifecycle reset sequence.
#[derive(Error, Debug)]
pub enum LifecycleError {
    /// Components could not be prepared.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// The session could not be bound or released.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Something failed that is reported like a dispatch failure.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Rendering an error failed as well.
    #[error("Double fault: {secondary} (while handling: {primary})")]
    DoubleFault {
        /// Description of the original error
        primary: String,
        /// Description of the rendering failure
        secondary: String,
    },

    /// Out-of-order lifecycle transition.
    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidTransition {
        /// State the lifecycle was in
        from: LifecycleState,
        /// State that was requested
        to: LifecycleState,
    },
}

impl LifecycleError {
    /// Convert into the error handed to the fallback pipeline.
    #[must_use]
    pub fn into_dispatch_error(self) -> DispatchError {
        match self {
            Self::Dispatch(err) => err,
            Self::Configuration(err) => err.into(),
            Self::Session(err) => err.into(),
            other => DispatchError::new(other.to_string()),
        }
    }
}

/// Best-effort text of a panic payload.
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_error_defaults_to_500() {
        let err = DispatchError::new("boom");
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.explicit_status(), None);
        assert_eq!(err.to_string(), "[500] boom");
    }

    #[test]
    fn test_dispatch_error_keeps_explicit_status() {
        let err = DispatchError::not_found("no such page");
        assert_eq!(err.status_code(), 404);
        assert_eq!(err.message(), "no such page");
    }

    #[test]
    fn test_describe_includes_source_chain() {
        let source = anyhow::anyhow!("disk full").context("writing cache");
        let err = DispatchError::new("save failed").with_source(source);
        assert_eq!(err.describe(), "save failed: writing cache: disk full");
    }

    #[test]
    fn test_configuration_error_becomes_500() {
        let err: DispatchError =
            ConfigurationError::UnresolvableComponent("user".to_string()).into();
        assert_eq!(err.status_code(), 500);
        assert!(err.message().contains("user"));
    }

    #[test]
    fn test_panic_message_variants() {
        let static_str: Box<dyn Any + Send> = Box::new("static");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let other: Box<dyn Any + Send> = Box::new(42_u32);

        assert_eq!(panic_message(static_str.as_ref()), "static");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_lifecycle_error_into_dispatch_error() {
        let err = LifecycleError::from(SessionError::NotActive).into_dispatch_error();
        assert_eq!(err.status_code(), 500);
        assert_eq!(err.message(), "No session is active");
    }
}
