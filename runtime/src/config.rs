//! Worker configuration.
//!
//! Settings are read once at worker start. [`WorkerConfig::from_env`]
//! reads `WORKER_*` environment variables; [`WorkerConfig::from_lookup`]
//! does the same through an arbitrary lookup function.

use crate::leak_guard::SweepScope;
use persistent_worker_core::component::RequestScopeConfig;
use persistent_worker_core::error::ConfigurationError;

/// Server parameter names stripped from debug output by default.
pub const DEFAULT_REDACTED_KEYS: &[&str] = &[
    "PHP_AUTH_PW",
    "PHP_AUTH_USER",
    "HTTP_AUTHORIZATION",
    "HTTP_COOKIE",
    "AUTH_TOKEN",
    "API_KEY",
    "SECRET_KEY",
    "DB_PASSWORD",
    "DATABASE_URL",
    "AWS_SECRET_ACCESS_KEY",
];

/// Configuration of one persistent worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Components rebuilt for every request
    pub request_scope: RequestScopeConfig,
    /// Name of the cookie carrying the session id
    pub session_cookie: String,
    /// Memory limit string (`"-1"`, `"131072"`, `"256M"`…)
    pub memory_limit: String,
    /// Usage percentage of the limit at which recycling is signalled
    pub recycle_threshold_percent: u8,
    /// Include error details in double-fault responses
    pub debug: bool,
    /// Output buffer level preserved when an error discards output
    pub discard_output_level: usize,
    /// Server parameters removed from debug output (exact name match)
    pub redacted_keys: Vec<String>,
    /// Extent of the leak guard's safety-net sweep
    pub sweep_scope: SweepScope,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            request_scope: RequestScopeConfig::default(),
            session_cookie: "SESSIONID".to_string(),
            memory_limit: "128M".to_string(),
            recycle_threshold_percent: 90,
            debug: false,
            discard_output_level: 0,
            redacted_keys: DEFAULT_REDACTED_KEYS.iter().map(ToString::to_string).collect(),
            sweep_scope: SweepScope::Request,
        }
    }
}

impl WorkerConfig {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the request scope.
    #[must_use]
    pub fn with_request_scope(mut self, scope: RequestScopeConfig) -> Self {
        self.request_scope = scope;
        self
    }

    /// Set the session cookie name.
    #[must_use]
    pub fn with_session_cookie(mut self, name: impl Into<String>) -> Self {
        self.session_cookie = name.into();
        self
    }

    /// Set the memory limit string.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: impl Into<String>) -> Self {
        self.memory_limit = limit.into();
        self
    }

    /// Set the recycle threshold percentage.
    #[must_use]
    pub const fn with_recycle_threshold(mut self, percent: u8) -> Self {
        self.recycle_threshold_percent = percent;
        self
    }

    /// Enable or disable debug output.
    #[must_use]
    pub const fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the output level preserved on error.
    #[must_use]
    pub const fn with_discard_output_level(mut self, level: usize) -> Self {
        self.discard_output_level = level;
        self
    }

    /// Add a redacted server parameter name.
    #[must_use]
    pub fn with_redacted_key(mut self, key: impl Into<String>) -> Self {
        self.redacted_keys.push(key.into());
        self
    }

    /// Set the sweep scope.
    #[must_use]
    pub const fn with_sweep_scope(mut self, scope: SweepScope) -> Self {
        self.sweep_scope = scope;
        self
    }

    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidSetting`] for malformed values.
    pub fn from_env() -> Result<Self, ConfigurationError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidSetting`] for malformed values.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(scope) = lookup("WORKER_REQUEST_SCOPE") {
            config.request_scope = RequestScopeConfig::parse(&scope);
        }
        if let Some(cookie) = lookup("WORKER_SESSION_COOKIE") {
            config.session_cookie = cookie.trim().to_string();
        }
        if let Some(limit) = lookup("WORKER_MEMORY_LIMIT") {
            config.memory_limit = limit.trim().to_string();
        }
        if let Some(threshold) = lookup("WORKER_RECYCLE_THRESHOLD") {
            config.recycle_threshold_percent = threshold
                .trim()
                .parse()
                .map_err(|e| invalid("WORKER_RECYCLE_THRESHOLD", format!("{e}")))?;
        }
        if let Some(debug) = lookup("WORKER_DEBUG") {
            config.debug = parse_bool(&debug)
                .ok_or_else(|| invalid("WORKER_DEBUG", format!("'{debug}' is not a boolean")))?;
        }
        if let Some(level) = lookup("WORKER_DISCARD_OUTPUT_LEVEL") {
            config.discard_output_level = level
                .trim()
                .parse()
                .map_err(|e| invalid("WORKER_DISCARD_OUTPUT_LEVEL", format!("{e}")))?;
        }
        if let Some(keys) = lookup("WORKER_REDACTED_KEYS") {
            config.redacted_keys.extend(
                keys.split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(ToString::to_string),
            );
        }
        if let Some(sweep) = lookup("WORKER_EVENT_SWEEP") {
            config.sweep_scope = match sweep.trim().to_ascii_lowercase().as_str() {
                "request" => SweepScope::Request,
                "global" => SweepScope::Global,
                other => {
                    return Err(invalid(
                        "WORKER_EVENT_SWEEP",
                        format!("expected 'request' or 'global', got '{other}'"),
                    ));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidSetting`] for an empty cookie
    /// name or a threshold outside `1..=100`.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.session_cookie.is_empty() {
            return Err(invalid("session_cookie", "must not be empty"));
        }
        if !(1..=100).contains(&self.recycle_threshold_percent) {
            return Err(invalid(
                "recycle_threshold_percent",
                format!("{} is outside 1..=100", self.recycle_threshold_percent),
            ));
        }
        Ok(())
    }
}

/// Parse `1`/`true`/`yes`/`on` and `0`/`false`/`no`/`off`.
#[must_use]
pub fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidSetting {
        key: key.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, WorkerConfig::default());
        assert_eq!(config.session_cookie, "SESSIONID");
        assert_eq!(config.recycle_threshold_percent, 90);
        assert_eq!(config.request_scope.ids().len(), 6);
    }

    #[test]
    fn test_reads_every_variable() {
        let config = WorkerConfig::from_lookup(lookup_from(&[
            ("WORKER_REQUEST_SCOPE", "request, session"),
            ("WORKER_SESSION_COOKIE", "sid"),
            ("WORKER_MEMORY_LIMIT", "256M"),
            ("WORKER_RECYCLE_THRESHOLD", "80"),
            ("WORKER_DEBUG", "yes"),
            ("WORKER_DISCARD_OUTPUT_LEVEL", "1"),
            ("WORKER_REDACTED_KEYS", "STRIPE_KEY, ,SMTP_PASSWORD"),
            ("WORKER_EVENT_SWEEP", "Global"),
        ]))
        .unwrap();

        assert_eq!(config.request_scope.ids().len(), 2);
        assert_eq!(config.session_cookie, "sid");
        assert_eq!(config.memory_limit, "256M");
        assert_eq!(config.recycle_threshold_percent, 80);
        assert!(config.debug);
        assert_eq!(config.discard_output_level, 1);
        assert!(config.redacted_keys.contains(&"STRIPE_KEY".to_string()));
        assert!(config.redacted_keys.contains(&"DB_PASSWORD".to_string()));
        assert_eq!(config.sweep_scope, SweepScope::Global);
    }

    #[test]
    fn test_rejects_malformed_values() {
        for (key, value) in [
            ("WORKER_RECYCLE_THRESHOLD", "ninety"),
            ("WORKER_RECYCLE_THRESHOLD", "0"),
            ("WORKER_DEBUG", "maybe"),
            ("WORKER_EVENT_SWEEP", "everything"),
            ("WORKER_SESSION_COOKIE", "  "),
        ] {
            let result = WorkerConfig::from_lookup(lookup_from(&[(key, value)]));
            assert!(
                matches!(result, Err(ConfigurationError::InvalidSetting { .. })),
                "{key}={value} should be rejected"
            );
        }
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("2"), None);
    }
}
