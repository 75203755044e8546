//! Memory-pressure governor.
//!
//! The governor answers one question after each request: has this worker
//! grown close enough to its memory ceiling that the supervisor should
//! retire it? It never terminates anything itself.

use persistent_worker_core::error::ConfigurationError;
use serde::Serialize;

/// Source of memory usage readings.
pub trait MemoryProbe: Send {
    /// Release whatever memory can be released before a reading.
    fn collect_garbage(&mut self) {}

    /// Current resident memory usage in bytes.
    fn current_usage(&self) -> u64;
}

/// Reads resident set size from `/proc/self/status`.
///
/// Reports 0 on platforms without procfs, which never triggers recycling.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn current_usage(&self) -> u64 {
        match std::fs::read_to_string("/proc/self/status") {
            Ok(status) => parse_vm_rss(&status).unwrap_or(0),
            Err(err) => {
                tracing::trace!(error = %err, "procfs unavailable, reporting zero usage");
                0
            }
        }
    }
}

/// Extract `VmRSS` (in bytes) from the contents of `/proc/<pid>/status`.
#[must_use]
pub fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let mut parts = line.trim_start_matches("VmRSS:").split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    let multiplier = match parts.next().map(str::to_ascii_lowercase).as_deref() {
        Some("kb") | None => 1024,
        Some("mb") => 1024 * 1024,
        Some("gb") => 1024 * 1024 * 1024,
        Some(_) => return None,
    };
    value.checked_mul(multiplier)
}

/// Parse a human-readable memory limit.
///
/// | Input | Result |
/// |---|---|
/// | `"-1"` | `u64::MAX` (unlimited) |
/// | `"131072"` | `131072` |
/// | `"64K"` / `"256M"` / `"1G"` | value × 1024, 1024², 1024³ |
///
/// Suffixes are case-insensitive.
///
/// # Errors
///
/// Returns [`ConfigurationError::InvalidMemoryLimit`] for empty input,
/// negative values other than `-1`, unknown suffixes, or overflow.
pub fn parse_memory_limit(value: &str) -> Result<u64, ConfigurationError> {
    let trimmed = value.trim();
    let error = |reason: &str| ConfigurationError::InvalidMemoryLimit {
        value: value.to_string(),
        reason: reason.to_string(),
    };

    if trimmed == "-1" {
        return Ok(u64::MAX);
    }
    if trimmed.starts_with('-') {
        return Err(error("only -1 may be negative"));
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], 1024_u64),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (trimmed, 1),
        Some(_) => return Err(error("unknown suffix")),
        None => return Err(error("empty value")),
    };

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(error("expected digits"));
    }
    let base: u64 = digits.parse().map_err(|_| error("value too large"))?;
    base.checked_mul(multiplier)
        .ok_or_else(|| error("value too large"))
}

/// One recycle check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryReading {
    /// Resident usage in bytes
    pub current_usage_bytes: u64,
    /// Ceiling in bytes (`u64::MAX` when unlimited)
    pub limit_bytes: u64,
    /// Percentage of the ceiling that triggers recycling
    pub threshold_percent: u8,
}

impl MemoryReading {
    /// Whether usage has reached the threshold.
    ///
    /// An unlimited ceiling never triggers, whatever the usage.
    #[must_use]
    pub fn exceeds_threshold(&self) -> bool {
        if self.is_unlimited() {
            return false;
        }
        u128::from(self.current_usage_bytes) * 100
            >= u128::from(self.limit_bytes) * u128::from(self.threshold_percent)
    }

    /// Whether the ceiling is the unlimited sentinel.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.limit_bytes == u64::MAX
    }
}

/// Decides whether a worker should be recycled.
pub struct MemoryGovernor {
    probe: Box<dyn MemoryProbe>,
    limit_source: String,
    cached_limit: Option<u64>,
    threshold_percent: u8,
}

impl std::fmt::Debug for MemoryGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGovernor")
            .field("limit_source", &self.limit_source)
            .field("cached_limit", &self.cached_limit)
            .field("threshold_percent", &self.threshold_percent)
            .finish_non_exhaustive()
    }
}

impl MemoryGovernor {
    /// Create a governor reading `limit_source` lazily.
    #[must_use]
    pub fn new(probe: Box<dyn MemoryProbe>, limit_source: impl Into<String>, threshold_percent: u8) -> Self {
        Self {
            probe,
            limit_source: limit_source.into(),
            cached_limit: None,
            threshold_percent,
        }
    }

    /// Memory ceiling in bytes.
    ///
    /// Parsed from the configured string on first use and cached. An
    /// unparseable string is logged and treated as unlimited.
    pub fn get_limit(&mut self) -> u64 {
        if let Some(limit) = self.cached_limit {
            return limit;
        }
        let limit = parse_memory_limit(&self.limit_source).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "Falling back to unlimited memory");
            u64::MAX
        });
        self.cached_limit = Some(limit);
        metrics::gauge!("worker_memory_limit_bytes").set(gauge_value(limit));
        limit
    }

    /// Pin the ceiling to `bytes`, or invalidate the cache when `bytes <= 0`.
    pub fn set_limit(&mut self, bytes: i64) {
        if bytes <= 0 {
            tracing::debug!("Memory limit invalidated, recalculating on next check");
            self.cached_limit = None;
        } else {
            let bytes = bytes.unsigned_abs();
            tracing::debug!(bytes, "Memory limit pinned");
            self.cached_limit = Some(bytes);
            metrics::gauge!("worker_memory_limit_bytes").set(gauge_value(bytes));
        }
    }

    /// Replace the limit string and invalidate the cache.
    pub fn set_limit_source(&mut self, source: impl Into<String>) {
        self.limit_source = source.into();
        self.cached_limit = None;
    }

    /// Whether a limit is currently cached.
    #[must_use]
    pub const fn is_limit_cached(&self) -> bool {
        self.cached_limit.is_some()
    }

    /// Collect garbage, then read usage against the limit.
    pub fn reading(&mut self) -> MemoryReading {
        self.probe.collect_garbage();
        let current_usage_bytes = self.probe.current_usage();
        metrics::gauge!("worker_memory_usage_bytes").set(gauge_value(current_usage_bytes));
        MemoryReading {
            current_usage_bytes,
            limit_bytes: self.get_limit(),
            threshold_percent: self.threshold_percent,
        }
    }

    /// Whether usage has reached the recycle threshold.
    pub fn should_recycle(&mut self) -> bool {
        let reading = self.reading();
        let recycle = reading.exceeds_threshold();
        if recycle {
            tracing::info!(
                usage = reading.current_usage_bytes,
                limit = reading.limit_bytes,
                "Memory threshold reached, worker should be recycled"
            );
        }
        recycle
    }
}

#[allow(clippy::cast_precision_loss)]
fn gauge_value(bytes: u64) -> f64 {
    bytes as f64
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct SharedProbe(Arc<AtomicU64>);

    impl MemoryProbe for SharedProbe {
        fn current_usage(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn governor(limit: &str, usage: u64) -> (MemoryGovernor, Arc<AtomicU64>) {
        let usage = Arc::new(AtomicU64::new(usage));
        let governor = MemoryGovernor::new(Box::new(SharedProbe(Arc::clone(&usage))), limit, 90);
        (governor, usage)
    }

    #[test]
    fn test_parse_documented_values() {
        assert_eq!(parse_memory_limit("256M").unwrap(), 268_435_456);
        assert_eq!(parse_memory_limit("1G").unwrap(), 1_073_741_824);
        assert_eq!(parse_memory_limit("-1").unwrap(), u64::MAX);
        assert_eq!(parse_memory_limit("131072").unwrap(), 131_072);
        assert_eq!(parse_memory_limit("64k").unwrap(), 65_536);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        for value in ["", "-2", "12T", "M", "1.5G", "abc", "99999999999999999999G"] {
            assert!(parse_memory_limit(value).is_err(), "{value:?} should be rejected");
        }
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\tworker\nVmPeak:\t  9000 kB\nVmRSS:\t    2048 kB\n";
        assert_eq!(parse_vm_rss(status), Some(2048 * 1024));
        assert_eq!(parse_vm_rss("Name:\tworker\n"), None);
    }

    #[test]
    fn test_recycle_threshold() {
        let limit = 1_000_000_u64;
        let (mut governor, usage) = governor("1000000", limit * 95 / 100);
        assert!(governor.should_recycle());

        usage.store(limit / 2, Ordering::SeqCst);
        assert!(!governor.should_recycle());
    }

    #[test]
    fn test_unlimited_never_recycles() {
        let (mut governor, usage) = governor("-1", u64::MAX - 1);
        assert!(!governor.should_recycle());

        usage.store(u64::MAX, Ordering::SeqCst);
        assert!(!governor.should_recycle());
    }

    #[test]
    fn test_reading_at_unlimited_ceiling_is_below_threshold() {
        let reading = MemoryReading {
            current_usage_bytes: u64::MAX,
            limit_bytes: u64::MAX,
            threshold_percent: 1,
        };
        assert!(reading.is_unlimited());
        assert!(!reading.exceeds_threshold());

        let finite = MemoryReading {
            limit_bytes: u64::MAX - 1,
            ..reading
        };
        assert!(finite.exceeds_threshold());
    }

    #[test]
    fn test_set_limit_pins_and_invalidates() {
        let (mut governor, _) = governor("1M", 0);
        assert_eq!(governor.get_limit(), 1_048_576);

        governor.set_limit(4096);
        assert_eq!(governor.get_limit(), 4096);

        governor.set_limit(0);
        assert!(!governor.is_limit_cached());
        assert_eq!(governor.get_limit(), 1_048_576);

        governor.set_limit_source("2M");
        assert_eq!(governor.get_limit(), 2_097_152);
    }

    #[test]
    fn test_unparseable_source_falls_back_to_unlimited() {
        let (mut governor, _) = governor("lots", 10);
        assert_eq!(governor.get_limit(), u64::MAX);
    }

    proptest! {
        #[test]
        fn prop_suffix_multiplies(n in 0_u64..1_000_000) {
            prop_assert_eq!(parse_memory_limit(&format!("{n}K")).unwrap(), n * 1024);
            prop_assert_eq!(parse_memory_limit(&format!("{n}M")).unwrap(), n * 1024 * 1024);
            prop_assert_eq!(parse_memory_limit(&n.to_string()).unwrap(), n);
        }
    }
}
