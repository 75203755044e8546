//! Metric descriptions for the worker.
//!
//! Metrics are recorded through the `metrics` facade. Installing an
//! exporter is left to the hosting process; without one every recording
//! is a no-op.
//!
//! # Example
//!
//! ```rust
//! use persistent_worker_runtime::metrics::describe_worker_metrics;
//!
//! // Once, after the hosting process installed its recorder
//! describe_worker_metrics();
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// Register descriptions for every metric the worker records.
pub fn describe_worker_metrics() {
    describe_counter!(
        "worker_requests_total",
        Unit::Count,
        "Requests handled by this worker"
    );
    describe_counter!(
        "worker_dispatch_errors_total",
        Unit::Count,
        "Requests answered through the error fallback pipeline"
    );
    describe_counter!(
        "worker_double_faults_total",
        Unit::Count,
        "Errors whose rendering failed and fell back to the hardcoded response"
    );
    describe_counter!(
        "worker_configuration_errors_total",
        Unit::Count,
        "Requests rejected because components could not be prepared"
    );
    describe_counter!(
        "worker_listeners_detached_total",
        Unit::Count,
        "Event listeners removed at the end of requests"
    );
    describe_gauge!(
        "worker_memory_usage_bytes",
        Unit::Bytes,
        "Resident memory at the last recycle check"
    );
    describe_gauge!(
        "worker_memory_limit_bytes",
        Unit::Bytes,
        "Memory ceiling the recycle threshold applies to"
    );
    describe_histogram!(
        "worker_request_duration_seconds",
        Unit::Seconds,
        "Time from accepting a request to producing its wire response"
    );
}
