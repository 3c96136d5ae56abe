//! Metric instrument factories.
//!
//! Instruments come from the `"labrelay"` meter on the globally-registered
//! `MeterProvider`; without one they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("labrelay")
}

/// Counter: jobs enqueued. Labels: `kind` ("file" | "link").
pub fn jobs_enqueued() -> Counter<u64> {
    meter()
        .u64_counter("labrelay.jobs.enqueued")
        .with_description("Number of jobs enqueued")
        .build()
}

/// Counter: job state transitions. Labels: `from`, `to`.
pub fn job_state_transitions() -> Counter<u64> {
    meter()
        .u64_counter("labrelay.jobs.state_transitions")
        .with_description("Number of job state transitions")
        .build()
}

/// Counter: jobs returned to pending by the stuck-job sweep.
pub fn stuck_jobs_reset() -> Counter<u64> {
    meter()
        .u64_counter("labrelay.jobs.stuck_reset")
        .with_description("Jobs reclaimed from presumed-dead workers")
        .build()
}

/// Counter: sink delivery attempts. Labels: `sink`, `result` ("ok" | "error").
pub fn sink_deliveries() -> Counter<u64> {
    meter()
        .u64_counter("labrelay.sink.deliveries")
        .with_description("Number of sink delivery attempts")
        .build()
}

/// Histogram: branding transform duration. Labels: `outcome`.
pub fn compose_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("labrelay.compose.duration_ms")
        .with_description("Composition engine duration in milliseconds")
        .with_unit("ms")
        .build()
}
