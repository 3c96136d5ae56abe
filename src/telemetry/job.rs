//! Job processing span helpers.

use tracing::Span;
use uuid::Uuid;

use crate::model::{JobId, JobKind};

/// Start a span covering one processing attempt of a job.
///
/// `job.status` is declared empty and filled in by
/// [`record_state_transition`].
pub fn start_job_span(job_id: JobId, kind: JobKind, attempt_id: &Uuid) -> Span {
    tracing::info_span!(
        "job.process",
        "job.id" = job_id.0,
        "job.kind" = kind.as_str(),
        "job.attempt" = %attempt_id,
        "job.status" = tracing::field::Empty,
    )
}

/// Emit a state transition event inside `span` and record the new status.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("job.status", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
