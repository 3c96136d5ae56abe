//! Core data model.
//!
//! A job is one report waiting to be branded and delivered. It carries the
//! identity of the message it came from, a typed payload describing where the
//! source document lives, and its lifecycle state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A unit of work tracked by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Monotonically assigned identifier.
    pub id: JobId,

    /// Identifier of the originating message (mail UID, upload batch, ...).
    /// Several jobs may share one source id.
    pub source_id: String,

    /// Optional partition key for multi-account deployments.
    pub tenant: Option<String>,

    /// Where the source document comes from.
    pub payload: JobPayload,

    /// Current lifecycle state.
    pub status: JobStatus,

    /// Number of failed attempts so far.
    pub retry_count: u32,

    /// Message from the most recent failure.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

/// Newtype for job IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub i64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<i64>()
            .map(JobId)
            .map_err(|_| Error::Other(format!("invalid job id: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker (possibly after a failed attempt).
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Delivered to at least one sink. Terminal.
    Completed,
    /// Retry budget exhausted. Terminal.
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::Other(format!("unknown job status: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Discriminant of a [`JobPayload`], persisted in its own column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    File,
    Link,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::File => "file",
            JobKind::Link => "link",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(JobKind::File),
            "link" => Ok(JobKind::Link),
            other => Err(Error::Other(format!("unknown job kind: {other}"))),
        }
    }
}

/// Variant-specific job data. Serialized with a `type` tag so the stored
/// JSON matches the `kind` column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// A document already on local disk (e.g. a saved mail attachment).
    File {
        path: String,
        filename: String,
        #[serde(default)]
        email_subject: String,
        #[serde(default)]
        email_sender: String,
    },
    /// A portal link that must be fetched before processing.
    Link {
        url: String,
        #[serde(default)]
        email_subject: String,
        #[serde(default)]
        email_sender: String,
    },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::File { .. } => JobKind::File,
            JobPayload::Link { .. } => JobKind::Link,
        }
    }

    pub fn email_subject(&self) -> &str {
        match self {
            JobPayload::File { email_subject, .. } | JobPayload::Link { email_subject, .. } => {
                email_subject
            }
        }
    }

    pub fn email_sender(&self) -> &str {
        match self {
            JobPayload::File { email_sender, .. } | JobPayload::Link { email_sender, .. } => {
                email_sender
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// What `fail` did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; eligible again after the re-claim delay.
    Retrying { attempt: u32 },
    /// Retry budget exhausted; the job is now `failed`.
    Exhausted { attempts: u32 },
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for new jobs. The enqueue contract's input.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub(crate) source_id: String,
    pub(crate) tenant: Option<String>,
    pub(crate) payload: JobPayload,
}

impl NewJob {
    pub fn new(source_id: impl Into<String>, payload: JobPayload) -> Self {
        Self {
            source_id: source_id.into(),
            tenant: None,
            payload,
        }
    }

    /// A job for a document already on disk.
    pub fn file(
        source_id: impl Into<String>,
        path: impl Into<String>,
        filename: impl Into<String>,
    ) -> Self {
        Self::new(
            source_id,
            JobPayload::File {
                path: path.into(),
                filename: filename.into(),
                email_subject: String::new(),
                email_sender: String::new(),
            },
        )
    }

    /// A job for a document behind a portal link.
    pub fn link(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self::new(
            source_id,
            JobPayload::Link {
                url: url.into(),
                email_subject: String::new(),
                email_sender: String::new(),
            },
        )
    }

    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Attach the originating message's subject and sender.
    pub fn origin(mut self, subject: impl Into<String>, sender: impl Into<String>) -> Self {
        match &mut self.payload {
            JobPayload::File {
                email_subject,
                email_sender,
                ..
            }
            | JobPayload::Link {
                email_subject,
                email_sender,
                ..
            } => {
                *email_subject = subject.into();
                *email_sender = sender.into();
            }
        }
        self
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_tag_matches_kind_column() {
        let job = NewJob::file("42", "/tmp/a.pdf", "a.pdf").origin("Report", "lab@example.com");
        let json = serde_json::to_value(&job.payload).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["email_sender"], "lab@example.com");
        assert_eq!(job.kind().as_str(), json["type"]);
    }

    #[test]
    fn link_payload_parses_without_origin_fields() {
        let payload: JobPayload =
            serde_json::from_str(r#"{"type":"link","url":"https://example.com/r/1"}"#).unwrap();
        assert_eq!(payload.kind(), JobKind::Link);
        assert_eq!(payload.email_subject(), "");
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("dead".parse::<JobStatus>().is_err());
    }
}
