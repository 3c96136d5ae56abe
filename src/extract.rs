//! Report metadata: who the report is for and what test it covers.
//!
//! Extraction is best effort. Whatever an extractor returns passes through
//! [`resolve_metadata`], which strips characters that are illegal in file
//! names and substitutes placeholders for anything missing.

use std::ffi::OsStr;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::process::CommandSpec;

pub const UNKNOWN_PATIENT: &str = "Unknown";
pub const DEFAULT_TEST: &str = "REPORT";

const ILLEGAL_FILENAME_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportMetadata {
    pub patient_name: String,
    pub test_name: String,
    pub age: String,
}

impl ReportMetadata {
    pub fn new(patient_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            patient_name: patient_name.into(),
            test_name: test_name.into(),
            age: String::new(),
        }
    }

    pub fn with_age(mut self, age: impl Into<String>) -> Self {
        self.age = age.into();
        self
    }

    pub fn placeholder() -> Self {
        Self::new(UNKNOWN_PATIENT, DEFAULT_TEST)
    }

    /// True when no patient name could be determined.
    pub fn is_unknown_patient(&self) -> bool {
        self.patient_name == UNKNOWN_PATIENT
    }

    fn sanitized(self) -> Self {
        Self {
            patient_name: sanitize_component(&self.patient_name, UNKNOWN_PATIENT),
            test_name: sanitize_component(&self.test_name, DEFAULT_TEST),
            age: self.age.trim().to_string(),
        }
    }
}

/// Apply the fallback policy to an extraction result: errors become
/// placeholders, and every value is made safe for use in a file name.
pub fn resolve_metadata(result: Result<ReportMetadata>, source: &Path) -> ReportMetadata {
    match result {
        Ok(metadata) => metadata.sanitized(),
        Err(e) => {
            warn!(source = %source.display(), error = %e, "metadata extraction failed, using placeholders");
            ReportMetadata::placeholder()
        }
    }
}

/// Drop `\ / * ? : " < > |`, trim, and fall back when nothing is left.
pub fn sanitize_component(value: &str, fallback: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !ILLEGAL_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned.to_string()
    }
}

/// `"{patient} - {test}.pdf"`
pub fn report_filename(metadata: &ReportMetadata) -> String {
    format!("{} - {}.pdf", metadata.patient_name, metadata.test_name)
}

/// `"{patient} - {test1} + {test2} + ….pdf"`
pub fn merged_filename<S: AsRef<str>>(patient_name: &str, test_names: &[S]) -> String {
    let tests: Vec<&str> = test_names.iter().map(AsRef::as_ref).collect();
    format!("{} - {}.pdf", patient_name, tests.join(" + "))
}

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn extract(&self, path: &Path, original_filename: &str) -> Result<ReportMetadata>;
}

/// Runs `<program> [args…] <path> <filename>` and parses a JSON object with
/// `patient_name`, `test_name`, and `age` from stdout.
#[derive(Debug, Clone)]
pub struct CommandExtractor {
    command: CommandSpec,
}

impl CommandExtractor {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl MetadataExtractor for CommandExtractor {
    async fn extract(&self, path: &Path, original_filename: &str) -> Result<ReportMetadata> {
        let output = self
            .command
            .run("extract", [path.as_os_str(), OsStr::new(original_filename)])
            .await?;

        let metadata: ReportMetadata = serde_json::from_slice(&output.stdout).map_err(|e| {
            Error::collaborator("extract", format!("unreadable extractor output: {e}"))
        })?;
        debug!(path = %path.display(), patient = %metadata.patient_name, test = %metadata.test_name, "metadata extracted");
        Ok(metadata)
    }
}

/// Never inspects the document; every report is "Unknown - REPORT".
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderExtractor;

#[async_trait]
impl MetadataExtractor for PlaceholderExtractor {
    async fn extract(&self, _path: &Path, _original_filename: &str) -> Result<ReportMetadata> {
        Ok(ReportMetadata::placeholder())
    }
}
