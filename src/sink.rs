//! Downstream destinations for finished reports.
//!
//! Sinks are independent: the worker offers each report to every sink and a
//! report counts as delivered when at least one accepts it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Local;
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use crate::clock::Clock;
use crate::error::{Error, Result};

/// A finished report ready for delivery.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub path: &'a Path,
    pub filename: &'a str,
    pub patient_name: &'a str,
    pub test_name: &'a str,
    pub tenant: Option<&'a str>,
}

#[async_trait]
pub trait Sink: Send + Sync {
    /// Short label used in logs, metrics, and error messages.
    fn name(&self) -> &str;

    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<()>;
}

/// Copies reports into `<root>/Reports/<YYYY-MM-DD>/`, one folder per local
/// calendar day.
pub struct ArchiveSink {
    root: PathBuf,
    clock: Arc<dyn Clock>,
}

impl ArchiveSink {
    pub fn new(root: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: root.into(),
            clock,
        }
    }

    /// Folder for reports delivered today.
    pub fn day_folder(&self) -> PathBuf {
        let day = self.clock.now().with_timezone(&Local).format("%Y-%m-%d");
        self.root.join("Reports").join(day.to_string())
    }
}

#[async_trait]
impl Sink for ArchiveSink {
    fn name(&self) -> &str {
        "archive"
    }

    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<()> {
        let folder = self.day_folder();
        tokio::fs::create_dir_all(&folder).await?;
        let target = folder.join(delivery.filename);
        tokio::fs::copy(delivery.path, &target).await?;
        info!(target = %target.display(), "report archived");
        Ok(())
    }
}

/// Uploads reports as `multipart/form-data` with a `file` part and a
/// `patientName` field.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    token: Option<SecretString>,
}

impl HttpSink {
    pub fn new(url: impl Into<String>, token: Option<SecretString>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token,
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn name(&self) -> &str {
        "upload"
    }

    async fn deliver(&self, delivery: &Delivery<'_>) -> Result<()> {
        let bytes = tokio::fs::read(delivery.path).await?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(delivery.filename.to_string())
            .mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("patientName", delivery.patient_name.to_string());

        let mut request = self.client.post(&self.url).multipart(form);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::collaborator(
                self.name(),
                format!("HTTP {status}: {}", body.trim()),
            ));
        }

        info!(url = %self.url, file = delivery.filename, "report uploaded");
        Ok(())
    }
}
