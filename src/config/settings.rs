//! Pipeline settings loaded from TOML.
//!
//! ```toml
//! [queue]
//! max_retries = 3
//! reclaim_delay_secs = 120
//! stuck_timeout_secs = 600
//!
//! [worker]
//! work_dir = "work"
//!
//! [branding]
//! cover = "assets/cover.png"
//! left_logo = "assets/logo-left.png"
//! right_logo = "assets/logo-right.png"
//! header_style = "branded"
//!
//! [fetch]
//! program = "python3"
//! args = ["fetch_url.py"]
//!
//! [sinks]
//! archive_dir = "/srv/reports"
//! upload_url = "https://reports.example.com/api/upload"
//!
//! [producer]
//! inbox_dir = "inbox"
//! keywords = ["thyrocare"]
//! ```
//!
//! Every key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::compose::{AssetPaths, ComposeOptions};
use crate::db::StoreConfig;
use crate::engine::WorkerConfig;
use crate::error::{Error, Result};
use crate::process::CommandSpec;
use crate::producer::ProducerConfig;

pub const DEFAULT_LINK_PATTERN: &str = r#"https://thyro\.care/n/o/[^\s"'<>]+"#;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub queue: QueueSettings,
    pub worker: WorkerSettings,
    pub branding: BrandingSettings,
    pub fetch: Option<CommandSpec>,
    pub extract: Option<CommandSpec>,
    pub sinks: SinkSettings,
    pub producer: ProducerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub max_retries: u32,
    pub reclaim_delay_secs: u64,
    pub stuck_timeout_secs: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let store = StoreConfig::default();
        Self {
            max_retries: store.max_retries,
            reclaim_delay_secs: store.reclaim_delay.as_secs(),
            stuck_timeout_secs: store.stuck_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    pub work_dir: PathBuf,
    pub poll_interval_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            poll_interval_secs: 5,
            error_backoff_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrandingSettings {
    #[serde(flatten)]
    pub assets: AssetPaths,
    #[serde(flatten)]
    pub options: ComposeOptions,
    /// Default for `rebrand`: group reports by patient.
    pub merge_reports: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkSettings {
    /// Root of the dated `Reports/` archive.
    pub archive_dir: Option<PathBuf>,
    /// Multipart upload endpoint. The token comes from `UPLOAD_API_TOKEN`.
    pub upload_url: Option<String>,
}

impl SinkSettings {
    pub fn is_empty(&self) -> bool {
        self.archive_dir.is_none() && self.upload_url.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerSettings {
    /// Spool of incoming messages (`<inbox>/<uid>/message.toml`).
    pub inbox_dir: PathBuf,
    /// Where attachments are saved for the worker.
    pub spool_dir: PathBuf,
    pub watermark_file: PathBuf,
    /// When non-empty, only senders containing one of these are relevant.
    pub allowed_senders: Vec<String>,
    /// Otherwise a keyword in the sender or subject makes a message relevant.
    pub keywords: Vec<String>,
    pub link_pattern: Option<String>,
    pub tenant: Option<String>,
    pub poll_interval_secs: u64,
    pub error_backoff_secs: u64,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            inbox_dir: PathBuf::from("inbox"),
            spool_dir: PathBuf::from("temp_jobs"),
            watermark_file: PathBuf::from("producer_state.json"),
            allowed_senders: Vec::new(),
            keywords: vec!["thyrocare".to_string()],
            link_pattern: Some(DEFAULT_LINK_PATTERN.to_string()),
            tenant: None,
            poll_interval_secs: 600,
            error_backoff_secs: 30,
        }
    }
}

impl Settings {
    /// Parse a settings file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Like [`Settings::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            info!(path = %path.display(), "settings file not found, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("invalid settings: {e}")))
    }

    /// Checks needed before running the worker or producer.
    pub fn validate(&self) -> Result<()> {
        if self.sinks.is_empty() {
            return Err(Error::Config(
                "no sinks configured: set [sinks] archive_dir and/or upload_url".to_string(),
            ));
        }
        self.link_regex()?;
        if self.queue.stuck_timeout_secs == 0 {
            return Err(Error::Config(
                "queue.stuck_timeout_secs must be positive".to_string(),
            ));
        }
        let (inbox, spool) = (&self.producer.inbox_dir, &self.producer.spool_dir);
        if inbox.starts_with(spool) || spool.starts_with(inbox) {
            return Err(Error::Config(format!(
                "producer.inbox_dir ({}) and producer.spool_dir ({}) must not overlap",
                inbox.display(),
                spool.display()
            )));
        }
        Ok(())
    }

    pub fn link_regex(&self) -> Result<Option<Regex>> {
        self.producer
            .link_pattern
            .as_deref()
            .map(|pattern| {
                Regex::new(pattern)
                    .map_err(|e| Error::Config(format!("invalid producer.link_pattern: {e}")))
            })
            .transpose()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_retries: self.queue.max_retries,
            reclaim_delay: Duration::from_secs(self.queue.reclaim_delay_secs),
            stuck_timeout: Duration::from_secs(self.queue.stuck_timeout_secs),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            work_dir: self.worker.work_dir.clone(),
            poll_interval: Duration::from_secs(self.worker.poll_interval_secs),
            error_backoff: Duration::from_secs(self.worker.error_backoff_secs),
            spool_dir: Some(self.producer.spool_dir.clone()),
        }
    }

    pub fn producer_config(&self) -> Result<ProducerConfig> {
        let p = &self.producer;
        Ok(ProducerConfig {
            spool_dir: p.spool_dir.clone(),
            watermark_path: p.watermark_file.clone(),
            allowed_senders: p.allowed_senders.clone(),
            keywords: p.keywords.clone(),
            link_pattern: self.link_regex()?,
            tenant: p.tenant.clone(),
            poll_interval: Duration::from_secs(p.poll_interval_secs),
            error_backoff: Duration::from_secs(p.error_backoff_secs),
        })
    }
}
