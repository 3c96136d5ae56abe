//! Producer loop: turn relevant incoming messages into jobs.
//!
//! Progress is tracked by a watermark over message ids. Each message is
//! recorded in the store before the watermark moves past it, and a message
//! that already has jobs is skipped, so replay after a crash never
//! duplicates work.

pub mod source;
pub mod watermark;

pub use source::{Attachment, IncomingMessage, MessageSource, SpoolSource};
pub use watermark::{Watermark, WatermarkFile};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::Notify;
use tracing::{debug, error, info, info_span, Instrument};

use crate::clock::{Clock, SystemClock};
use crate::db::JobStore;
use crate::error::Result;
use crate::extract::sanitize_component;
use crate::model::NewJob;

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Attachments are written to `<spool_dir>/<source id>/`.
    pub spool_dir: PathBuf,
    pub watermark_path: PathBuf,
    pub allowed_senders: Vec<String>,
    pub keywords: Vec<String>,
    /// Portal links to enqueue when a message has no PDF attachment.
    pub link_pattern: Option<Regex>,
    pub tenant: Option<String>,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("temp_jobs"),
            watermark_path: PathBuf::from("producer_state.json"),
            allowed_senders: Vec::new(),
            keywords: vec!["thyrocare".to_string()],
            link_pattern: None,
            tenant: None,
            poll_interval: Duration::from_secs(600),
            error_backoff: Duration::from_secs(30),
        }
    }
}

/// Decides whether a message carries lab reports.
#[derive(Debug, Clone)]
pub struct RelevanceFilter {
    allowed_senders: Vec<String>,
    keywords: Vec<String>,
}

impl RelevanceFilter {
    pub fn new(allowed_senders: &[String], keywords: &[String]) -> Self {
        let lower = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            allowed_senders: lower(allowed_senders),
            keywords: lower(keywords),
        }
    }

    /// With an allow-list, the sender must contain one of its entries.
    /// Without one, a keyword must appear in the sender or the subject.
    pub fn is_relevant(&self, sender: &str, subject: &str) -> bool {
        let sender = sender.to_lowercase();
        if !self.allowed_senders.is_empty() {
            return self.allowed_senders.iter().any(|s| sender.contains(s.as_str()));
        }
        let subject = subject.to_lowercase();
        self.keywords
            .iter()
            .any(|k| sender.contains(k.as_str()) || subject.contains(k.as_str()))
    }
}

/// Summary of one producer pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerTick {
    /// Messages examined (including skipped ones).
    pub scanned: usize,
    pub enqueued: usize,
    pub watermark: u64,
}

pub struct Producer {
    store: JobStore,
    source: Arc<dyn MessageSource>,
    config: ProducerConfig,
    filter: RelevanceFilter,
    watermark: WatermarkFile,
    clock: Arc<dyn Clock>,
    shutdown: Arc<Notify>,
}

impl Producer {
    pub fn new(store: JobStore, source: Arc<dyn MessageSource>, config: ProducerConfig) -> Self {
        Self {
            filter: RelevanceFilter::new(&config.allowed_senders, &config.keywords),
            watermark: WatermarkFile::new(&config.watermark_path),
            store,
            source,
            config,
            clock: Arc::new(SystemClock),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    pub async fn run(&self) -> Result<()> {
        info!(spool = %self.config.spool_dir.display(), "producer started");
        loop {
            let pause = match self.tick().await {
                Ok(tick) => {
                    debug!(scanned = tick.scanned, enqueued = tick.enqueued, watermark = tick.watermark, "producer pass done");
                    self.config.poll_interval
                }
                Err(e) => {
                    error!(error = %e, "producer pass failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("producer shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Handle every message above the watermark, in id order.
    ///
    /// The watermark is saved after each message. The first error ends the
    /// pass with the watermark still pointing before the failing message.
    pub async fn tick(&self) -> Result<ProducerTick> {
        let mut mark = self.watermark.load();
        let ids = self.source.list_since(mark.last_processed_uid).await?;
        let mut tick = ProducerTick {
            watermark: mark.last_processed_uid,
            ..ProducerTick::default()
        };

        let floor = mark.last_processed_uid;
        for id in ids.into_iter().filter(|id| *id > floor) {
            let span = info_span!("producer.message", "message.id" = id);
            let enqueued = self.handle_message(id).instrument(span).await?;

            mark.last_processed_uid = id;
            mark.last_processed_time = self.clock.now().timestamp();
            self.watermark.save(&mark)?;

            tick.scanned += 1;
            tick.enqueued += enqueued;
            tick.watermark = id;
        }
        Ok(tick)
    }

    async fn handle_message(&self, id: u64) -> Result<usize> {
        let source_id = id.to_string();
        if self.store.count_for_source(&source_id).await? > 0 {
            info!("message already enqueued, skipping");
            return Ok(0);
        }

        let message = self.source.fetch(id).await?;
        if !self.filter.is_relevant(&message.sender, &message.subject) {
            debug!(sender = %message.sender, subject = %message.subject, "message not relevant");
            return Ok(0);
        }

        let job_dir = self.config.spool_dir.join(&source_id);
        let pdfs: Vec<&Attachment> = message.attachments.iter().filter(|a| a.is_pdf()).collect();
        if !pdfs.is_empty() {
            // no job references this directory yet, so leftovers from an
            // interrupted pass can go
            if tokio::fs::try_exists(&job_dir).await? {
                tokio::fs::remove_dir_all(&job_dir).await?;
            }
            tokio::fs::create_dir_all(&job_dir).await?;
        }

        let mut jobs = Vec::new();
        for attachment in pdfs {
            let (path, filename) = save_attachment(&job_dir, attachment).await?;
            jobs.push(self.new_job(
                NewJob::file(&source_id, path.to_string_lossy(), filename),
                &message,
            ));
        }

        if jobs.is_empty() {
            let link = self
                .config
                .link_pattern
                .as_ref()
                .and_then(|re| re.find(&message.body));
            match link {
                Some(link) => jobs.push(self.new_job(NewJob::link(&source_id, link.as_str()), &message)),
                None => {
                    info!(subject = %message.subject, "relevant message has no report attachment or link");
                    return Ok(0);
                }
            }
        }

        let ids = self.store.enqueue_batch(jobs).await?;
        info!(jobs = ids.len(), subject = %message.subject, "message enqueued");
        Ok(ids.len())
    }

    fn new_job(&self, job: NewJob, message: &IncomingMessage) -> NewJob {
        let job = job.origin(&message.subject, &message.sender);
        match &self.config.tenant {
            Some(tenant) => job.tenant(tenant),
            None => job,
        }
    }
}

/// Write an attachment under `dir` with a file-system-safe, unique name.
/// Returns the absolute path and the name used.
async fn save_attachment(dir: &Path, attachment: &Attachment) -> Result<(PathBuf, String)> {
    let base = sanitize_component(&attachment.filename, "attachment.pdf");
    let mut filename = base.clone();
    let mut n = 1;
    while tokio::fs::try_exists(dir.join(&filename)).await? {
        filename = format!("{n}-{base}");
        n += 1;
    }

    let path = std::path::absolute(dir.join(&filename))?;
    tokio::fs::write(&path, &attachment.data).await?;
    debug!(path = %path.display(), bytes = attachment.data.len(), "attachment saved");
    Ok((path, filename))
}
