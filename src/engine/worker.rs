//! Worker loop: sweep stuck jobs, claim one, brand it, deliver it, retire it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio::sync::Notify;
use tracing::{Instrument, debug, error, info, warn};

use super::workspace::JobWorkspace;
use crate::compose::{BrandOutcome, Composer};
use crate::db::JobStore;
use crate::error::{Error, Result};
use crate::extract::{
    MetadataExtractor, PlaceholderExtractor, report_filename, resolve_metadata, sanitize_component,
};
use crate::fetch::LinkFetcher;
use crate::model::{FailOutcome, Job, JobId, JobPayload};
use crate::sink::{Delivery, Sink};
use crate::telemetry::job::{record_state_transition, start_job_span};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Parent of the per-job scratch directories.
    pub work_dir: PathBuf,
    /// Sleep between polls when the queue is empty.
    pub poll_interval: Duration,
    /// Sleep after an iteration failed on a store error.
    pub error_backoff: Duration,
    /// Directory the producer saves attachments into. File jobs whose source
    /// lives under it are deleted after successful delivery; sources
    /// elsewhere are never touched.
    pub spool_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("work"),
            poll_interval: Duration::from_secs(5),
            error_backoff: Duration::from_secs(5),
            spool_dir: None,
        }
    }
}

/// Result of one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    /// Nothing was eligible.
    Idle,
    Processed { job_id: JobId, outcome: JobOutcome },
}

/// What happened to a claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed {
        filename: String,
        /// Sinks that accepted the report.
        delivered: Vec<String>,
        /// `"<sink>: <error>"` for every sink that did not.
        failed_sinks: Vec<String>,
        /// Branding failed and the unmodified source was delivered.
        copied_original: bool,
    },
    Retrying { attempt: u32, error: String },
    Failed { attempts: u32, error: String },
}

struct Delivered {
    filename: String,
    delivered: Vec<String>,
    failed_sinks: Vec<String>,
    copied_original: bool,
}

struct SourceDocument {
    path: PathBuf,
    filename: String,
}

#[derive(Clone)]
pub struct Worker {
    store: JobStore,
    composer: Composer,
    extractor: Arc<dyn MetadataExtractor>,
    fetcher: Option<Arc<dyn LinkFetcher>>,
    sinks: Vec<Arc<dyn Sink>>,
    config: WorkerConfig,
    shutdown: Arc<Notify>,
}

impl Worker {
    pub fn new(store: JobStore, composer: Composer, config: WorkerConfig) -> Self {
        Self {
            store,
            composer,
            extractor: Arc::new(PlaceholderExtractor),
            fetcher: None,
            sinks: Vec::new(),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn LinkFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Signal the loop to stop after the current iteration.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run iterations until [`Worker::shutdown`] is called.
    pub async fn run(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.config.work_dir).await?;
        info!(
            work_dir = %self.config.work_dir.display(),
            sinks = self.sinks.len(),
            "worker started"
        );

        loop {
            let pause = match self.tick().await {
                Ok(Tick::Idle) => self.config.poll_interval,
                Ok(Tick::Processed { .. }) => Duration::ZERO,
                Err(e) => {
                    error!(error = %e, "worker iteration failed");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("worker shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One iteration: sweep, claim, process.
    ///
    /// Job-level failures are recorded in the store and reported through
    /// [`JobOutcome`]. Only store errors are returned as `Err`.
    pub async fn tick(&self) -> Result<Tick> {
        self.store.reset_stuck_default().await?;

        let Some(job) = self.store.claim_next().await? else {
            return Ok(Tick::Idle);
        };
        let job_id = job.id;
        let outcome = self.process(job).await?;
        Ok(Tick::Processed { job_id, outcome })
    }

    async fn process(&self, job: Job) -> Result<JobOutcome> {
        let workspace = JobWorkspace::create(&self.config.work_dir, &job).await;
        let attempt_id = workspace
            .as_ref()
            .map(|w| w.attempt_id)
            .unwrap_or_else(|_| uuid::Uuid::new_v4());
        let span = start_job_span(job.id, job.kind(), &attempt_id);

        async {
            record_state_transition(&span, "pending", "processing");
            info!(source_id = %job.source_id, retry_count = job.retry_count, "processing job");

            let result = match &workspace {
                Ok(workspace) => self.handle(&job, workspace).await,
                Err(e) => Err(Error::Other(format!("workspace: {e}"))),
            };

            match result {
                Ok(done) => {
                    self.store.complete(job.id).await?;
                    record_state_transition(&span, "processing", "completed");
                    info!(
                        file = %done.filename,
                        delivered = ?done.delivered,
                        failed_sinks = done.failed_sinks.len(),
                        "job completed"
                    );
                    if let Ok(workspace) = &workspace {
                        self.cleanup(&job, workspace).await;
                    }
                    Ok(JobOutcome::Completed {
                        filename: done.filename,
                        delivered: done.delivered,
                        failed_sinks: done.failed_sinks,
                        copied_original: done.copied_original,
                    })
                }
                Err(e) => {
                    let message = e.to_string();
                    match self.store.fail(job.id, &message).await? {
                        FailOutcome::Retrying { attempt } => {
                            record_state_transition(&span, "processing", "pending");
                            warn!(attempt, error = %message, "job failed, will retry");
                            Ok(JobOutcome::Retrying {
                                attempt,
                                error: message,
                            })
                        }
                        FailOutcome::Exhausted { attempts } => {
                            record_state_transition(&span, "processing", "failed");
                            error!(attempts, error = %message, "job failed permanently");
                            Ok(JobOutcome::Failed {
                                attempts,
                                error: message,
                            })
                        }
                    }
                }
            }
        }
        .instrument(span.clone())
        .await
    }

    /// Resolve, extract, brand, deliver. Any error fails the attempt.
    async fn handle(&self, job: &Job, workspace: &JobWorkspace) -> Result<Delivered> {
        let source = self.resolve_source(job, workspace).await?;

        let metadata = resolve_metadata(
            self.extractor.extract(&source.path, &source.filename).await,
            &source.path,
        );
        let filename = if self.composer.options().rename {
            report_filename(&metadata)
        } else {
            sanitize_component(&source.filename, &format!("report-{}.pdf", job.id))
        };
        let output = workspace.output_path(&filename);

        let composer = self.composer.clone();
        let (input, target) = (source.path.clone(), output.clone());
        let started = Instant::now();
        let branded = tokio::task::spawn_blocking(move || composer.brand_file(&input, &target))
            .await
            .map_err(|e| Error::Other(format!("composition task aborted: {e}")))?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let copied_original = match branded {
            Ok(BrandOutcome::Branded { pages }) => {
                metrics::compose_duration_ms().record(elapsed_ms, &[KeyValue::new("outcome", "branded")]);
                debug!(pages, "branding applied");
                false
            }
            Ok(BrandOutcome::CopiedOriginal { reason }) => {
                metrics::compose_duration_ms().record(elapsed_ms, &[KeyValue::new("outcome", "copied")]);
                warn!(%reason, "delivering unbranded original");
                true
            }
            Err(e) => {
                metrics::compose_duration_ms().record(elapsed_ms, &[KeyValue::new("outcome", "error")]);
                return Err(e.into());
            }
        };

        let delivery = Delivery {
            path: &output,
            filename: &filename,
            patient_name: &metadata.patient_name,
            test_name: &metadata.test_name,
            tenant: job.tenant.as_deref(),
        };
        let (delivered, failed_sinks) = self.deliver(&delivery).await;
        if delivered.is_empty() {
            let reason = if failed_sinks.is_empty() {
                "no sinks configured".to_string()
            } else {
                failed_sinks.join("; ")
            };
            return Err(Error::Other(format!("delivery failed: {reason}")));
        }

        Ok(Delivered {
            filename,
            delivered,
            failed_sinks,
            copied_original,
        })
    }

    async fn resolve_source(&self, job: &Job, workspace: &JobWorkspace) -> Result<SourceDocument> {
        match &job.payload {
            JobPayload::File { path, filename, .. } => {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(Error::Other(format!("source missing: {path}")));
                }
                Ok(SourceDocument {
                    path: PathBuf::from(path),
                    filename: filename.clone(),
                })
            }
            JobPayload::Link { url, .. } => {
                let fetcher = self
                    .fetcher
                    .as_ref()
                    .ok_or_else(|| Error::Config("no link fetcher configured".to_string()))?;
                let dest = workspace.fetched_path();
                fetcher.fetch(url, &dest).await?;
                Ok(SourceDocument {
                    path: dest,
                    filename: format!("report-{}.pdf", job.id),
                })
            }
        }
    }

    /// Offer the report to every sink. Returns (accepted, failures).
    async fn deliver(&self, delivery: &Delivery<'_>) -> (Vec<String>, Vec<String>) {
        let mut delivered = Vec::new();
        let mut failures = Vec::new();
        for sink in &self.sinks {
            match sink.deliver(delivery).await {
                Ok(()) => {
                    metrics::sink_deliveries().add(
                        1,
                        &[KeyValue::new("sink", sink.name().to_string()), KeyValue::new("result", "ok")],
                    );
                    delivered.push(sink.name().to_string());
                }
                Err(e) => {
                    metrics::sink_deliveries().add(
                        1,
                        &[KeyValue::new("sink", sink.name().to_string()), KeyValue::new("result", "error")],
                    );
                    warn!(sink = sink.name(), error = %e, "sink delivery failed");
                    failures.push(format!("{}: {e}", sink.name()));
                }
            }
        }
        (delivered, failures)
    }

    /// Remove transient artifacts after success. Failures are only logged.
    async fn cleanup(&self, job: &Job, workspace: &JobWorkspace) {
        if let Err(e) = workspace.cleanup().await {
            warn!(dir = %workspace.dir.display(), error = %e, "workspace cleanup failed");
        }

        let JobPayload::File { path, .. } = &job.payload else {
            return;
        };
        let path = Path::new(path);
        if !self.is_spooled(path) {
            return;
        }
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "could not remove spooled source");
            return;
        }
        if let Some(parent) = path.parent() {
            // only succeeds once the last attachment of the message is gone
            if tokio::fs::remove_dir(parent).await.is_ok() {
                debug!(dir = %parent.display(), "spool directory removed");
            }
        }
    }

    fn is_spooled(&self, path: &Path) -> bool {
        let Some(spool) = &self.config.spool_dir else {
            return false;
        };
        match (std::path::absolute(spool), std::path::absolute(path)) {
            (Ok(spool), Ok(path)) => path.starts_with(spool),
            _ => false,
        }
    }
}
