//! Per-attempt scratch directory for a job.

use std::path::{Path, PathBuf};

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::Job;

/// `<base>/job-<id>/`, recreated from scratch on every attempt.
///
/// ```text
/// job-<id>/
///   job.json      the claimed job, for inspection
///   fetched.pdf   downloaded source (link jobs)
///   out/          branded output
/// ```
pub struct JobWorkspace {
    pub attempt_id: Uuid,
    pub dir: PathBuf,
}

impl JobWorkspace {
    pub async fn create(base_dir: &Path, job: &Job) -> Result<Self> {
        let attempt_id = Uuid::new_v4();
        let dir = base_dir.join(format!("job-{}", job.id));

        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(dir.join("out")).await?;

        let job_json = serde_json::to_string_pretty(job)
            .map_err(|e| Error::Other(format!("serialize job: {e}")))?;
        tokio::fs::write(dir.join("job.json"), job_json).await?;

        debug!(
            job_id = %job.id,
            attempt = %attempt_id,
            dir = %dir.display(),
            "workspace created"
        );
        Ok(Self { attempt_id, dir })
    }

    /// Where a link job's download lands.
    pub fn fetched_path(&self) -> PathBuf {
        self.dir.join("fetched.pdf")
    }

    pub fn output_path(&self, filename: &str) -> PathBuf {
        self.dir.join("out").join(filename)
    }

    pub async fn cleanup(&self) -> Result<()> {
        tokio::fs::remove_dir_all(&self.dir).await?;
        debug!(attempt = %self.attempt_id, "workspace cleaned up");
        Ok(())
    }
}
