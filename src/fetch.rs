//! Resolving portal links into local documents.

use std::ffi::OsStr;
use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use crate::error::{Error, Result};
use crate::process::CommandSpec;

#[async_trait]
pub trait LinkFetcher: Send + Sync {
    /// Download the document behind `url` into `dest`.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}

/// Runs `<program> [args…] <url> <dest>`. Succeeds only when the program
/// exits zero and leaves a non-empty file at `dest`.
#[derive(Debug, Clone)]
pub struct CommandFetcher {
    command: CommandSpec,
}

impl CommandFetcher {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl LinkFetcher for CommandFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<()> {
        let output = self
            .command
            .run("fetch", [OsStr::new(url), dest.as_os_str()])
            .await?;

        let size = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        if size == 0 {
            return Err(Error::collaborator(
                "fetch",
                format!(
                    "{url}: no document produced | stdout: {} | stderr: {}",
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim(),
                ),
            ));
        }

        info!(url, dest = %dest.display(), bytes = size, "link fetched");
        Ok(())
    }
}
