//! External helper programs (link fetcher, metadata extractor).

use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::Output;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// A program plus leading arguments. Call-specific arguments are appended
/// after `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Relative paths such as `scripts/fetch.sh` resolve against the working
    /// directory. Bare names (`python3`) are left for `PATH` lookup.
    fn resolved_program(&self) -> Result<PathBuf> {
        let is_bare_name = self.program.components().count() == 1 && !self.program.is_absolute();
        if is_bare_name || self.program.is_absolute() {
            return Ok(self.program.clone());
        }
        Ok(std::env::current_dir()?.join(&self.program))
    }

    /// Run to completion and capture stdout and stderr. A non-zero exit is
    /// reported as a collaborator error named `role`.
    pub async fn run<I, S>(&self, role: &str, extra: I) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = self.resolved_program()?;
        debug!(role, program = %program.display(), "running helper");

        let output = tokio::process::Command::new(&program)
            .args(&self.args)
            .args(extra)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::collaborator(role, format!("{}: {e}", program.display())))?;

        if !output.status.success() {
            return Err(Error::collaborator(
                role,
                format!(
                    "{} exited with {} | stdout: {} | stderr: {}",
                    program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stdout).trim(),
                    String::from_utf8_lossy(&output.stderr).trim(),
                ),
            ));
        }
        Ok(output)
    }
}
