//! Typed configuration.
//!
//! Process-level values (paths, secrets, telemetry) come from environment
//! variables; pipeline behaviour comes from the TOML [`Settings`] file named
//! by `LABRELAY_SETTINGS`. Sensitive values are wrapped in
//! `secrecy::SecretString` so they never end up in logs.

pub mod settings;

pub use settings::Settings;

use std::env::VarError;
use std::path::PathBuf;

use secrecy::SecretString;

use crate::error::{Error, Result};

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub settings_path: PathBuf,
    /// Bearer token for the upload sink.
    pub upload_token: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: path_var("LABRELAY_DB", "jobs.db")?,
            settings_path: path_var("LABRELAY_SETTINGS", "labrelay.toml")?,
            upload_token: optional_var("UPLOAD_API_TOKEN")?.map(SecretString::from),
            otel_endpoint: optional_var("OTEL_ENDPOINT")?,
            log_level: optional_var("LOG_LEVEL")?.unwrap_or_else(|| "info".to_string()),
        })
    }
}

/// Unset and blank are both `None`.
fn optional_var(name: &str) -> Result<Option<String>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(Error::Config(format!(
            "environment variable {name} is not valid UTF-8"
        ))),
    }
}

fn path_var(name: &str, default: &str) -> Result<PathBuf> {
    Ok(PathBuf::from(
        optional_var(name)?.unwrap_or_else(|| default.to_string()),
    ))
}
