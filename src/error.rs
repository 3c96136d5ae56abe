//! Error types for labrelay.

use thiserror::Error;

use crate::compose::ComposeError;
use crate::model::JobStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pdf error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("composition error: {0}")]
    Compose(#[from] ComposeError),

    #[error("config error: {0}")]
    Config(String),

    /// An external collaborator (fetcher, extractor, sink) reported failure.
    #[error("{name}: {message}")]
    Collaborator { name: String, message: String },

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub(crate) fn collaborator(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Collaborator {
            name: name.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
