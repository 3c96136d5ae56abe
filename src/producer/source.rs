//! Where incoming messages come from.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub data: Vec<u8>,
}

impl Attachment {
    pub fn is_pdf(&self) -> bool {
        self.filename.to_ascii_lowercase().ends_with(".pdf")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    /// Monotonically increasing id within one source (a mailbox UID).
    pub source_id: u64,
    pub subject: String,
    pub sender: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Ids greater than `watermark`, ascending.
    async fn list_since(&self, watermark: u64) -> Result<Vec<u64>>;

    async fn fetch(&self, id: u64) -> Result<IncomingMessage>;
}

/// Messages dropped into a directory by an external mail fetcher:
///
/// ```text
/// <root>/<uid>/message.toml   subject, sender, body
/// <root>/<uid>/<attachment>   every other file
/// ```
#[derive(Debug, Clone)]
pub struct SpoolSource {
    root: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MessageHeader {
    subject: String,
    sender: String,
    body: String,
}

const HEADER_FILE: &str = "message.toml";

impl SpoolSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl MessageSource for SpoolSource {
    async fn list_since(&self, watermark: u64) -> Result<Vec<u64>> {
        if !tokio::fs::try_exists(&self.root).await? {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u64>().ok())
            else {
                continue;
            };
            if id > watermark {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        debug!(root = %self.root.display(), watermark, found = ids.len(), "listed spool");
        Ok(ids)
    }

    async fn fetch(&self, id: u64) -> Result<IncomingMessage> {
        let dir = self.root.join(id.to_string());
        let header_path = dir.join(HEADER_FILE);
        let header: MessageHeader = match tokio::fs::read_to_string(&header_path).await {
            Ok(text) => toml::from_str(&text).map_err(|e| {
                Error::Other(format!("bad {}: {e}", header_path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MessageHeader::default(),
            Err(e) => return Err(e.into()),
        };

        let mut attachments = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename == HEADER_FILE {
                continue;
            }
            let data = tokio::fs::read(entry.path()).await?;
            attachments.push(Attachment { filename, data });
        }
        attachments.sort_by(|a, b| a.filename.cmp(&b.filename));

        Ok(IncomingMessage {
            source_id: id,
            subject: header.subject,
            sender: header.sender,
            body: header.body,
            attachments,
        })
    }
}
