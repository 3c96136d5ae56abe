//! The producer's high-water mark: the last message id fully handled.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub last_processed_uid: u64,
    /// Epoch seconds of the last advance.
    #[serde(default)]
    pub last_processed_time: i64,
}

/// JSON file holding a [`Watermark`].
#[derive(Debug, Clone)]
pub struct WatermarkFile {
    path: PathBuf,
}

impl WatermarkFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unreadable file reads as zero, so the producer starts
    /// from the beginning rather than refusing to run.
    pub fn load(&self) -> Watermark {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Watermark::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "watermark unreadable, starting from zero");
                return Watermark::default();
            }
        };
        serde_json::from_str(&text).unwrap_or_else(|e| {
            warn!(path = %self.path.display(), error = %e, "watermark malformed, starting from zero");
            Watermark::default()
        })
    }

    /// Write via a temporary file in the same directory and rename over the
    /// old one, so a crash never leaves a torn file.
    pub fn save(&self, mark: &Watermark) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, mark)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_garbage_reads_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let file = WatermarkFile::new(dir.path().join("state.json"));
        assert_eq!(file.load(), Watermark::default());

        std::fs::write(file.path(), "[1, 2, 3]").unwrap();
        assert_eq!(file.load().last_processed_uid, 0);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = WatermarkFile::new(dir.path().join("nested/state.json"));
        let mark = Watermark {
            last_processed_uid: 42,
            last_processed_time: 1_700_000_000,
        };
        file.save(&mark).unwrap();
        assert_eq!(file.load(), mark);

        let raw = std::fs::read_to_string(file.path()).unwrap();
        assert!(raw.contains("\"last_processed_uid\": 42"));
    }
}
