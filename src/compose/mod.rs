//! Page-composition engine: cover insertion, header overlay, first-page
//! removal, and the multi-document merge used for per-patient reports.
//!
//! Everything here is synchronous and CPU-bound. Async callers run it on
//! `tokio::task::spawn_blocking`.

pub mod assets;
pub mod batch;
mod builder;
pub mod layout;

use std::path::Path;
use std::sync::Arc;

use lopdf::Document;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use assets::{AssetPaths, BrandAssets};
use builder::OutputBuilder;
use layout::PageRange;

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    /// The window selected from the source holds no pages. Nothing is written.
    #[error("no pages left to emit")]
    NoPages,

    #[error("pdf error: {0}")]
    Pdf(#[from] lopdf::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed document: {0}")]
    Malformed(String),
}

/// How the header band is drawn on branded pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderStyle {
    /// No overlay at all.
    None,
    /// A plain white band that masks the original letterhead.
    White,
    /// The white band plus the left and right logos.
    #[default]
    Branded,
}

impl HeaderStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            HeaderStyle::None => "none",
            HeaderStyle::White => "white",
            HeaderStyle::Branded => "branded",
        }
    }
}

impl std::fmt::Display for HeaderStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HeaderStyle {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(HeaderStyle::None),
            "white" => Ok(HeaderStyle::White),
            "branded" => Ok(HeaderStyle::Branded),
            other => Err(crate::error::Error::Config(format!(
                "unknown header style: {other} (expected none, white, or branded)"
            ))),
        }
    }
}

/// Per-run composition policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeOptions {
    pub add_cover: bool,
    pub header_style: HeaderStyle,
    pub remove_first_page: bool,
    /// Name outputs after the extracted patient and test instead of the
    /// source file name.
    pub rename: bool,
}

impl Default for ComposeOptions {
    fn default() -> Self {
        Self {
            add_cover: true,
            header_style: HeaderStyle::Branded,
            remove_first_page: true,
            rename: true,
        }
    }
}

/// What [`Composer::brand_file`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrandOutcome {
    /// The branded document, with its final page count.
    Branded { pages: usize },
    /// Branding failed; the source was copied through unchanged.
    CopiedOriginal { reason: String },
}

/// Stateless transformer holding the decoded branding assets and the
/// policy. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Composer {
    assets: Arc<BrandAssets>,
    options: ComposeOptions,
}

impl Composer {
    pub fn new(assets: BrandAssets, options: ComposeOptions) -> Self {
        Self {
            assets: Arc::new(assets),
            options,
        }
    }

    pub fn options(&self) -> &ComposeOptions {
        &self.options
    }

    /// Same assets, different policy.
    pub fn with_options(&self, options: ComposeOptions) -> Self {
        Self {
            assets: Arc::clone(&self.assets),
            options,
        }
    }

    /// Single-document transform of an in-memory PDF.
    pub fn compose(&self, source: &[u8]) -> Result<Document, ComposeError> {
        self.compose_document(Document::load_mem(source)?)
    }

    pub fn compose_document(&self, source: Document) -> Result<Document, ComposeError> {
        let total = source.get_pages().len();
        let window = PageRange::window(total, self.options.remove_first_page);
        if window.is_empty() {
            return Err(ComposeError::NoPages);
        }

        let mut out = OutputBuilder::new(&self.assets, self.options.header_style)?;
        if self.options.add_cover {
            out.push_cover()?;
        }

        let pages = out.import(source)?;
        for index in window.indices() {
            // the source's last page is a terms page and stays untouched
            let branded = index + 1 < total;
            out.push_page(pages[index], branded)?;
        }
        out.finish()
    }

    /// Merge several reports of one patient into a single document.
    ///
    /// One cover, then each document's content pages (its window minus its
    /// terminal page), then the last document's terminal page once,
    /// unbranded. A single source gets the plain single-document transform.
    pub fn merge(&self, sources: &[&[u8]]) -> Result<Document, ComposeError> {
        let documents = sources
            .iter()
            .map(|bytes| Document::load_mem(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        self.merge_documents(documents)
    }

    pub fn merge_documents(&self, mut sources: Vec<Document>) -> Result<Document, ComposeError> {
        if sources.len() == 1 {
            if let Some(only) = sources.pop() {
                return self.compose_document(only);
            }
        }

        let mut out = OutputBuilder::new(&self.assets, self.options.header_style)?;
        if self.options.add_cover {
            out.push_cover()?;
        }

        let last = sources.len().saturating_sub(1);
        let mut terminal = None;
        let mut emitted = 0usize;

        for (position, source) in sources.into_iter().enumerate() {
            let total = source.get_pages().len();
            if total == 0 {
                warn!(position, "skipping empty document in merge group");
                continue;
            }

            let content = PageRange::content_window(total, self.options.remove_first_page);
            let pages = out.import(source)?;
            for index in content.indices() {
                // only the group's closing terms page goes out without a header
                let branded = !(position == last && index + 1 == total);
                out.push_page(pages[index], branded)?;
                emitted += 1;
            }

            if position == last && total > 1 && !content.contains(total - 1) {
                terminal = Some(pages[total - 1]);
            }
        }

        if let Some(page) = terminal {
            out.push_page(page, false)?;
            emitted += 1;
        }
        if emitted == 0 {
            return Err(ComposeError::NoPages);
        }
        out.finish()
    }

    /// Brand the PDF at `input` into `output`.
    ///
    /// Any failure other than an empty window degrades to copying the source
    /// verbatim, reported as [`BrandOutcome::CopiedOriginal`]. An empty window
    /// writes nothing and returns [`ComposeError::NoPages`].
    pub fn brand_file(&self, input: &Path, output: &Path) -> Result<BrandOutcome, ComposeError> {
        let bytes = std::fs::read(input)?;
        let attempt = self
            .compose(&bytes)
            .and_then(|doc| write_document(doc, output));

        match attempt {
            Ok(pages) => {
                info!(input = %input.display(), output = %output.display(), pages, "report branded");
                Ok(BrandOutcome::Branded { pages })
            }
            Err(ComposeError::NoPages) => Err(ComposeError::NoPages),
            Err(e) => {
                warn!(input = %input.display(), error = %e, "branding failed, copying original");
                std::fs::copy(input, output)?;
                Ok(BrandOutcome::CopiedOriginal {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Merge the PDFs at `inputs` into `output`. Unlike [`Self::brand_file`]
    /// there is no single original to fall back to, so failures propagate.
    pub fn merge_files<P: AsRef<Path>>(
        &self,
        inputs: &[P],
        output: &Path,
    ) -> Result<usize, ComposeError> {
        let documents = inputs
            .iter()
            .map(|p| Document::load(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let pages = write_document(self.merge_documents(documents)?, output)?;
        info!(sources = inputs.len(), output = %output.display(), pages, "reports merged");
        Ok(pages)
    }
}

fn write_document(mut doc: Document, output: &Path) -> Result<usize, ComposeError> {
    let pages = doc.get_pages().len();
    let mut buf = Vec::new();
    doc.save_to(&mut buf)?;
    std::fs::write(output, buf)?;
    Ok(pages)
}
