//! Folder mode: brand every PDF in a directory, optionally merging the
//! reports of one patient into a single document.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use super::{BrandOutcome, Composer};
use crate::error::{Error, Result};
use crate::extract::{
    MetadataExtractor, ReportMetadata, merged_filename, report_filename, resolve_metadata,
};

/// Identifies one patient within a batch: trimmed, lowercased name plus
/// trimmed age.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatientGroupKey {
    name: String,
    age: String,
}

impl PatientGroupKey {
    pub fn new(name: &str, age: &str) -> Self {
        Self {
            name: name.trim().to_lowercase(),
            age: age.trim().to_string(),
        }
    }

    /// Placeholder metadata is keyed like any other, so unknown reports of
    /// the same age land in one group.
    pub fn for_metadata(metadata: &ReportMetadata) -> Self {
        Self::new(&metadata.patient_name, &metadata.age)
    }
}

/// A source PDF and what was extracted from it.
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub path: PathBuf,
    pub metadata: ReportMetadata,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    /// Outputs written with branding applied.
    pub succeeded: usize,
    /// Outputs attempted: one per file, or one per patient group when
    /// merging.
    pub total: usize,
}

/// Group reports by patient, keeping first-seen order for groups and for
/// reports inside a group.
pub fn group_by_patient(reports: Vec<SourceReport>) -> Vec<Vec<SourceReport>> {
    let mut groups: Vec<Vec<SourceReport>> = Vec::new();
    let mut index: HashMap<PatientGroupKey, usize> = HashMap::new();

    for report in reports {
        let key = PatientGroupKey::for_metadata(&report.metadata);
        match index.get(&key) {
            Some(&i) => groups[i].push(report),
            None => {
                index.insert(key, groups.len());
                groups.push(vec![report]);
            }
        }
    }
    groups
}

/// Brand every `*.pdf` directly inside `input` into `output`.
pub async fn process_folder(
    composer: &Composer,
    extractor: &dyn MetadataExtractor,
    input: &Path,
    output: &Path,
    merge: bool,
) -> Result<BatchSummary> {
    let sources = list_pdfs(input).await?;
    tokio::fs::create_dir_all(output).await?;
    info!(input = %input.display(), files = sources.len(), merge, "batch started");

    let needs_metadata = merge || composer.options().rename;
    let mut reports = Vec::with_capacity(sources.len());
    for path in sources {
        let metadata = if needs_metadata {
            let filename = file_name(&path);
            resolve_metadata(extractor.extract(&path, &filename).await, &path)
        } else {
            ReportMetadata::placeholder()
        };
        reports.push(SourceReport { path, metadata });
    }

    let groups = if merge {
        group_by_patient(reports)
    } else {
        reports.into_iter().map(|r| vec![r]).collect()
    };

    let mut summary = BatchSummary::default();
    for group in groups {
        summary.total += 1;
        let ok = if group.len() == 1 {
            brand_single(composer, &group[0], output).await
        } else {
            merge_group(composer, &group, output).await
        };
        if ok {
            summary.succeeded += 1;
        }
    }

    info!(succeeded = summary.succeeded, total = summary.total, "batch finished");
    Ok(summary)
}

async fn brand_single(composer: &Composer, report: &SourceReport, output_dir: &Path) -> bool {
    let name = if composer.options().rename {
        report_filename(&report.metadata)
    } else {
        file_name(&report.path)
    };
    let target = unique_path(output_dir, &name);

    let composer = composer.clone();
    let input = report.path.clone();
    let result = tokio::task::spawn_blocking(move || composer.brand_file(&input, &target)).await;

    match result {
        Ok(Ok(BrandOutcome::Branded { .. })) => true,
        Ok(Ok(BrandOutcome::CopiedOriginal { reason })) => {
            warn!(file = %report.path.display(), %reason, "copied without branding");
            false
        }
        Ok(Err(e)) => {
            error!(file = %report.path.display(), error = %e, "branding failed");
            false
        }
        Err(e) => {
            error!(file = %report.path.display(), error = %e, "branding task aborted");
            false
        }
    }
}

async fn merge_group(composer: &Composer, group: &[SourceReport], output_dir: &Path) -> bool {
    let patient = group[0].metadata.patient_name.clone();
    let tests: Vec<&str> = group.iter().map(|r| r.metadata.test_name.as_str()).collect();
    let target = unique_path(output_dir, &merged_filename(&patient, &tests));

    let composer = composer.clone();
    let inputs: Vec<PathBuf> = group.iter().map(|r| r.path.clone()).collect();
    let result = tokio::task::spawn_blocking(move || composer.merge_files(inputs.as_slice(), &target)).await;

    match result {
        Ok(Ok(_pages)) => true,
        Ok(Err(e)) => {
            error!(%patient, reports = group.len(), error = %e, "merge failed");
            false
        }
        Err(e) => {
            error!(%patient, error = %e, "merge task aborted");
            false
        }
    }
}

async fn list_pdfs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::Config(format!("cannot read input folder {}: {e}", dir.display())))?;
    let mut pdfs = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));
        if is_pdf && entry.file_type().await?.is_file() {
            pdfs.push(path);
        }
    }
    pdfs.sort();
    Ok(pdfs)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "report.pdf".to_string())
}

/// `dir/name`, or `dir/stem (2).pdf`, `dir/stem (3).pdf`, … if taken.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let stem = name.strip_suffix(".pdf").unwrap_or(name);
    (2..)
        .map(|n| dir.join(format!("{stem} ({n}).pdf")))
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
