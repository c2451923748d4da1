//! Restore engine
//!
//! Re-materializes a completed run's artifact into a destination directory
//! and optionally checks every extracted path. Restores are not
//! transactional: a failed extraction may leave partial output behind, and a
//! repeated restore into the same destination overwrites.

pub mod extract;

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::{ArtifactFormat, BackupRun, RunId};
use crate::observability::metrics::{self, Timer};
use crate::verify::{check_readable, usable_artifact};
use crate::{OrchestratorError, Result};

pub use extract::{
    ArchiveExtractor, BundledTarExtractor, Extraction, ExtractionError, ListingParser, TarCommandExtractor,
    TarListingParser,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreStats {
    pub file_count: u64,
    pub total_bytes: u64,
    pub duration_ms: u64,
}

/// Per-path outcome of the post-restore check
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestoreVerification {
    pub missing_files: Vec<String>,
    pub corrupted_files: Vec<String>,
    pub verified_files: u64,
    pub total_bytes: u64,
}

impl RestoreVerification {
    pub fn is_clean(&self) -> bool {
        self.missing_files.is_empty() && self.corrupted_files.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreResult {
    pub success: bool,
    pub run_id: RunId,
    pub destination: PathBuf,
    pub extracted_files: Vec<String>,
    pub errors: Vec<String>,
    pub stats: RestoreStats,
    pub verification: Option<RestoreVerification>,
}

pub struct RestoreEngine {
    tar_gz: Arc<dyn ArchiveExtractor>,
}

impl RestoreEngine {
    /// Engine using `extractor` for tar.gz artifacts
    pub fn new(extractor: Arc<dyn ArchiveExtractor>) -> Self {
        Self { tar_gz: extractor }
    }

    /// Engine driving the `tar` binary found at `program`
    pub fn system_tar(program: impl Into<String>) -> Self {
        Self::new(Arc::new(TarCommandExtractor::new(program)))
    }

    pub fn bundled() -> Self {
        Self::new(Arc::new(BundledTarExtractor))
    }

    /// The extractor able to unpack `format`
    pub fn extractor_for(&self, format: ArtifactFormat) -> Result<&Arc<dyn ArchiveExtractor>> {
        match format {
            ArtifactFormat::TarGz => Ok(&self.tar_gz),
            other => Err(OrchestratorError::UnsupportedFormat(format!(
                "no extractor for {} artifacts",
                other
            ))),
        }
    }

    /// Extract a completed run's artifact into `destination`.
    ///
    /// Invalid requests fail before the destination is touched. Extraction
    /// and verification problems come back inside the result.
    pub async fn restore(&self, run: &BackupRun, destination: &Path, verify: bool) -> Result<RestoreResult> {
        let archive = usable_artifact(run)?.to_path_buf();
        if destination.as_os_str().is_empty() {
            return Err(OrchestratorError::Configuration(
                "restore destination is required".to_string(),
            ));
        }
        let format = run
            .artifact_format
            .or_else(|| infer_format(&archive))
            .ok_or_else(|| {
                OrchestratorError::UnsupportedFormat(format!(
                    "cannot determine format of {}",
                    archive.display()
                ))
            })?;
        let extractor = self.extractor_for(format)?;

        tokio::fs::create_dir_all(destination).await?;
        let timer = Timer::start();
        info!(
            run_id = %run.id,
            extractor = extractor.name(),
            destination = %destination.display(),
            "Restore started"
        );

        let mut result = RestoreResult {
            success: false,
            run_id: run.id.clone(),
            destination: destination.to_path_buf(),
            extracted_files: Vec::new(),
            errors: Vec::new(),
            stats: RestoreStats::default(),
            verification: None,
        };

        let extraction = match extractor.extract(&archive, destination).await {
            Ok(extraction) => extraction,
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Extraction failed");
                result.errors.push(e.to_string());
                result.stats.duration_ms = timer.elapsed_ms();
                metrics::record_restore(false);
                return Ok(result);
            }
        };

        result.stats.file_count = extraction.entries.len() as u64;
        result.stats.total_bytes = extraction.bytes_written.unwrap_or(0);
        result.success = true;

        if verify {
            let root = destination.to_path_buf();
            let entries = extraction.entries.clone();
            let verification = tokio::task::spawn_blocking(move || verify_restored(&root, &entries)).await?;

            for path in &verification.missing_files {
                result.errors.push(format!("missing after restore: {}", path));
            }
            for path in &verification.corrupted_files {
                result.errors.push(format!("unreadable after restore: {}", path));
            }
            result.stats.total_bytes = verification.total_bytes;
            result.success = verification.is_clean();
            result.verification = Some(verification);
        }

        result.extracted_files = extraction.entries;
        result.stats.duration_ms = timer.elapsed_ms();
        metrics::record_restore(result.success);
        info!(
            run_id = %run.id,
            success = result.success,
            files = result.stats.file_count,
            duration_ms = result.stats.duration_ms,
            "Restore finished"
        );
        Ok(result)
    }
}

fn infer_format(path: &Path) -> Option<ArtifactFormat> {
    let name = path.file_name()?.to_string_lossy().to_ascii_lowercase();
    if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArtifactFormat::TarGz)
    } else if path.is_dir() {
        Some(ArtifactFormat::Directory)
    } else {
        None
    }
}

/// Check each listed path under `root`
pub fn verify_restored(root: &Path, entries: &[String]) -> RestoreVerification {
    let mut verification = RestoreVerification::default();

    for entry in entries {
        if !is_contained(entry) {
            verification.corrupted_files.push(entry.clone());
            continue;
        }
        let path = root.join(entry);
        match fs::symlink_metadata(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => verification.missing_files.push(entry.clone()),
            Err(_) => verification.corrupted_files.push(entry.clone()),
            Ok(metadata) if metadata.is_file() => match check_readable(&path) {
                Ok(()) => {
                    verification.verified_files += 1;
                    verification.total_bytes += metadata.len();
                }
                Err(_) => verification.corrupted_files.push(entry.clone()),
            },
            Ok(_) => verification.verified_files += 1,
        }
    }
    verification
}

/// Relative and free of `..` or roots
fn is_contained(entry: &str) -> bool {
    let path = Path::new(entry);
    !entry.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
