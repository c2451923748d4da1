//! Integrity verification of completed artifacts
//!
//! Problems with the artifact itself never surface as errors: they become
//! report fields and entries in `errors`. Only requests against runs that
//! cannot be verified at all are rejected.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::model::{BackupRun, RunId};
use crate::observability::metrics;
use crate::{OrchestratorError, Result};

/// Size tolerance and unit for recorded sizes
pub const MIB: u64 = 1_048_576;

/// Files whose read access is checked individually in a directory artifact
pub const SAMPLE_LIMIT: usize = 5;

/// Deepest level sampled, counting the artifact's own entries as level 1
pub const SAMPLE_MAX_DEPTH: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub run_id: RunId,
    pub artifact_path: PathBuf,
    pub exists: bool,
    pub readable: bool,
    pub size_match: bool,
    pub file_count_match: bool,
    pub structure_valid: bool,
    pub errors: Vec<String>,
    pub actual_size_bytes: u64,
    pub actual_file_count: u64,
    pub sampled_files: Vec<PathBuf>,
}

impl VerificationReport {
    fn new(run_id: RunId, artifact_path: PathBuf) -> Self {
        Self {
            run_id,
            artifact_path,
            exists: false,
            readable: false,
            size_match: false,
            file_count_match: false,
            structure_valid: false,
            errors: Vec::new(),
            actual_size_bytes: 0,
            actual_file_count: 0,
            sampled_files: Vec::new(),
        }
    }

    /// Every check passed and nothing was reported
    pub fn is_healthy(&self) -> bool {
        self.exists
            && self.readable
            && self.size_match
            && self.file_count_match
            && self.structure_valid
            && self.errors.is_empty()
    }
}

/// `|actual - recorded| < 1 MiB`
pub fn size_within_tolerance(actual_bytes: u64, recorded_mb: f64) -> bool {
    let expected = recorded_mb * MIB as f64;
    (actual_bytes as f64 - expected).abs() < MIB as f64
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IntegrityVerifier;

impl IntegrityVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Check a completed run's artifact against its recorded metadata.
    ///
    /// Blocking; call from a blocking-capable context.
    pub fn verify(&self, run: &BackupRun) -> Result<VerificationReport> {
        let path = usable_artifact(run)?;
        let mut report = VerificationReport::new(run.id.clone(), path.to_path_buf());

        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.errors.push(format!("artifact not found: {}", path.display()));
                return Ok(finish(report));
            }
            Err(e) => {
                report.exists = true;
                report
                    .errors
                    .push(format!("cannot stat artifact {}: {}", path.display(), e));
                return Ok(finish(report));
            }
        };
        report.exists = true;

        if metadata.is_dir() {
            verify_directory(path, run, &mut report);
        } else {
            verify_file(path, metadata.len(), run, &mut report);
        }

        debug!(
            run_id = %run.id,
            size_match = report.size_match,
            file_count_match = report.file_count_match,
            errors = report.errors.len(),
            "Artifact verified"
        );
        Ok(finish(report))
    }
}

/// Reject runs that have no artifact to look at
pub(crate) fn usable_artifact(run: &BackupRun) -> Result<&Path> {
    if !run.has_usable_artifact() {
        return Err(OrchestratorError::InvalidRunState(format!(
            "run {} is {} and has {} artifact",
            run.id,
            run.status,
            if run.artifact_path.is_some() { "an" } else { "no" }
        )));
    }
    run.artifact_path
        .as_deref()
        .ok_or_else(|| OrchestratorError::InvalidRunState(format!("run {} has no artifact", run.id)))
}

fn finish(report: VerificationReport) -> VerificationReport {
    metrics::record_verification(report.is_healthy());
    report
}

fn verify_file(path: &Path, len: u64, run: &BackupRun, report: &mut VerificationReport) {
    report.actual_size_bytes = len;
    report.actual_file_count = 1;
    report.structure_valid = true;

    match check_readable(path) {
        Ok(()) => report.readable = true,
        Err(e) => report
            .errors
            .push(format!("artifact not readable: {}: {}", path.display(), e)),
    }

    report.size_match = size_within_tolerance(len, run.size_mb);
    if !report.size_match {
        report.errors.push(format!(
            "size mismatch: recorded {:.2} MB, found {} bytes",
            run.size_mb, len
        ));
    }
    report.file_count_match = run.file_count == 1;
    if !report.file_count_match {
        report.errors.push(format!(
            "file count mismatch: recorded {}, single-file artifact",
            run.file_count
        ));
    }
}

fn verify_directory(path: &Path, run: &BackupRun, report: &mut VerificationReport) {
    if let Err(e) = fs::read_dir(path) {
        report
            .errors
            .push(format!("artifact directory not readable: {}: {}", path.display(), e));
        return;
    }
    report.readable = true;

    let mut total_bytes = 0u64;
    let mut file_count = 0u64;
    let mut walk_failed = false;

    for entry in WalkDir::new(path) {
        match entry {
            Ok(entry) if entry.file_type().is_file() => match entry.metadata() {
                Ok(metadata) => {
                    file_count += 1;
                    total_bytes += metadata.len();
                }
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "Skipping unreadable file");
                    report
                        .errors
                        .push(format!("skipped unreadable file {}: {}", entry.path().display(), e));
                }
            },
            Ok(_) => {}
            Err(e) if e.depth() == 0 => {
                report
                    .errors
                    .push(format!("walk of {} failed: {}", path.display(), e));
                walk_failed = true;
                break;
            }
            Err(e) => {
                let location = e
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| path.display().to_string());
                warn!(path = %location, error = %e, "Skipping unreadable entry");
                report
                    .errors
                    .push(format!("skipped unreadable entry {}: {}", location, e));
            }
        }
    }

    report.structure_valid = !walk_failed;
    report.actual_size_bytes = total_bytes;
    report.actual_file_count = file_count;

    report.size_match = size_within_tolerance(total_bytes, run.size_mb);
    if !report.size_match {
        report.errors.push(format!(
            "size mismatch: recorded {:.2} MB, found {} bytes",
            run.size_mb, total_bytes
        ));
    }
    report.file_count_match = file_count == run.file_count;
    if !report.file_count_match {
        report.errors.push(format!(
            "file count mismatch: recorded {}, found {}",
            run.file_count, file_count
        ));
    }

    for sample in sample_files(path, SAMPLE_LIMIT, SAMPLE_MAX_DEPTH) {
        if let Err(e) = check_readable(&sample) {
            report
                .errors
                .push(format!("sampled file not readable: {}: {}", sample.display(), e));
        }
        report.sampled_files.push(sample);
    }
}

/// Up to `limit` regular files, breadth-first, no deeper than `max_depth`
fn sample_files(root: &Path, limit: usize, max_depth: usize) -> Vec<PathBuf> {
    let mut samples = Vec::new();
    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);

    while let Some((dir, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let mut entries: Vec<_> = match fs::read_dir(&dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).collect(),
            Err(_) => continue,
        };
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let Ok(file_type) = entry.file_type() else { continue };
            if file_type.is_file() {
                samples.push(entry.path());
                if samples.len() == limit {
                    return samples;
                }
            } else if file_type.is_dir() {
                queue.push_back((entry.path(), depth + 1));
            }
        }
    }
    samples
}

/// Open and read one byte
pub(crate) fn check_readable(path: &Path) -> io::Result<()> {
    let mut file = File::open(path)?;
    let mut buf = [0u8; 1];
    file.read(&mut buf).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_tolerance_boundaries() {
        assert!(size_within_tolerance(100 * MIB, 100.0));
        assert!(size_within_tolerance(100 * MIB + MIB - 1, 100.0));
        assert!(!size_within_tolerance(100 * MIB + MIB, 100.0));
        assert!(!size_within_tolerance(0, 1.0));
    }

    #[test]
    fn test_sample_is_breadth_first_and_depth_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("a/b/c")).unwrap();
        fs::write(root.join("a/b/c/deep.txt"), b"x").unwrap();
        fs::write(root.join("a/b/level3.txt"), b"x").unwrap();
        fs::write(root.join("a/level2.txt"), b"x").unwrap();
        fs::write(root.join("top.txt"), b"x").unwrap();

        let samples = sample_files(root, 5, 3);
        assert_eq!(
            samples,
            vec![
                root.join("top.txt"),
                root.join("a/level2.txt"),
                root.join("a/b/level3.txt"),
            ]
        );
    }

    proptest! {
        #[test]
        fn prop_tolerance_matches_definition(actual in 0u64..(4 * MIB), recorded in 0u32..4) {
            let expected = recorded as i64 * MIB as i64;
            let within = (actual as i64 - expected).abs() < MIB as i64;
            prop_assert_eq!(size_within_tolerance(actual, recorded as f64), within);
        }
    }
}
