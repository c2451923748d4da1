mod common;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_backup::model::{ArtifactFormat, BackupRun, BackupType, RunStatus, Trigger};
use fleet_backup::restore::{ArchiveExtractor, Extraction, ExtractionError, RestoreEngine};
use fleet_backup::OrchestratorError;
use pretty_assertions::assert_eq;

use common::{tar_gz, ARCHIVE_FILES};

/// Claims ten files but only writes nine of them
struct ShortExtractor;

#[async_trait]
impl ArchiveExtractor for ShortExtractor {
    fn name(&self) -> &'static str {
        "short"
    }

    async fn extract(&self, _archive: &Path, destination: &Path) -> Result<Extraction, ExtractionError> {
        let entries: Vec<String> = (0..10).map(|i| format!("data/file-{:02}.txt", i)).collect();
        tokio::fs::create_dir_all(destination.join("data")).await?;
        for entry in entries.iter().filter(|e| e.as_str() != "data/file-07.txt") {
            tokio::fs::write(destination.join(entry), b"payload").await?;
        }
        Ok(Extraction {
            entries,
            bytes_written: None,
        })
    }
}

struct BrokenExtractor;

#[async_trait]
impl ArchiveExtractor for BrokenExtractor {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn extract(&self, _archive: &Path, _destination: &Path) -> Result<Extraction, ExtractionError> {
        Err(ExtractionError::ToolFailed {
            program: "tar".to_string(),
            status: 2,
            stderr: "gzip: stdin: unexpected end of file".to_string(),
        })
    }
}

fn completed_run(artifact: &Path, format: ArtifactFormat) -> BackupRun {
    let mut run = BackupRun::new("web-01", BackupType::Full, Trigger::Manual("admin".to_string()));
    run.status = RunStatus::Completed;
    run.artifact_path = Some(artifact.to_path_buf());
    run.artifact_format = Some(format);
    run.file_count = 1;
    run
}

fn write_archive(dir: &Path) -> std::path::PathBuf {
    let archive = dir.join("run.tar.gz");
    std::fs::write(&archive, tar_gz(ARCHIVE_FILES)).unwrap();
    archive
}

#[tokio::test]
async fn test_missing_file_after_restore_fails_the_restore() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());
    let destination = dir.path().join("restored");
    let engine = RestoreEngine::new(Arc::new(ShortExtractor));

    let result = engine
        .restore(&completed_run(&archive, ArtifactFormat::TarGz), &destination, true)
        .await
        .unwrap();

    assert!(!result.success);
    assert_eq!(result.extracted_files.len(), 10);
    let verification = result.verification.unwrap();
    assert_eq!(verification.missing_files, vec!["data/file-07.txt".to_string()]);
    assert!(verification.corrupted_files.is_empty());
    assert_eq!(verification.verified_files, 9);
    assert_eq!(result.errors, vec!["missing after restore: data/file-07.txt".to_string()]);
}

#[tokio::test]
async fn test_without_verification_listing_is_trusted() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());
    let engine = RestoreEngine::new(Arc::new(ShortExtractor));

    let result = engine
        .restore(&completed_run(&archive, ArtifactFormat::TarGz), &dir.path().join("out"), false)
        .await
        .unwrap();

    assert!(result.success);
    assert!(result.verification.is_none());
    assert_eq!(result.stats.file_count, 10);
}

#[tokio::test]
async fn test_bundled_extractor_restores_archive_contents() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());
    let destination = dir.path().join("restored");

    let result = RestoreEngine::bundled()
        .restore(&completed_run(&archive, ArtifactFormat::TarGz), &destination, true)
        .await
        .unwrap();

    assert!(result.success, "errors: {:?}", result.errors);
    let mut extracted = result.extracted_files.clone();
    extracted.sort();
    assert_eq!(
        extracted,
        vec![
            "etc/hostname".to_string(),
            "etc/hosts".to_string(),
            "home/alice/notes.txt".to_string(),
        ]
    );
    let expected_bytes: u64 = ARCHIVE_FILES.iter().map(|(_, data)| data.len() as u64).sum();
    assert_eq!(result.stats.total_bytes, expected_bytes);
    assert_eq!(
        std::fs::read(destination.join("etc/hosts")).unwrap(),
        b"127.0.0.1 localhost\n".to_vec()
    );
    assert!(result.verification.unwrap().is_clean());
}

#[tokio::test]
async fn test_extraction_failure_is_reported_in_result() {
    let dir = tempfile::tempdir().unwrap();
    let archive = write_archive(dir.path());
    let engine = RestoreEngine::new(Arc::new(BrokenExtractor));

    let result = engine
        .restore(&completed_run(&archive, ArtifactFormat::TarGz), &dir.path().join("out"), true)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.extracted_files.is_empty());
    assert_eq!(
        result.errors,
        vec!["tar exited with status 2: gzip: stdin: unexpected end of file".to_string()]
    );
}

#[tokio::test]
async fn test_bundled_extractor_rejects_non_gzip_input() {
    let dir = tempfile::tempdir().unwrap();
    let archive = dir.path().join("run.tar.gz");
    std::fs::write(&archive, b"definitely not gzip").unwrap();

    let result = RestoreEngine::bundled()
        .restore(&completed_run(&archive, ArtifactFormat::TarGz), &dir.path().join("out"), false)
        .await
        .unwrap();

    assert!(!result.success);
    assert!(result.errors[0].contains("is not a gzip-compressed archive"));
}

#[tokio::test]
async fn test_unsupported_format_leaves_destination_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let artifact = dir.path().join("run-dir");
    std::fs::create_dir_all(&artifact).unwrap();
    let destination = dir.path().join("never-created");

    let err = RestoreEngine::bundled()
        .restore(&completed_run(&artifact, ArtifactFormat::Directory), &destination, true)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::UnsupportedFormat(_)));
    assert!(!destination.exists());
}

#[tokio::test]
async fn test_failed_run_cannot_be_restored() {
    let dir = tempfile::tempdir().unwrap();
    let mut run = BackupRun::new("web-01", BackupType::Full, Trigger::Manual("admin".to_string()));
    run.status = RunStatus::Failed;

    let err = RestoreEngine::bundled()
        .restore(&run, &dir.path().join("out"), true)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidRunState(_)));

    let archive = write_archive(dir.path());
    let err = RestoreEngine::bundled()
        .restore(&completed_run(&archive, ArtifactFormat::TarGz), Path::new(""), true)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Configuration(_)));
}
