//! Archive extraction strategies and tool-output parsing

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("{} is not a gzip-compressed archive", .0.display())]
    NotGzip(PathBuf),

    #[error("archive read failed: {0}")]
    Archive(#[from] io::Error),

    #[error("extraction task failed: {0}")]
    Task(String),
}

/// What an extractor reports having written
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    /// Relative paths of extracted regular files
    pub entries: Vec<String>,
    /// Bytes written, when the extractor knows it
    pub bytes_written: Option<u64>,
}

/// Turns an extraction tool's textual output into relative paths
pub trait ListingParser: Send + Sync {
    fn parse(&self, stdout: &str, stderr: &str) -> Vec<String>;
}

/// Understands GNU tar (`path` per line on stdout) and bsdtar (`x path` on stderr)
#[derive(Debug, Clone, Copy, Default)]
pub struct TarListingParser;

impl ListingParser for TarListingParser {
    fn parse(&self, stdout: &str, stderr: &str) -> Vec<String> {
        let gnu = stdout.lines().filter_map(|line| normalize_entry(line.trim_end()));
        let bsd = stderr
            .lines()
            .filter_map(|line| line.strip_prefix("x "))
            .filter_map(|line| normalize_entry(line.trim_end()));
        gnu.chain(bsd).collect()
    }
}

fn normalize_entry(line: &str) -> Option<String> {
    if line.is_empty() || line.starts_with("tar:") || line.ends_with('/') {
        return None;
    }
    let entry = line.trim_start_matches("./");
    if entry.is_empty() || entry == "." {
        return None;
    }
    Some(entry.to_string())
}

#[async_trait]
pub trait ArchiveExtractor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(&self, archive: &Path, destination: &Path) -> Result<Extraction, ExtractionError>;
}

/// Runs the system `tar -xvzf <archive> -C <destination>`
pub struct TarCommandExtractor {
    program: String,
    parser: Arc<dyn ListingParser>,
}

impl TarCommandExtractor {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            parser: Arc::new(TarListingParser),
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn ListingParser>) -> Self {
        self.parser = parser;
        self
    }
}

impl Default for TarCommandExtractor {
    fn default() -> Self {
        Self::new("tar")
    }
}

#[async_trait]
impl ArchiveExtractor for TarCommandExtractor {
    fn name(&self) -> &'static str {
        "system-tar"
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> Result<Extraction, ExtractionError> {
        debug!(program = %self.program, archive = %archive.display(), "Running archive tool");
        let output = Command::new(&self.program)
            .arg("-xvzf")
            .arg(archive)
            .arg("-C")
            .arg(destination)
            .output()
            .await
            .map_err(|source| ExtractionError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(ExtractionError::ToolFailed {
                program: self.program.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        Ok(Extraction {
            entries: self.parser.parse(&stdout, &stderr),
            bytes_written: None,
        })
    }
}

/// In-process extraction with the `tar` and `flate2` crates
#[derive(Debug, Clone, Copy, Default)]
pub struct BundledTarExtractor;

#[async_trait]
impl ArchiveExtractor for BundledTarExtractor {
    fn name(&self) -> &'static str {
        "bundled-tar"
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> Result<Extraction, ExtractionError> {
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || unpack_tar_gz(&archive, &destination))
            .await
            .map_err(|e| ExtractionError::Task(e.to_string()))?
    }
}

fn unpack_tar_gz(archive: &Path, destination: &Path) -> Result<Extraction, ExtractionError> {
    let mut file = File::open(archive)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_err() || magic != GZIP_MAGIC {
        return Err(ExtractionError::NotGzip(archive.to_path_buf()));
    }
    file.seek(SeekFrom::Start(0))?;

    let mut tar = tar::Archive::new(GzDecoder::new(file));
    let mut entries = Vec::new();
    let mut bytes = 0u64;

    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let is_file = entry.header().entry_type().is_file();
        let size = entry.header().size()?;

        if !entry.unpack_in(destination)? {
            warn!(entry = %path.display(), "Skipping archive entry outside the destination");
            continue;
        }
        if is_file {
            if let Some(relative) = relative_entry(&path) {
                entries.push(relative);
                bytes += size;
            }
        }
    }

    Ok(Extraction {
        entries,
        bytes_written: Some(bytes),
    })
}

fn relative_entry(path: &Path) -> Option<String> {
    let parts: Vec<String> = path
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
