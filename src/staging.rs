use crate::archive::write_archive_excluding;
use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use sha1::{Digest, Sha1};
use std::fmt::Display;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const STAGED_PREFIX: &str = "tmp_";
const STAGED_SUFFIX: &str = ".tar.gz";
const TIMESTAMP_FORMAT: &str = "%d-%m-%Y_%H:%M:%S";

/// A fully written archive waiting for upload.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    pub path: PathBuf,
    pub size: u64,
    /// Hex SHA-1 of the staged bytes.
    pub sha1: String,
}

impl StagedArtifact {
    pub fn file_name(&self) -> Result<&str> {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .context("Invalid staged archive name")
    }

    pub async fn open(&self) -> Result<tokio::fs::File> {
        tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Cannot open backup archive: {}", self.path.display()))
    }

    pub fn remove(&self) -> Result<()> {
        fs::remove_file(&self.path)
            .with_context(|| format!("Failed to delete staged archive: {}", self.path.display()))
    }
}

/// `dir/tmp_<tag><DD-MM-YYYY_HH:MM:SS>.tar.gz`. No separator is inserted
/// between tag and timestamp.
pub fn staged_file_name<Tz>(dir: &Path, tag: &str, at: &DateTime<Tz>) -> PathBuf
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    dir.join(format!(
        "{}{}{}{}",
        STAGED_PREFIX,
        tag,
        at.format(TIMESTAMP_FORMAT),
        STAGED_SUFFIX
    ))
}

/// Writes the archive of `src` into a new staged file under `dir`.
pub fn stage_archive<Tz>(
    src: &Path,
    dir: &Path,
    tag: &str,
    at: &DateTime<Tz>,
) -> Result<StagedArtifact>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let path = staged_file_name(dir, tag, at);
    info!("Creating backup archive: {}", path.display());

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .with_context(|| format!("Could not create file: {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha1::new();

    // The staged file may sit inside `src` (both default to the working dir).
    let stats = write_archive_excluding(
        src,
        std::slice::from_ref(&path),
        vec![&mut writer as &mut dyn Write, &mut hasher],
    )
    .with_context(|| format!("Error writing to file: {}", path.display()))?;

    let file = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("Failed to flush staged archive: {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync staged archive: {}", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("Failed to stat staged archive: {}", path.display()))?
        .len();
    drop(file);

    let sha1 = format!("{:x}", hasher.finalize());
    info!(
        "Archived {} files ({} bytes) into {} ({} bytes, sha1 {})",
        stats.files,
        stats.bytes,
        path.display(),
        size,
        sha1
    );

    Ok(StagedArtifact { path, size, sha1 })
}
