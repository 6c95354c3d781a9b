//! Archive relocation
//!
//! Moves processed files out of the watch directory. Name collisions get a
//! timestamp and counter suffix; busy or vanishing sources are retried a fixed
//! number of times. Failures never propagate: the file stays where it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::task::spawn_blocking;
use tracing::{error, info, warn};

use crate::error::MoveError;

#[cfg(unix)]
const BUSY_OS_CODES: &[i32] = &[16, 26]; // EBUSY, ETXTBSY
#[cfg(windows)]
const BUSY_OS_CODES: &[i32] = &[32, 33]; // sharing and lock violations
#[cfg(not(any(unix, windows)))]
const BUSY_OS_CODES: &[i32] = &[];

#[cfg(unix)]
const CROSS_DEVICE_OS_CODE: Option<i32> = Some(18); // EXDEV
#[cfg(windows)]
const CROSS_DEVICE_OS_CODE: Option<i32> = Some(17); // ERROR_NOT_SAME_DEVICE
#[cfg(not(any(unix, windows)))]
const CROSS_DEVICE_OS_CODE: Option<i32> = None;

/// Busy/locked files and sources that vanished mid-move are worth retrying
pub fn is_transient(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
        || err.raw_os_error().is_some_and(|code| BUSY_OS_CODES.contains(&code))
}

fn is_cross_device(err: &io::Error) -> bool {
    err.raw_os_error().is_some() && err.raw_os_error() == CROSS_DEVICE_OS_CODE
}

/// The filesystem operation behind a move.
///
/// Runs on the blocking pool; a cross-device copy may take a while.
pub trait Relocate: Send + Sync {
    fn relocate(&self, from: &Path, to: &Path) -> io::Result<()>;
}

/// Atomic rename, falling back to copy and remove across devices
#[derive(Debug, Clone, Copy, Default)]
pub struct FsRelocate;

impl Relocate for FsRelocate {
    fn relocate(&self, from: &Path, to: &Path) -> io::Result<()> {
        match fs::rename(from, to) {
            Err(err) if is_cross_device(&err) => {
                fs::copy(from, to)?;
                if let Err(err) = fs::remove_file(from) {
                    let _ = fs::remove_file(to);
                    return Err(err);
                }
                Ok(())
            }
            other => other,
        }
    }
}

/// What happened to a processed file
#[derive(Debug)]
pub enum MoveOutcome {
    Moved(PathBuf),
    /// No archive directory configured; the file stays in place
    NotConfigured,
    /// Already gone, e.g. relocated by someone else
    SourceMissing,
    LeftInPlace(MoveError),
}

impl MoveOutcome {
    pub fn destination(&self) -> Option<&Path> {
        match self {
            MoveOutcome::Moved(path) => Some(path),
            _ => None,
        }
    }
}

/// First free destination for `file_name` in `dir`.
///
/// An occupied name becomes `{stem}_{timestamp}_{counter}{.ext}`, the counter
/// starting at 1 and growing until the path is free.
pub fn resolve_destination(dir: &Path, file_name: &str, now: DateTime<Utc>) -> PathBuf {
    let mut candidate = dir.join(file_name);
    if !candidate.exists() {
        return candidate;
    }

    let name = Path::new(file_name);
    let stem = name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file_name.to_string());
    let ext = name
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let stamp = now.format("%Y-%m-%dT%H-%M-%S");

    let mut counter = 1u32;
    while candidate.exists() {
        candidate = dir.join(format!("{}_{}_{}{}", stem, stamp, counter, ext));
        counter += 1;
    }
    candidate
}

#[derive(Clone)]
pub struct ArchiveMover {
    archive_dir: Option<PathBuf>,
    max_attempts: u32,
    backoff: Duration,
    relocator: Arc<dyn Relocate>,
}

impl std::fmt::Debug for ArchiveMover {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveMover")
            .field("archive_dir", &self.archive_dir)
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl ArchiveMover {
    pub fn new(archive_dir: Option<PathBuf>, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            archive_dir,
            max_attempts: max_attempts.max(1),
            backoff,
            relocator: Arc::new(FsRelocate),
        }
    }

    pub fn with_relocator(mut self, relocator: Arc<dyn Relocate>) -> Self {
        self.relocator = relocator;
        self
    }

    pub fn archive_dir(&self) -> Option<&Path> {
        self.archive_dir.as_deref()
    }

    /// Move `source` into the archive directory under `file_name`
    pub async fn relocate(&self, source: &Path, file_name: &str) -> MoveOutcome {
        let Some(dir) = self.archive_dir.as_deref() else {
            info!("No move folder specified, keeping file in place: {}", file_name);
            return MoveOutcome::NotConfigured;
        };

        let outcome = self.relocate_into(dir, source, file_name).await;
        if let MoveOutcome::LeftInPlace(err) = &outcome {
            error!("Error moving file {}: {}", file_name, err);
            info!("File remains in watch folder: {}", source.display());
        }
        outcome
    }

    async fn relocate_blocking(&self, source: &Path, destination: &Path) -> io::Result<()> {
        let relocator = self.relocator.clone();
        let (from, to) = (source.to_path_buf(), destination.to_path_buf());
        spawn_blocking(move || relocator.relocate(&from, &to))
            .await
            .unwrap_or_else(|join_err| Err(io::Error::other(format!("move panicked: {join_err}"))))
    }

    async fn relocate_into(&self, dir: &Path, source: &Path, file_name: &str) -> MoveOutcome {
        if !source.exists() {
            warn!("Source file no longer exists: {}", file_name);
            return MoveOutcome::SourceMissing;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            if !dir.is_dir() {
                if let Err(err) = fs::create_dir_all(dir) {
                    return MoveOutcome::LeftInPlace(MoveError::CreateDir {
                        path: dir.to_path_buf(),
                        source: err,
                    });
                }
                info!("Created destination folder: {}", dir.display());
            }

            let destination = resolve_destination(dir, file_name, Utc::now());
            match self.relocate_blocking(source, &destination).await {
                Ok(()) => {
                    info!("Moved file to: {}", destination.display());
                    return MoveOutcome::Moved(destination);
                }
                Err(err) if is_transient(&err) => {
                    if !source.exists() {
                        warn!("Source file vanished during move: {}", file_name);
                        return MoveOutcome::SourceMissing;
                    }
                    if attempt >= self.max_attempts {
                        return MoveOutcome::LeftInPlace(MoveError::RetriesExhausted {
                            attempts: attempt,
                            source: err,
                        });
                    }
                    warn!("File busy, retrying move... ({}/{})", attempt, self.max_attempts);
                    tokio::time::sleep(self.backoff).await;
                }
                Err(err) => return MoveOutcome::LeftInPlace(MoveError::Io(err)),
            }
        }
    }
}
