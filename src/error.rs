//! Error types for the watch, print and archive pipeline
//!
//! Only [`ConfigError`] and [`InitError`] are allowed to stop the service.
//! Everything else is contained at the file or job level and logged.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::print::DocumentKind;

/// Failures while assembling the service configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Failures that prevent the watcher from starting at all
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to create watch directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read watch directory {path}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("watch path is not a directory: {0}")]
    NotADirectory(PathBuf),

    #[error("move folder {0} is the watch folder")]
    ArchiveIsWatchDir(PathBuf),

    #[error("failed to subscribe to {path}: {source}")]
    Subscribe {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// Errors reported by the directory watch subscription itself
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch subscription failed: {0}")]
    Subscription(#[from] notify::Error),

    #[error("watch directory unavailable: {0}")]
    Directory(#[from] InitError),
}

/// Why a file could not be read for classification.
///
/// Never propagated: the classifier renders it into the `skip` description.
#[derive(Debug, Error)]
pub enum ClassificationError {
    #[error("Error reading file metadata: {0}")]
    Stat(#[source] io::Error),

    #[error("Error reading text file: {0}")]
    Read(#[source] io::Error),

    #[error("Error reading text file: content is not valid UTF-8 ({0})")]
    Decode(#[source] std::string::FromUtf8Error),
}

/// One print mechanism failed; the chain moves on to the next one
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrategyFailure {
    #[error("{tool} not found")]
    ToolNotFound { tool: String },

    #[error("timeout after {}s", .after.as_secs_f32())]
    TimedOut { after: Duration },

    #[error("command exited with {code}: {stderr}")]
    NonZeroExit { code: String, stderr: String },

    #[error("Access is denied: {0}")]
    PermissionDenied(String),

    #[error("No application is associated with this file: {0}")]
    NoAssociation(String),

    #[error("{0}")]
    Rejected(String),

    #[error("failed to launch command: {0}")]
    Spawn(String),

    #[error("failed to render print document: {0}")]
    Render(String),
}

impl StrategyFailure {
    /// Classify a non-zero exit by the signature of its error output
    pub fn from_exit(code: Option<i32>, stderr: &str) -> Self {
        let stderr = stderr.trim().to_string();
        if stderr.contains("Access is denied") || stderr.contains("Permission denied") {
            return Self::PermissionDenied(stderr);
        }
        if stderr.contains("No application is associated") {
            return Self::NoAssociation(stderr);
        }
        let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
        Self::NonZeroExit { code, stderr }
    }

    /// Classify a failure to launch the external command
    pub fn from_spawn(tool: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::ToolNotFound { tool: tool.to_string() },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(err.to_string()),
            _ => Self::Spawn(err.to_string()),
        }
    }

    /// Remediation hints for this failure signature
    pub fn hints(&self) -> &'static [&'static str] {
        match self {
            Self::ToolNotFound { .. } => &[
                "Install Adobe Reader or SumatraPDF for better PDF printing support",
                "Download SumatraPDF: https://www.sumatrapdfreader.org/download-free-pdf-viewer.html",
                "Download PDFtoPrinter: https://github.com/mhitza/PDFtoPrinter",
                "On Linux and macOS make sure CUPS (lp/lpr) is installed",
            ],
            Self::TimedOut { .. } => &["Print operation timed out - printer might be slow or offline"],
            Self::PermissionDenied(_) => &["Permission denied - try running the service as administrator"],
            Self::NoAssociation(_) => &[
                "PDF file association issue - try reinstalling a PDF reader or setting a default PDF viewer",
                "Run: assoc .pdf=AcroExch.Document.DC (in an admin command prompt)",
            ],
            _ => &[],
        }
    }
}

/// A single failed strategy attempt, kept for the job's failure report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub failure: StrategyFailure,
}

/// A print job resolved as failed
#[derive(Debug, Error)]
pub enum PrintJobFailure {
    #[error("file not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("no print strategies registered for {0} documents")]
    NoStrategies(DocumentKind),

    #[error("all {} print methods failed; last error: {last}", .attempts.len())]
    Exhausted {
        attempts: Vec<StrategyAttempt>,
        last: StrategyFailure,
    },

    #[error("print worker dropped the job before resolving it")]
    WorkerGone,
}

impl PrintJobFailure {
    pub fn hints(&self) -> &'static [&'static str] {
        match self {
            Self::Exhausted { last, .. } => last.hints(),
            _ => &[],
        }
    }
}

/// Failures while relocating a processed file into the archive
#[derive(Debug, Error)]
pub enum MoveError {
    #[error("failed to create archive directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to move file after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to move file: {0}")]
    Io(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_signatures() {
        assert!(matches!(
            StrategyFailure::from_exit(Some(1), "Access is denied.\r\n"),
            StrategyFailure::PermissionDenied(_)
        ));
        assert!(matches!(
            StrategyFailure::from_exit(Some(1), "No application is associated with the specified file"),
            StrategyFailure::NoAssociation(_)
        ));

        let failure = StrategyFailure::from_exit(None, "boom");
        assert_eq!(
            failure,
            StrategyFailure::NonZeroExit { code: "signal".to_string(), stderr: "boom".to_string() }
        );
        assert!(failure.hints().is_empty());
    }

    #[test]
    fn test_spawn_not_found_is_missing_tool() {
        let err = io::Error::new(io::ErrorKind::NotFound, "no such file");
        let failure = StrategyFailure::from_spawn("SumatraPDF", &err);
        assert_eq!(failure, StrategyFailure::ToolNotFound { tool: "SumatraPDF".to_string() });
        assert!(!failure.hints().is_empty());
    }

    #[test]
    fn test_exhausted_message_counts_attempts() {
        let last = StrategyFailure::TimedOut { after: Duration::from_secs(2) };
        let failure = PrintJobFailure::Exhausted {
            attempts: vec![
                StrategyAttempt { strategy: "a".into(), failure: StrategyFailure::Rejected("x".into()) },
                StrategyAttempt { strategy: "b".into(), failure: last.clone() },
            ],
            last,
        };
        assert_eq!(failure.to_string(), "all 2 print methods failed; last error: timeout after 2s");
        assert_eq!(failure.hints().len(), 1);
    }
}
