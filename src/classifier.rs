//! File classification
//!
//! Decides how a newly arrived file is printed and produces a bounded,
//! displayable representation of its content for the audit log.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use regex::Regex;
use serde::Serialize;
use tokio::task::spawn_blocking;

use crate::error::ClassificationError;
use crate::print::{PrintJob, PrintType};

/// Extensions printed in their original format, never read into memory
pub const ORIGINAL_EXTENSIONS: &[&str] = &["docx", "doc", "pdf", "xls", "xlsx", "ppt", "pptx"];

/// Extensions always treated as text
pub const TEXT_EXTENSIONS: &[&str] = &["txt", "log", "json", "xml", "csv", "html", "css", "js"];

/// Characters of content shown in the log
pub const DISPLAY_LIMIT: usize = 2000;

const TRUNCATION_NOTE: &str = "\n[... content truncated for display ...]";

/// Result of classifying one file
#[derive(Debug, Clone, Serialize)]
pub struct Classification {
    pub print_type: PrintType,
    /// Full decoded text, or a synthesized summary for originals and skips
    pub content: String,
    pub size_bytes: u64,
    /// Lowercased extension without the dot
    pub extension: Option<String>,
}

impl Classification {
    fn skip(content: String, size_bytes: u64, extension: Option<String>) -> Self {
        Self { print_type: PrintType::Skip, content, size_bytes, extension }
    }

    /// Content cut to [`DISPLAY_LIMIT`] characters for logging
    pub fn display_excerpt(&self) -> Cow<'_, str> {
        match self.content.char_indices().nth(DISPLAY_LIMIT) {
            Some((cut, _)) => Cow::Owned(format!("{}{}", &self.content[..cut], TRUNCATION_NOTE)),
            None => Cow::Borrowed(&self.content),
        }
    }

    /// The print job for this file, unless it is skipped
    pub fn into_print_job(self, file_path: &Path, file_name: &str) -> Option<PrintJob> {
        match self.print_type {
            PrintType::Text => Some(PrintJob::text(file_path, file_name, self.content)),
            PrintType::Original => Some(PrintJob::original(file_path, file_name)),
            PrintType::Skip => None,
        }
    }
}

/// Stateless classifier; never fails, degrading to [`PrintType::Skip`]
#[derive(Debug, Clone, Copy, Default)]
pub struct FileClassifier;

impl FileClassifier {
    pub fn new() -> Self {
        Self
    }

    /// [`classify`](Self::classify) on the blocking pool, since it may read
    /// the whole file
    pub async fn classify_blocking(&self, path: PathBuf) -> Classification {
        let classifier = *self;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        match spawn_blocking(move || classifier.classify(&path)).await {
            Ok(classification) => classification,
            Err(join_err) => Classification::skip(format!("[classification panicked: {join_err}]"), 0, extension),
        }
    }

    pub fn classify(&self, path: &Path) -> Classification {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase());
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        match extension.as_deref() {
            Some(ext) if ORIGINAL_EXTENSIONS.contains(&ext) => match file_size(path) {
                Ok(size) => Classification {
                    print_type: PrintType::Original,
                    content: format!(
                        "[{} Document]\nFile: {}\nSize: {} bytes\nThis document will be printed in its original format.",
                        ext.to_ascii_uppercase(),
                        file_name,
                        size
                    ),
                    size_bytes: size,
                    extension,
                },
                Err(err) => Classification::skip(format!("[{}]", err), 0, extension),
            },
            Some(ext) if TEXT_EXTENSIONS.contains(&ext) => match read_text(path) {
                Ok((content, size)) => Classification {
                    print_type: PrintType::Text,
                    content,
                    size_bytes: size,
                    extension,
                },
                Err(err) => {
                    let size = file_size(path).unwrap_or(0);
                    Classification::skip(format!("[{}]", err), size, extension)
                }
            },
            _ => classify_unknown(path, extension),
        }
    }
}

fn classify_unknown(path: &Path, extension: Option<String>) -> Classification {
    match read_text(path) {
        Ok((content, size)) if !looks_binary(&content) => Classification {
            print_type: PrintType::Text,
            content,
            size_bytes: size,
            extension,
        },
        _ => match file_size(path) {
            Ok(size) => {
                let shown = extension
                    .as_deref()
                    .map_or_else(|| "unknown".to_string(), |ext| format!(".{}", ext));
                Classification::skip(
                    format!(
                        "[Binary/Unknown file - {} bytes]\nFile type: {}\nUse a specialized application to view this file.",
                        size, shown
                    ),
                    size,
                    extension,
                )
            }
            Err(err) => Classification::skip(format!("[{}]", err), 0, extension),
        },
    }
}

fn file_size(path: &Path) -> Result<u64, ClassificationError> {
    fs::metadata(path)
        .map(|meta| meta.len())
        .map_err(ClassificationError::Stat)
}

/// Read the whole file as UTF-8, returning the text and its byte size
pub fn read_text(path: &Path) -> Result<(String, u64), ClassificationError> {
    let bytes = fs::read(path).map_err(ClassificationError::Read)?;
    let size = bytes.len() as u64;
    let content = String::from_utf8(bytes).map_err(ClassificationError::Decode)?;
    Ok((content, size))
}

/// Null bytes or a run of 10+ control/high-Latin characters mean binary
pub fn looks_binary(content: &str) -> bool {
    static BINARY_RUN: OnceLock<Regex> = OnceLock::new();
    let run = BINARY_RUN.get_or_init(|| {
        Regex::new(r"[\x00-\x08\x0E-\x1F\x7F-\xFF]{10,}").expect("binary run pattern is valid")
    });
    content.contains('\0') || run.is_match(content)
}
