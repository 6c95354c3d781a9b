use std::fmt;
use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a classified file is handled by the printer stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrintType {
    /// Decoded text, printed through a rendered banner document
    Text,
    /// Office/PDF document, printed in its original format
    Original,
    /// Never printed, still archived
    Skip,
}

impl fmt::Display for PrintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrintType::Text => write!(f, "text"),
            PrintType::Original => write!(f, "original"),
            PrintType::Skip => write!(f, "skip"),
        }
    }
}

/// Which strategy list a job is routed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Text,
    Pdf,
    Document,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Text => write!(f, "text"),
            DocumentKind::Pdf => write!(f, "pdf"),
            DocumentKind::Document => write!(f, "document"),
        }
    }
}

/// A unit of work owned by the print queue until it resolves
#[derive(Debug, Clone)]
pub struct PrintJob {
    pub id: Uuid,
    pub file_path: PathBuf,
    pub file_name: String,
    /// Decoded text for text jobs, `None` for original-format documents
    pub content: Option<String>,
    pub print_type: PrintType,
}

impl PrintJob {
    pub fn text(file_path: impl Into<PathBuf>, file_name: impl Into<String>, content: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path: file_path.into(),
            file_name: file_name.into(),
            content: Some(content),
            print_type: PrintType::Text,
        }
    }

    pub fn original(file_path: impl Into<PathBuf>, file_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_path: file_path.into(),
            file_name: file_name.into(),
            content: None,
            print_type: PrintType::Original,
        }
    }

    pub fn document_kind(&self) -> DocumentKind {
        match self.print_type {
            PrintType::Original if has_extension(&self.file_path, "pdf") => DocumentKind::Pdf,
            PrintType::Original => DocumentKind::Document,
            _ => DocumentKind::Text,
        }
    }
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(wanted))
}
