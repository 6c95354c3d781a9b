//! Text rendering for printing
//!
//! Text jobs are not printed raw: the content is wrapped in a banner document
//! written to a temp file, and that file is handed to the text strategy.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Local};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::StrategyFailure;
use super::strategy::{ExternalCommandStrategy, PrintStrategy};
use super::PrintJob;

const RULE_WIDTH: usize = 60;

/// Build the printable banner document for a text job
pub fn render_document(job: &PrintJob, processed: DateTime<Local>) -> String {
    let content = job.content.as_deref().unwrap_or_default();
    let rule = "=".repeat(RULE_WIDTH);
    [
        "FILE WATCHER PRINT JOB".to_string(),
        rule.clone(),
        format!("File: {}", job.file_name),
        format!("Original Path: {}", job.file_path.display()),
        format!("Processed: {}", processed.format("%Y-%m-%d %H:%M:%S")),
        format!("Size: {} characters", content.chars().count()),
        rule.clone(),
        String::new(),
        content.to_string(),
        String::new(),
        rule,
        "End of Document".to_string(),
        String::new(),
    ]
    .join("\n")
}

/// A rendered temp file, removed on drop unless handed to delayed cleanup
#[derive(Debug)]
struct Rendering {
    path: Option<PathBuf>,
}

impl Rendering {
    fn write(dir: &Path, document: &str) -> Result<Self, StrategyFailure> {
        fs::create_dir_all(dir).map_err(|err| StrategyFailure::Render(err.to_string()))?;
        let path = dir.join(format!("filewatch_{}.txt", Uuid::new_v4().simple()));
        fs::write(&path, document).map_err(|err| StrategyFailure::Render(err.to_string()))?;
        debug!("Created temp file: {}", path.display());
        Ok(Self { path: Some(path) })
    }

    fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Keep the file around for `delay`, then remove it best-effort
    fn release_after(mut self, delay: Duration) {
        let Some(path) = self.path.take() else { return };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!("Cleaned up temp file: {}", path.display()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Could not clean up temp file {}: {}", path.display(), err),
            }
        });
    }
}

impl Drop for Rendering {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = fs::remove_file(path);
        }
    }
}

/// Renders text jobs to a temp file and prints that file
#[derive(Debug, Clone)]
pub struct TextRenderStrategy {
    inner: ExternalCommandStrategy,
    temp_dir: PathBuf,
    cleanup_delay: Duration,
}

impl TextRenderStrategy {
    pub fn new(inner: ExternalCommandStrategy, temp_dir: PathBuf, cleanup_delay: Duration) -> Self {
        Self { inner, temp_dir, cleanup_delay }
    }
}

#[async_trait]
impl PrintStrategy for TextRenderStrategy {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn timeout(&self) -> Duration {
        self.inner.timeout()
    }

    async fn attempt(&self, job: &PrintJob) -> Result<(), StrategyFailure> {
        info!("Printing text content: {}", job.file_name);
        let rendering = Rendering::write(&self.temp_dir, &render_document(job, Local::now()))?;
        self.inner.run_on(rendering.path()).await?;
        rendering.release_after(self.cleanup_delay);
        Ok(())
    }
}
