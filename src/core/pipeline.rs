//! Per-file processing pipeline
//!
//! Arrivals are prepared (settled, classified, handed to the print queue) in
//! the order they were admitted, then settled (print outcome awaited, file
//! archived) in that same order. Preparing the next file does not wait for the
//! previous print job, so several jobs can be queued at once while the print
//! queue still executes them one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::archive::{ArchiveMover, MoveOutcome};
use crate::classifier::FileClassifier;
use crate::config::ServiceConfig;
use crate::print::{PrintQueue, PrintTicket, PrintType, StrategyChain};
use super::identity::{SeenRegistry, WatchedFile};

/// A newly admitted file waiting for its settle delay
#[derive(Debug, Clone)]
pub struct Arrival {
    pub path: PathBuf,
    pub identity: WatchedFile,
    pub detected_at: Instant,
}

impl Arrival {
    pub fn new(path: impl Into<PathBuf>, identity: WatchedFile) -> Self {
        Self {
            path: path.into(),
            identity,
            detected_at: Instant::now(),
        }
    }
}

/// How printing went for one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PrintStatus {
    Disabled,
    Skipped,
    Printed { strategy: String, attempts: usize },
    Failed { reason: String },
}

/// Audit record for a settled file
#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file_name: String,
    pub path: PathBuf,
    pub print_type: PrintType,
    pub size_bytes: u64,
    pub print: PrintStatus,
    pub archived_to: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_error: Option<String>,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug)]
enum PrintStage {
    Disabled,
    Skipped,
    Queued(PrintTicket),
}

/// A classified file whose print job, if any, has been submitted
#[derive(Debug)]
pub struct Prepared {
    path: PathBuf,
    identity: WatchedFile,
    print_type: PrintType,
    print: PrintStage,
}

impl Prepared {
    pub fn file_name(&self) -> &str {
        &self.identity.file_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn print_type(&self) -> PrintType {
        self.print_type
    }
}

/// Classification, print submission and archival for single files
#[derive(Debug)]
pub struct FileProcessor {
    classifier: FileClassifier,
    queue: Option<PrintQueue>,
    mover: ArchiveMover,
    seen: SeenRegistry,
    settle_delay: Duration,
}

impl FileProcessor {
    /// `queue` is `None` when printing is disabled
    pub fn new(
        classifier: FileClassifier,
        queue: Option<PrintQueue>,
        mover: ArchiveMover,
        seen: SeenRegistry,
        settle_delay: Duration,
    ) -> Self {
        Self { classifier, queue, mover, seen, settle_delay }
    }

    pub fn from_config(config: &ServiceConfig, chain: Arc<StrategyChain>, seen: SeenRegistry) -> Self {
        let timing = &config.timing;
        let queue = config
            .enable_printing
            .then(|| PrintQueue::new(chain, timing.cooldown()));
        let mover = ArchiveMover::new(
            config.archive_dir().map(Path::to_path_buf),
            timing.move_retry_attempts,
            timing.move_retry_backoff(),
        );
        Self::new(FileClassifier::new(), queue, mover, seen, timing.settle_delay())
    }

    pub fn queue(&self) -> Option<&PrintQueue> {
        self.queue.as_ref()
    }

    /// Wait out the settle delay, classify and submit the print job.
    ///
    /// `None` when the file vanished or turned out to be already handled.
    pub async fn prepare(&self, arrival: Arrival) -> Option<Prepared> {
        tokio::time::sleep_until(arrival.detected_at + self.settle_delay).await;

        let Arrival { path, identity, .. } = arrival;
        let Some(current) = WatchedFile::probe(&path) else {
            warn!("File disappeared before processing: {}", identity.file_name);
            return None;
        };

        let identity = if current == identity {
            identity
        } else if self.seen.admit(&current) {
            debug!("File changed while settling, processing current version: {}", current.file_name);
            current
        } else {
            debug!("Current version of {} is already handled", current.file_name);
            return None;
        };

        let classification = self.classifier.classify_blocking(path.clone()).await;
        let print_type = classification.print_type;

        info!("=== NEW FILE: {} ===", identity.file_name);
        info!("Path: {}", path.display());
        info!("Size: {} bytes", classification.size_bytes);
        info!("Type: {}", print_type);
        info!("Content:\n{}", classification.display_excerpt());

        let print = match &self.queue {
            None => {
                info!("Printing disabled, skipping print for: {}", identity.file_name);
                PrintStage::Disabled
            }
            Some(queue) => match classification.into_print_job(&path, &identity.file_name) {
                Some(job) => PrintStage::Queued(queue.submit(job)),
                None => {
                    info!("Not printing {} ({} file)", identity.file_name, print_type);
                    PrintStage::Skipped
                }
            },
        };

        Some(Prepared { path, identity, print_type, print })
    }

    /// Wait for the print outcome, then archive the file regardless of it
    pub async fn settle(&self, prepared: Prepared) -> FileReport {
        let Prepared { path, identity, print_type, print } = prepared;

        let print = match print {
            PrintStage::Disabled => PrintStatus::Disabled,
            PrintStage::Skipped => PrintStatus::Skipped,
            PrintStage::Queued(ticket) => match ticket.outcome().await {
                Ok(success) => PrintStatus::Printed {
                    strategy: success.strategy,
                    attempts: success.attempts,
                },
                Err(failure) => {
                    warn!("Printing failed for {}, archiving anyway", identity.file_name);
                    PrintStatus::Failed { reason: failure.to_string() }
                }
            },
        };

        let (archived_to, archive_error) = match self.mover.relocate(&path, &identity.file_name).await {
            MoveOutcome::Moved(destination) => (Some(destination), None),
            MoveOutcome::LeftInPlace(err) => (None, Some(err.to_string())),
            MoveOutcome::NotConfigured | MoveOutcome::SourceMissing => (None, None),
        };

        info!("Finished processing: {}", identity.file_name);
        FileReport {
            file_name: identity.file_name,
            path,
            print_type,
            size_bytes: identity.size_bytes,
            print,
            archived_to,
            archive_error,
            processed_at: Utc::now(),
        }
    }

    pub async fn process(&self, arrival: Arrival) -> Option<FileReport> {
        let prepared = self.prepare(arrival).await?;
        Some(self.settle(prepared).await)
    }
}

/// Background tasks driving a [`FileProcessor`]
#[derive(Debug)]
pub struct Pipeline {
    arrivals: mpsc::UnboundedSender<Arrival>,
    preparing: JoinHandle<()>,
    settling: JoinHandle<()>,
}

impl Pipeline {
    /// Start the pipeline; settled files are reported on `reports` if given
    pub fn spawn(processor: Arc<FileProcessor>, reports: Option<mpsc::UnboundedSender<FileReport>>) -> Self {
        let (arrivals, mut arrival_rx) = mpsc::unbounded_channel::<Arrival>();
        let (prepared_tx, mut prepared_rx) = mpsc::unbounded_channel::<Prepared>();

        let preparer = processor.clone();
        let preparing = tokio::spawn(async move {
            while let Some(arrival) = arrival_rx.recv().await {
                let file_name = arrival.identity.file_name.clone();
                let step = preparer.clone();
                // A panic while preparing one file must not stop the loop
                match tokio::spawn(async move { step.prepare(arrival).await }).await {
                    Ok(Some(prepared)) => {
                        if prepared_tx.send(prepared).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => error!("Error processing file {}: {}", file_name, err),
                }
            }
        });

        let settling = tokio::spawn(async move {
            while let Some(prepared) = prepared_rx.recv().await {
                let file_name = prepared.file_name().to_string();
                let step = processor.clone();
                match tokio::spawn(async move { step.settle(prepared).await }).await {
                    Ok(report) => {
                        if let Some(reports) = &reports {
                            let _ = reports.send(report);
                        }
                    }
                    Err(err) => error!("Error finishing file {}: {}", file_name, err),
                }
            }
        });

        Self { arrivals, preparing, settling }
    }

    /// Queue an admitted file; `false` once the pipeline has shut down
    pub fn submit(&self, arrival: Arrival) -> bool {
        self.arrivals.send(arrival).is_ok()
    }

    /// Stop accepting files and wait up to `grace` for in-flight ones.
    ///
    /// Returns `false` if the grace period ran out and work was abandoned.
    pub async fn shutdown(self, grace: Duration) -> bool {
        let Self { arrivals, mut preparing, mut settling } = self;
        drop(arrivals);

        let finished = tokio::time::timeout(grace, async {
            let _ = (&mut preparing).await;
            let _ = (&mut settling).await;
        })
        .await
        .is_ok();

        if !finished {
            preparing.abort();
            settling.abort();
        }
        finished
    }
}
