//! Sequential print queue
//!
//! Many producers, one worker. The worker is started on demand, attempts one
//! job at a time, observes a cooldown after every job and returns to idle once
//! the queue is empty.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PrintJobFailure;
use super::chain::{PrintSuccess, StrategyChain};
use super::PrintJob;

pub type PrintOutcome = Result<PrintSuccess, PrintJobFailure>;

/// Handle to a submitted job; resolves exactly once
#[derive(Debug)]
pub struct PrintTicket {
    job_id: Uuid,
    receiver: oneshot::Receiver<PrintOutcome>,
}

impl PrintTicket {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Wait until the job has been attempted
    pub async fn outcome(self) -> PrintOutcome {
        self.receiver
            .await
            .unwrap_or(Err(PrintJobFailure::WorkerGone))
    }
}

struct QueuedJob {
    job: PrintJob,
    respond_to: oneshot::Sender<PrintOutcome>,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    worker_active: bool,
}

struct QueueInner {
    chain: Arc<StrategyChain>,
    cooldown: Duration,
    state: Mutex<QueueState>,
}

impl QueueInner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// FIFO of print jobs drained by a single background worker
#[derive(Clone)]
pub struct PrintQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for PrintQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("PrintQueue")
            .field("pending", &state.pending.len())
            .field("worker_active", &state.worker_active)
            .field("cooldown", &self.inner.cooldown)
            .finish()
    }
}

impl PrintQueue {
    pub fn new(chain: Arc<StrategyChain>, cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                chain,
                cooldown,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Append a job and start the worker if it is idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, job: PrintJob) -> PrintTicket {
        let (respond_to, receiver) = oneshot::channel();
        let job_id = job.id;
        let file_name = job.file_name.clone();

        let start_worker = {
            let mut state = self.inner.lock();
            state.pending.push_back(QueuedJob { job, respond_to });
            info!("Added to print queue: {} (Queue length: {})", file_name, state.pending.len());
            !std::mem::replace(&mut state.worker_active, true)
        };

        if start_worker {
            tokio::spawn(drain(self.inner.clone()));
        }

        PrintTicket { job_id, receiver }
    }

    /// Submit a job and wait for its outcome
    pub async fn enqueue(&self, job: PrintJob) -> PrintOutcome {
        self.submit(job).outcome().await
    }

    /// Jobs waiting behind the one being attempted
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_idle(&self) -> bool {
        !self.inner.lock().worker_active
    }
}

async fn drain(inner: Arc<QueueInner>) {
    info!("Starting print queue processing...");

    loop {
        let next = {
            let mut state = inner.lock();
            match state.pending.pop_front() {
                Some(next) => {
                    info!("Processing print job: {} ({} remaining)", next.job.file_name, state.pending.len());
                    next
                }
                None => {
                    state.worker_active = false;
                    break;
                }
            }
        };

        let QueuedJob { job, respond_to } = next;
        let file_name = job.file_name.clone();
        let chain = inner.chain.clone();
        let outcome = match tokio::spawn(async move { chain.attempt(&job).await }).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!("Print job for {} aborted unexpectedly: {}", file_name, err);
                Err(PrintJobFailure::WorkerGone)
            }
        };

        match &outcome {
            Ok(success) => info!("Print job completed: {} via {}", file_name, success.strategy),
            Err(failure) => {
                error!("Print job failed for {}: {}", file_name, failure);
                for hint in failure.hints() {
                    warn!("Hint: {}", hint);
                }
            }
        }

        if respond_to.send(outcome).is_err() {
            debug!("Nobody is waiting on the print job for {}", file_name);
        }

        if !inner.cooldown.is_zero() {
            info!("Waiting between print jobs...");
            tokio::time::sleep(inner.cooldown).await;
        }
    }

    info!("Print queue processing completed");
}
