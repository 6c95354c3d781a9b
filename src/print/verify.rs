//! Diagnostic printer checks
//!
//! Nothing here can change a job's outcome; results are only logged.

use std::path::PathBuf;
use std::time::Duration;
use async_trait::async_trait;
use tracing::{info, warn};

use super::strategy::run_command;
use super::PrintJob;

#[async_trait]
pub trait PrintVerifier: Send + Sync {
    /// Runs before an original-format job is attempted
    async fn preflight(&self, _job: &PrintJob) {}

    /// Runs after a strategy reported success
    async fn confirm(&self, _job: &PrintJob) {}
}

/// A diagnostic command and its arguments
#[derive(Debug, Clone)]
pub struct ProbeCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProbeCommand {
    pub fn new<I, S>(program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Checks printer availability and the spool queue through external commands
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    availability: Option<ProbeCommand>,
    queue: Option<ProbeCommand>,
    timeout: Duration,
}

impl CommandVerifier {
    pub fn new(availability: Option<ProbeCommand>, queue: Option<ProbeCommand>) -> Self {
        Self { availability, queue, timeout: Duration::from_secs(5) }
    }

    /// The platform's printer status and print queue commands
    pub fn platform_default(printer: Option<&str>) -> Self {
        #[cfg(windows)]
        {
            let filter = printer
                .map(|name| format!(" | Where-Object {{$_.Name -like '*{}*'}}", name))
                .unwrap_or_default();
            Self::new(
                Some(ProbeCommand::new(
                    "powershell",
                    [
                        "-NoProfile".to_string(),
                        "-Command".to_string(),
                        format!("Get-WmiObject -Class Win32_Printer{} | Select-Object Name, PrinterStatus, WorkOffline, Default", filter),
                    ],
                )),
                Some(ProbeCommand::new(
                    "powershell",
                    [
                        "-NoProfile".to_string(),
                        "-Command".to_string(),
                        format!("Get-WmiObject -Class Win32_PrintJob{} | Select-Object Name, Document, JobStatus | Format-List", filter),
                    ],
                )),
            )
        }
        #[cfg(not(windows))]
        {
            let mut status = vec!["-p".to_string()];
            let mut queue = vec!["-o".to_string()];
            if let Some(name) = printer {
                status.push(name.to_string());
                queue.push(name.to_string());
            }
            Self::new(
                Some(ProbeCommand::new("lpstat", status)),
                Some(ProbeCommand::new("lpstat", queue)),
            )
        }
    }

    async fn probe(&self, command: &ProbeCommand) -> Result<String, String> {
        match tokio::time::timeout(self.timeout, run_command(&command.program, &command.args)).await {
            Ok(Ok(output)) if output.status.success() => {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            }
            Ok(Ok(output)) => Err(String::from_utf8_lossy(&output.stderr).trim().to_string()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("no answer within {}s", self.timeout.as_secs())),
        }
    }
}

#[async_trait]
impl PrintVerifier for CommandVerifier {
    async fn preflight(&self, job: &PrintJob) {
        let Some(command) = &self.availability else { return };
        match self.probe(command).await {
            Ok(status) if status.is_empty() => warn!("Printer not found before printing {}", job.file_name),
            Ok(status) => info!("Printer info:\n{}", status),
            Err(err) => warn!("Could not check printer: {}", err),
        }
    }

    async fn confirm(&self, job: &PrintJob) {
        let Some(command) = &self.queue else { return };
        match self.probe(command).await {
            Ok(queue) if queue.is_empty() => {
                info!("Printer queue is empty (job for {} may have completed quickly)", job.file_name)
            }
            Ok(queue) => info!("Printer queue contains:\n{}", queue),
            Err(err) => warn!("Could not check printer queue: {}", err),
        }
    }
}
