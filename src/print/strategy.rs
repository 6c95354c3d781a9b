//! Print strategies
//!
//! A strategy is one external mechanism able to put a file on paper. Each is
//! stateless and shared read-only; the chain owns ordering and timeouts.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::StrategyConfig;
use crate::error::StrategyFailure;
use super::PrintJob;

const FILE_PLACEHOLDER: &str = "{file}";
const PRINTER_PLACEHOLDER: &str = "{printer}";

/// One way of sending a job to the printer
#[async_trait]
pub trait PrintStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Upper bound for a single attempt, enforced by the chain
    fn timeout(&self) -> Duration;

    async fn attempt(&self, job: &PrintJob) -> Result<(), StrategyFailure>;
}

/// Runs an external program against the job's file.
///
/// Candidates are probed in order: an entry with a directory component must
/// exist on disk, a bare command name is left to the OS search path. Each
/// argument variant is tried in turn until one succeeds.
#[derive(Debug, Clone)]
pub struct ExternalCommandStrategy {
    name: String,
    candidates: Vec<PathBuf>,
    variants: Vec<Vec<String>>,
    printer: Option<String>,
    timeout: Duration,
    success_marker: Option<String>,
    failure_markers: Vec<String>,
    settle_after: Duration,
}

impl ExternalCommandStrategy {
    pub fn new(name: impl Into<String>, candidates: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            candidates,
            variants: Vec::new(),
            printer: None,
            timeout: Duration::from_secs(30),
            success_marker: None,
            failure_markers: Vec::new(),
            settle_after: Duration::ZERO,
        }
    }

    pub fn from_config(config: &StrategyConfig, printer: Option<&str>) -> Self {
        let mut strategy = Self::new(
            config.name.clone(),
            config.candidates.iter().map(PathBuf::from).collect(),
        )
        .with_printer(printer.map(str::to_string))
        .with_timeout(Duration::from_secs(config.timeout_secs))
        .with_failure_markers(config.failure_markers.clone())
        .with_settle_after(Duration::from_millis(config.settle_after_ms));
        strategy.variants = config.variants.clone();
        strategy.success_marker = config.success_marker.clone();
        strategy
    }

    pub fn with_variant<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variants.push(args.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_printer(mut self, printer: Option<String>) -> Self {
        self.printer = printer;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_success_marker(mut self, marker: impl Into<String>) -> Self {
        self.success_marker = Some(marker.into());
        self
    }

    pub fn with_failure_markers(mut self, markers: Vec<String>) -> Self {
        self.failure_markers = markers;
        self
    }

    pub fn with_settle_after(mut self, pause: Duration) -> Self {
        self.settle_after = pause;
        self
    }

    /// Candidates worth spawning, in order. Bare names are resolved through
    /// `PATH` only when spawned.
    pub fn usable_candidates(&self) -> Vec<PathBuf> {
        self.candidates
            .iter()
            .filter(|candidate| {
                let is_bare = candidate.components().count() == 1 && !candidate.is_absolute();
                is_bare || candidate.is_file()
            })
            .cloned()
            .collect()
    }

    /// Argument lists usable with the current printer setting
    fn usable_variants(&self, target: &Path) -> Vec<Vec<String>> {
        let file = target.to_string_lossy();
        self.variants
            .iter()
            .filter(|args| self.printer.is_some() || !args.iter().any(|a| a.contains(PRINTER_PLACEHOLDER)))
            .map(|args| {
                args.iter()
                    .map(|arg| {
                        let arg = arg.replace(FILE_PLACEHOLDER, &file);
                        match &self.printer {
                            Some(printer) => arg.replace(PRINTER_PLACEHOLDER, printer),
                            None => arg,
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Print `target`, which may differ from the job's own file
    pub async fn run_on(&self, target: &Path) -> Result<(), StrategyFailure> {
        let variants = self.usable_variants(target);
        if variants.is_empty() {
            return Err(StrategyFailure::Rejected(format!(
                "{} has no argument variant usable without a configured printer",
                self.name
            )));
        }

        for program in self.usable_candidates() {
            match self.run_program(&program, &variants).await {
                Err(StrategyFailure::ToolNotFound { .. }) => {
                    debug!("{} not runnable at {}, trying next candidate", self.name, program.display());
                }
                outcome => return outcome,
            }
        }
        Err(StrategyFailure::ToolNotFound { tool: self.name.clone() })
    }

    async fn run_program(&self, program: &Path, variants: &[Vec<String>]) -> Result<(), StrategyFailure> {
        debug!("Found {} at: {}", self.name, program.display());
        let total = variants.len();
        let mut last = None;
        for (index, args) in variants.iter().enumerate() {
            info!("Running {} ({}/{}): {} {}", self.name, index + 1, total, program.display(), args.join(" "));
            let failure = match run_command(program, args).await {
                Ok(output) => match self.check_output(&output) {
                    Ok(()) => {
                        if !self.settle_after.is_zero() {
                            tokio::time::sleep(self.settle_after).await;
                        }
                        return Ok(());
                    }
                    Err(failure) => failure,
                },
                Err(err) => StrategyFailure::from_spawn(&self.name, &err),
            };
            debug!("{} variant {} failed: {}", self.name, index + 1, failure);
            if matches!(failure, StrategyFailure::ToolNotFound { .. }) {
                return Err(failure);
            }
            last = Some(failure);
        }

        Err(last.unwrap_or_else(|| StrategyFailure::Rejected(format!("{} did not run", self.name))))
    }

    fn check_output(&self, output: &Output) -> Result<(), StrategyFailure> {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stdout.trim().is_empty() {
            debug!("{} output: {}", self.name, stdout.trim());
        }

        if !output.status.success() {
            return Err(StrategyFailure::from_exit(output.status.code(), &stderr));
        }

        if let Some(marker) = self.failure_markers.iter().find(|m| stderr.contains(m.as_str())) {
            return Err(StrategyFailure::Rejected(format!(
                "stderr reported '{}': {}",
                marker,
                stderr.trim()
            )));
        }

        if let Some(marker) = &self.success_marker {
            if !stdout.contains(marker.as_str()) {
                return Err(StrategyFailure::Rejected(format!("output did not confirm '{}'", marker)));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl PrintStrategy for ExternalCommandStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn attempt(&self, job: &PrintJob) -> Result<(), StrategyFailure> {
        self.run_on(&job.file_path).await
    }
}

/// Run a command to completion, killing it if the caller stops waiting
pub(crate) async fn run_command(program: &Path, args: &[String]) -> std::io::Result<Output> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn job_at(path: &str) -> PrintJob {
        PrintJob::original(path, "invoice.pdf")
    }

    #[tokio::test]
    async fn test_missing_absolute_candidates_mean_missing_tool() {
        let strategy = ExternalCommandStrategy::new(
            "SumatraPDF",
            vec![PathBuf::from("/nonexistent/a/SumatraPDF.exe"), PathBuf::from("/nonexistent/b/SumatraPDF.exe")],
        )
        .with_variant(["{file}"]);
        assert!(strategy.usable_candidates().is_empty());
        assert_eq!(
            strategy.attempt(&job_at("/w/a.pdf")).await,
            Err(StrategyFailure::ToolNotFound { tool: "SumatraPDF".to_string() })
        );
    }

    #[tokio::test]
    async fn test_uninstalled_bare_name_falls_through_to_next_candidate() {
        let strategy = ExternalCommandStrategy::new(
            "lp",
            vec![PathBuf::from("folderwatch-no-such-tool"), PathBuf::from("/nonexistent/lp"), PathBuf::from("true")],
        )
        .with_variant(["{file}"]);
        assert_eq!(
            strategy.usable_candidates(),
            vec![PathBuf::from("folderwatch-no-such-tool"), PathBuf::from("true")]
        );
        assert_eq!(strategy.attempt(&job_at("/w/a.pdf")).await, Ok(()));
    }

    #[test]
    fn test_printer_variants_are_skipped_without_printer() {
        let strategy = ExternalCommandStrategy::new("lp", vec![PathBuf::from("lp")])
            .with_variant(["-d", "{printer}", "{file}"])
            .with_variant(["{file}"]);
        assert_eq!(strategy.usable_variants(Path::new("/w/a.pdf")), vec![vec!["/w/a.pdf".to_string()]]);

        let strategy = strategy.with_printer(Some("Lobby".to_string()));
        let variants = strategy.usable_variants(Path::new("/w/a.pdf"));
        assert_eq!(variants[0], vec!["-d", "Lobby", "/w/a.pdf"]);
        assert_eq!(variants.len(), 2);
    }

    #[tokio::test]
    async fn test_successful_command() {
        let strategy = ExternalCommandStrategy::new("true", vec![PathBuf::from("true")]).with_variant(["{file}"]);
        assert_eq!(strategy.attempt(&job_at("/w/invoice.pdf")).await, Ok(()));
    }

    #[tokio::test]
    async fn test_falls_through_variants_until_success() {
        let strategy = ExternalCommandStrategy::new("sh", vec![PathBuf::from("sh")])
            .with_variant(["-c", "exit 3"])
            .with_variant(["-c", "echo queued"])
            .with_success_marker("queued");
        assert_eq!(strategy.attempt(&job_at("/w/invoice.pdf")).await, Ok(()));
    }

    #[tokio::test]
    async fn test_non_zero_exit_and_markers() {
        let strategy = ExternalCommandStrategy::new("sh", vec![PathBuf::from("sh")]).with_variant(["-c", "exit 3"]);
        assert!(matches!(
            strategy.attempt(&job_at("/w/a.pdf")).await,
            Err(StrategyFailure::NonZeroExit { ref code, .. }) if code == "3"
        ));

        let strategy = ExternalCommandStrategy::new("sh", vec![PathBuf::from("sh")])
            .with_variant(["-c", "echo 'Error: offline' >&2"])
            .with_failure_markers(vec!["Error".to_string()]);
        assert!(matches!(strategy.attempt(&job_at("/w/a.pdf")).await, Err(StrategyFailure::Rejected(_))));

        let strategy = ExternalCommandStrategy::new("sh", vec![PathBuf::from("sh")])
            .with_variant(["-c", "echo started"])
            .with_success_marker("Print job queued successfully");
        assert!(matches!(strategy.attempt(&job_at("/w/a.pdf")).await, Err(StrategyFailure::Rejected(_))));
    }

    #[tokio::test]
    async fn test_unknown_command_is_missing_tool() {
        let strategy = ExternalCommandStrategy::new("ghost", vec![PathBuf::from("folderwatch-no-such-tool")])
            .with_variant(["{file}"]);
        assert_eq!(
            strategy.attempt(&job_at("/w/a.pdf")).await,
            Err(StrategyFailure::ToolNotFound { tool: "ghost".to_string() })
        );
    }
}
