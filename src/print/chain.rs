use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PrintConfig, TimingConfig};
use crate::error::{PrintJobFailure, StrategyAttempt, StrategyFailure};
use super::render::TextRenderStrategy;
use super::strategy::{ExternalCommandStrategy, PrintStrategy};
use super::verify::{CommandVerifier, PrintVerifier};
use super::{DocumentKind, PrintJob};

/// A job that reached the printer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrintSuccess {
    pub job_id: Uuid,
    /// Name of the strategy that succeeded
    pub strategy: String,
    /// Strategies tried, including the successful one
    pub attempts: usize,
}

/// Ordered fallback lists of print strategies, one list per document kind
pub struct StrategyChain {
    strategies: BTreeMap<DocumentKind, Vec<Arc<dyn PrintStrategy>>>,
    pacing: Duration,
    verifier: Option<Arc<dyn PrintVerifier>>,
    verify_delay: Duration,
}

impl std::fmt::Debug for StrategyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: BTreeMap<_, Vec<&str>> = self
            .strategies
            .iter()
            .map(|(kind, list)| (kind, list.iter().map(|s| s.name()).collect()))
            .collect();
        f.debug_struct("StrategyChain")
            .field("strategies", &names)
            .field("pacing", &self.pacing)
            .field("verify", &self.verifier.is_some())
            .finish()
    }
}

/// Builder for [`StrategyChain`]
pub struct StrategyChainBuilder {
    chain: StrategyChain,
}

impl StrategyChainBuilder {
    /// Append a strategy to the end of `kind`'s list
    pub fn register(mut self, kind: DocumentKind, strategy: Arc<dyn PrintStrategy>) -> Self {
        self.chain.strategies.entry(kind).or_default().push(strategy);
        self
    }

    /// Pause after a failed strategy before the next one is tried
    pub fn pacing(mut self, pacing: Duration) -> Self {
        self.chain.pacing = pacing;
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn PrintVerifier>, delay: Duration) -> Self {
        self.chain.verifier = Some(verifier);
        self.chain.verify_delay = delay;
        self
    }

    pub fn build(self) -> StrategyChain {
        self.chain
    }
}

impl StrategyChain {
    pub fn builder() -> StrategyChainBuilder {
        StrategyChainBuilder {
            chain: StrategyChain {
                strategies: BTreeMap::new(),
                pacing: Duration::ZERO,
                verifier: None,
                verify_delay: Duration::ZERO,
            },
        }
    }

    /// Build the chain described by the print configuration
    pub fn from_config(print: &PrintConfig, timing: &TimingConfig) -> Self {
        let printer = print.printer.as_deref();
        let mut builder = Self::builder().pacing(timing.strategy_pacing());

        for config in print.effective_strategies() {
            let command = ExternalCommandStrategy::from_config(&config, printer);
            let strategy: Arc<dyn PrintStrategy> = match config.kind {
                DocumentKind::Text => Arc::new(TextRenderStrategy::new(
                    command,
                    print.temp_dir(),
                    print.temp_cleanup_delay(),
                )),
                _ => Arc::new(command),
            };
            builder = builder.register(config.kind, strategy);
        }

        if print.verify_enabled() {
            builder = builder.verifier(Arc::new(CommandVerifier::platform_default(printer)), print.verify_delay());
        }
        builder.build()
    }

    pub fn strategies_for(&self, kind: DocumentKind) -> &[Arc<dyn PrintStrategy>] {
        self.strategies.get(&kind).map(Vec::as_slice).unwrap_or_default()
    }

    /// Try each strategy for the job's kind in order until one succeeds
    pub async fn attempt(&self, job: &PrintJob) -> Result<PrintSuccess, PrintJobFailure> {
        info!("Preparing to print: {} ({})", job.file_name, job.print_type);

        if !job.file_path.exists() {
            return Err(PrintJobFailure::SourceMissing(job.file_path.clone()));
        }

        let kind = job.document_kind();
        let strategies = self.strategies_for(kind);
        if strategies.is_empty() {
            return Err(PrintJobFailure::NoStrategies(kind));
        }

        if kind != DocumentKind::Text {
            if let Some(verifier) = &self.verifier {
                verifier.preflight(job).await;
            }
        }

        let total = strategies.len();
        let mut attempts = Vec::new();
        for (index, strategy) in strategies.iter().enumerate() {
            info!("Trying print method {}/{}: {}", index + 1, total, strategy.name());

            let outcome = match tokio::time::timeout(strategy.timeout(), strategy.attempt(job)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StrategyFailure::TimedOut { after: strategy.timeout() }),
            };

            match outcome {
                Ok(()) => {
                    info!("Print method {} ({}) succeeded for {}", index + 1, strategy.name(), job.file_name);
                    self.confirm(job).await;
                    return Ok(PrintSuccess {
                        job_id: job.id,
                        strategy: strategy.name().to_string(),
                        attempts: index + 1,
                    });
                }
                Err(failure) => {
                    warn!("Print method {} ({}) failed: {}", index + 1, strategy.name(), failure);
                    attempts.push(StrategyAttempt {
                        strategy: strategy.name().to_string(),
                        failure,
                    });
                    if index + 1 < total && !self.pacing.is_zero() {
                        tokio::time::sleep(self.pacing).await;
                    }
                }
            }
        }

        let last = attempts
            .last()
            .map(|attempt| attempt.failure.clone())
            .unwrap_or_else(|| StrategyFailure::Rejected("no strategy ran".to_string()));
        Err(PrintJobFailure::Exhausted { attempts, last })
    }

    async fn confirm(&self, job: &PrintJob) {
        let Some(verifier) = &self.verifier else { return };
        if !self.verify_delay.is_zero() {
            info!("Waiting for print job to spool...");
            tokio::time::sleep(self.verify_delay).await;
        }
        verifier.confirm(job).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Scripted {
        name: &'static str,
        result: Result<(), StrategyFailure>,
        delay: Duration,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl PrintStrategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn timeout(&self) -> Duration {
            Duration::from_millis(100)
        }

        async fn attempt(&self, _job: &PrintJob) -> Result<(), StrategyFailure> {
            self.log.lock().unwrap().push(self.name);
            tokio::time::sleep(self.delay).await;
            self.result.clone()
        }
    }

    #[derive(Default)]
    struct CountingVerifier {
        preflights: AtomicUsize,
        confirms: AtomicUsize,
    }

    #[async_trait]
    impl PrintVerifier for CountingVerifier {
        async fn preflight(&self, _job: &PrintJob) {
            self.preflights.fetch_add(1, Ordering::SeqCst);
        }

        async fn confirm(&self, _job: &PrintJob) {
            self.confirms.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scripted(
        log: &Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
        result: Result<(), StrategyFailure>,
    ) -> Arc<dyn PrintStrategy> {
        Arc::new(Scripted { name, result, delay: Duration::ZERO, log: log.clone() })
    }

    fn pdf_job(dir: &TempDir) -> PrintJob {
        let path = dir.path().join("invoice.pdf");
        std::fs::write(&path, b"%PDF-1.4").unwrap();
        PrintJob::original(path, "invoice.pdf")
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let verifier = Arc::new(CountingVerifier::default());
        let chain = StrategyChain::builder()
            .register(DocumentKind::Pdf, scripted(&log, "a", Err(StrategyFailure::Rejected("no".into()))))
            .register(DocumentKind::Pdf, scripted(&log, "b", Ok(())))
            .register(DocumentKind::Pdf, scripted(&log, "c", Ok(())))
            .verifier(verifier.clone(), Duration::ZERO)
            .build();

        let success = chain.attempt(&pdf_job(&dir)).await.unwrap();
        assert_eq!(success.strategy, "b");
        assert_eq!(success.attempts, 2);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
        assert_eq!(verifier.preflights.load(Ordering::SeqCst), 1);
        assert_eq!(verifier.confirms.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_reports_last_failure() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let slow: Arc<dyn PrintStrategy> = Arc::new(Scripted {
            name: "slow",
            result: Ok(()),
            delay: Duration::from_secs(5),
            log: log.clone(),
        });
        let chain = StrategyChain::builder()
            .register(DocumentKind::Pdf, scripted(&log, "missing", Err(StrategyFailure::ToolNotFound { tool: "x".into() })))
            .register(DocumentKind::Pdf, slow)
            .build();

        match chain.attempt(&pdf_job(&dir)).await {
            Err(PrintJobFailure::Exhausted { attempts, last }) => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].strategy, "missing");
                assert_eq!(last, StrategyFailure::TimedOut { after: Duration::from_millis(100) });
            }
            other => panic!("expected exhausted chain, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_routing_by_kind_and_missing_lists() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = StrategyChain::builder()
            .register(DocumentKind::Text, scripted(&log, "text", Ok(())))
            .register(DocumentKind::Pdf, scripted(&log, "pdf", Ok(())))
            .build();

        let path = dir.path().join("memo.docx");
        std::fs::write(&path, b"PK").unwrap();
        let result = chain.attempt(&PrintJob::original(&path, "memo.docx")).await;
        assert!(matches!(result, Err(PrintJobFailure::NoStrategies(DocumentKind::Document))));

        assert_eq!(chain.attempt(&pdf_job(&dir)).await.unwrap().strategy, "pdf");
        assert_eq!(*log.lock().unwrap(), vec!["pdf"]);
    }

    #[tokio::test]
    async fn test_missing_source_fails_before_any_strategy() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = StrategyChain::builder()
            .register(DocumentKind::Pdf, scripted(&log, "pdf", Ok(())))
            .build();

        let result = chain.attempt(&PrintJob::original("/nonexistent/invoice.pdf", "invoice.pdf")).await;
        assert!(matches!(result, Err(PrintJobFailure::SourceMissing(_))));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_from_config_registers_defaults() {
        let print = PrintConfig { verify: Some(false), ..PrintConfig::default() };
        let chain = StrategyChain::from_config(&print, &TimingConfig::default());

        assert!(!chain.strategies_for(DocumentKind::Text).is_empty());
        assert!(!chain.strategies_for(DocumentKind::Pdf).is_empty());
        assert!(chain.verifier.is_none());
    }
}
