//! Configuration management for FolderWatch
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `FOLDERWATCH_*` environment variables, then command-line overrides.
//! The resolved [`ServiceConfig`] is immutable once the watcher is built.

use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::print::DocumentKind;

/// Global configuration for the watcher service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory to monitor, created if absent
    pub watch_path: PathBuf,
    /// Archive directory; `None` or an empty path leaves files in place
    pub move_to_folder: Option<PathBuf>,
    /// Whether classified files are sent to the printer
    pub enable_printing: bool,
    /// How filesystem notifications are obtained
    pub watch_mode: WatchMode,
    /// Polling interval in milliseconds (polling and auto fallback)
    pub poll_interval_ms: u64,
    /// Delays, cooldowns and retry limits
    pub timing: TimingConfig,
    /// Printer and strategy chain configuration
    pub print: PrintConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WatchMode {
    /// Native notifications with polling fallback
    Auto,
    /// Use native file system events
    Native,
    /// Use polling-based watching
    Polling,
}

/// Timing knobs for the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Pause after detecting a file before reading it
    pub settle_delay_ms: u64,
    /// Pause between consecutive print jobs
    pub cooldown_ms: u64,
    /// Pause between two strategies of the same job
    pub strategy_pacing_ms: u64,
    /// Move attempts before a file is left in place
    pub move_retry_attempts: u32,
    /// Pause between move attempts
    pub move_retry_backoff_ms: u64,
    /// First delay before resubscribing after a watch error
    pub restart_delay_ms: u64,
    /// Upper bound for the growing resubscribe delay
    pub restart_delay_max_ms: u64,
    /// Interval of the liveness log line
    pub heartbeat_secs: u64,
    /// Time in-flight files get to settle on shutdown
    pub shutdown_grace_ms: u64,
}

/// Printer configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PrintConfig {
    /// Destination printer; `None` prints to the system default
    pub printer: Option<String>,
    /// Where text renderings are written before printing
    pub temp_dir: Option<PathBuf>,
    /// Delay before a rendered temp file is removed
    pub temp_cleanup_delay_ms: Option<u64>,
    /// Whether to run the diagnostic printer checks
    pub verify: Option<bool>,
    /// Wait before checking the printer queue after a success
    pub verify_delay_ms: Option<u64>,
    /// Explicit strategy list, replacing the platform defaults
    pub strategies: Option<Vec<StrategyConfig>>,
}

/// One external print mechanism
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub kind: DocumentKind,
    /// Executable paths probed in order, or bare command names
    pub candidates: Vec<String>,
    /// Argument lists tried in order; `{file}` and `{printer}` are substituted
    pub variants: Vec<Vec<String>>,
    #[serde(default = "default_strategy_timeout")]
    pub timeout_secs: u64,
    /// Stdout must contain this for the attempt to count as a success
    #[serde(default)]
    pub success_marker: Option<String>,
    /// Stderr containing any of these rejects the attempt
    #[serde(default)]
    pub failure_markers: Vec<String>,
    /// Pause after a successful command, letting the viewer hand off the job
    #[serde(default)]
    pub settle_after_ms: u64,
}

fn default_strategy_timeout() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            watch_path: PathBuf::from("WatchedItems"),
            move_to_folder: Some(PathBuf::from("ProcessedFiles")),
            enable_printing: true,
            watch_mode: WatchMode::Auto,
            poll_interval_ms: 1000,
            timing: TimingConfig::default(),
            print: PrintConfig::default(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 3000,
            cooldown_ms: 8000,
            strategy_pacing_ms: 2000,
            move_retry_attempts: 3,
            move_retry_backoff_ms: 2000,
            restart_delay_ms: 5000,
            restart_delay_max_ms: 60_000,
            heartbeat_secs: 300, // 5 minutes
            shutdown_grace_ms: 2000,
        }
    }
}

impl TimingConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn strategy_pacing(&self) -> Duration {
        Duration::from_millis(self.strategy_pacing_ms)
    }

    pub fn move_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.move_retry_backoff_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Resubscribe delay after `failures` consecutive watch errors.
    ///
    /// Doubles per failure starting at `restart_delay_ms`, capped at
    /// `restart_delay_max_ms`.
    pub fn restart_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let delay = self.restart_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.restart_delay_max_ms.max(self.restart_delay_ms)))
    }
}

impl PrintConfig {
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn temp_cleanup_delay(&self) -> Duration {
        Duration::from_millis(self.temp_cleanup_delay_ms.unwrap_or(10_000))
    }

    pub fn verify_enabled(&self) -> bool {
        self.verify.unwrap_or(true)
    }

    pub fn verify_delay(&self) -> Duration {
        Duration::from_millis(self.verify_delay_ms.unwrap_or(8000))
    }

    /// Configured strategies, or the platform defaults when none are set
    pub fn effective_strategies(&self) -> Vec<StrategyConfig> {
        match &self.strategies {
            Some(strategies) => strategies.clone(),
            None => default_strategies(self.printer.as_deref()),
        }
    }
}

fn strategy(name: &str, kind: DocumentKind, candidates: &[&str], variants: &[&[&str]], timeout_secs: u64) -> StrategyConfig {
    StrategyConfig {
        name: name.to_string(),
        kind,
        candidates: candidates.iter().map(|c| c.to_string()).collect(),
        variants: variants
            .iter()
            .map(|args| args.iter().map(|a| a.to_string()).collect())
            .collect(),
        timeout_secs,
        success_marker: None,
        failure_markers: Vec::new(),
        settle_after_ms: 0,
    }
}

/// Platform default strategy chain
#[cfg(windows)]
pub fn default_strategies(_printer: Option<&str>) -> Vec<StrategyConfig> {
    let mut shell_print = strategy(
        "Windows Shell Print Command",
        DocumentKind::Pdf,
        &["print"],
        &[&["/d:{printer}", "{file}"]],
        30,
    );
    shell_print.failure_markers = vec!["Error".to_string(), "failed".to_string()];

    let mut adobe = strategy(
        "Adobe Reader Silent Print",
        DocumentKind::Pdf,
        &[
            r"C:\Program Files\Adobe\Acrobat DC\Acrobat\Acrobat.exe",
            r"C:\Program Files (x86)\Adobe\Acrobat Reader DC\Reader\AcroRd32.exe",
            r"C:\Program Files\Adobe\Acrobat Reader DC\Reader\AcroRd32.exe",
        ],
        &[
            &["/s", "/o", "/h", "/t", "{file}", "{printer}"],
            &["/N", "/T", "{file}", "{printer}"],
            &["/p", "/h", "{file}"],
        ],
        30,
    );
    adobe.settle_after_ms = 5000;

    let mut document = strategy(
        "Shell Print Verb",
        DocumentKind::Document,
        &["powershell"],
        &[&["-NoProfile", "-Command", "Start-Process -FilePath '{file}' -Verb Print -WindowStyle Hidden"]],
        30,
    );
    document.settle_after_ms = 5000;

    vec![
        strategy("Notepad Text Print", DocumentKind::Text, &["notepad.exe"], &[&["/p", "{file}"]], 30),
        strategy(
            "SumatraPDF",
            DocumentKind::Pdf,
            &[
                r"C:\Program Files\SumatraPDF\SumatraPDF.exe",
                r"C:\Program Files (x86)\SumatraPDF\SumatraPDF.exe",
            ],
            &[
                &["-print-to", "{printer}", "-silent", "{file}"],
                &["-print-to-default", "-silent", "{file}"],
            ],
            25,
        ),
        adobe,
        shell_print,
        strategy(
            "PDFtoPrinter Utility",
            DocumentKind::Pdf,
            &[
                r"C:\Program Files\PDFtoPrinter\PDFtoPrinter.exe",
                r"C:\Program Files (x86)\PDFtoPrinter\PDFtoPrinter.exe",
                "PDFtoPrinter.exe",
            ],
            &[&["{file}", "{printer}"], &["{file}"]],
            20,
        ),
        strategy(
            "GSPrint",
            DocumentKind::Pdf,
            &[
                r"C:\Program Files\Ghostgum\gsview\gsprint.exe",
                r"C:\Program Files (x86)\Ghostgum\gsview\gsprint.exe",
                r"C:\GSPrint\gsprint.exe",
            ],
            &[&["-printer", "{printer}", "{file}"], &["{file}"]],
            20,
        ),
        document,
    ]
}

/// Platform default strategy chain
#[cfg(not(windows))]
pub fn default_strategies(printer: Option<&str>) -> Vec<StrategyConfig> {
    let lp: &[&str] = if printer.is_some() { &["-d", "{printer}", "{file}"] } else { &["{file}"] };
    let lpr: &[&str] = if printer.is_some() { &["-P", "{printer}", "{file}"] } else { &["{file}"] };

    let mut chain = Vec::new();
    for kind in [DocumentKind::Text, DocumentKind::Pdf, DocumentKind::Document] {
        chain.push(strategy("CUPS lp", kind, &["lp"], &[lp], 30));
        if kind != DocumentKind::Text {
            chain.push(strategy("BSD lpr", kind, &["lpr"], &[lpr], 30));
        }
    }
    chain
}

/// Configuration loading and management
impl ServiceConfig {
    /// Looked up in the working directory when no `--config` is given
    pub const DEFAULT_FILE: &'static str = "folderwatch.toml";

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Defaults, then the config file, then the environment
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let fallback = Path::new(Self::DEFAULT_FILE);
                if fallback.is_file() {
                    Self::from_file(fallback)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    /// Override with environment variables if present
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("FOLDERWATCH_WATCH_PATH") {
            self.watch_path = PathBuf::from(val);
        }

        if let Some(val) = lookup("FOLDERWATCH_MOVE_TO") {
            self.move_to_folder = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("FOLDERWATCH_ENABLE_PRINTING") {
            match parse_toggle(&val) {
                Some(enabled) => self.enable_printing = enabled,
                None => tracing::warn!("Ignoring FOLDERWATCH_ENABLE_PRINTING={}", val),
            }
        }

        if let Some(val) = lookup("FOLDERWATCH_PRINTER") {
            self.print.printer = Some(val);
        }
    }

    /// Archive directory, if archiving is enabled
    pub fn archive_dir(&self) -> Option<&Path> {
        self.move_to_folder
            .as_deref()
            .filter(|path| !path.as_os_str().is_empty())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.watch_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("watch_path must not be empty".to_string()));
        }

        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be greater than 0".to_string()));
        }

        if self.timing.move_retry_attempts == 0 {
            return Err(ConfigError::Invalid("move_retry_attempts must be greater than 0".to_string()));
        }

        if let Some(archive) = self.archive_dir() {
            if lexical_normal(archive) == lexical_normal(&self.watch_path) {
                return Err(ConfigError::Invalid(
                    "move_to_folder must differ from watch_path".to_string(),
                ));
            }
        }

        for strategy in self.print.strategies.iter().flatten() {
            if strategy.candidates.is_empty() || strategy.variants.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "strategy '{}' needs at least one candidate and one variant",
                    strategy.name
                )));
            }
        }

        Ok(())
    }
}

/// `path` without `.` segments and with `..` folded where possible.
///
/// Symlinked aliases are only caught once the directories exist, see
/// `WatchSupervisor::initialize`.
pub fn lexical_normal(path: &Path) -> PathBuf {
    let mut normal = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match normal.components().next_back() {
                Some(Component::Normal(_)) => {
                    normal.pop();
                }
                _ => normal.push(component),
            },
            other => normal.push(other),
        }
    }
    normal
}

/// Accepts the spellings the service has always understood for on/off
pub fn parse_toggle(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "print" | "true" | "1" | "yes" | "on" => Some(true),
        "disable" | "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
