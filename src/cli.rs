use std::path::PathBuf;
use clap::{Parser, ValueEnum};

use crate::config::{parse_toggle, ServiceConfig, WatchMode};
use crate::error::ConfigError;

#[derive(Parser, Debug)]
#[command(name = "folderwatch")]
#[command(version = "0.1.0")]
#[command(about = "Watches a folder, prints new files and archives them")]
#[command(long_about = "FolderWatch monitors a drop folder for new files, classifies each one, sends printable files through a chain of print mechanisms one job at a time, and moves every processed file into an archive folder.")]
pub struct Cli {
    /// Directory to watch for new files
    #[arg(value_name = "WATCH_PATH", help = "Folder to watch (created if missing)")]
    pub watch_path: Option<PathBuf>,

    /// Where processed files are moved
    #[arg(value_name = "MOVE_TO", help = "Archive folder for processed files")]
    pub move_to: Option<PathBuf>,

    /// Printing toggle: print/true or disable/false
    #[arg(value_name = "PRINT", value_parser = parse_print_toggle, help = "print|true to enable printing, disable|false to turn it off")]
    pub print: Option<bool>,

    /// Configuration file
    #[arg(short, long, value_name = "FILE", help = "TOML configuration file (defaults to ./folderwatch.toml if present)")]
    pub config: Option<PathBuf>,

    /// Leave processed files in the watch folder
    #[arg(long, conflicts_with = "move_to", help = "Do not move processed files")]
    pub no_archive: bool,

    /// Printer name passed to print mechanisms
    #[arg(long, help = "Destination printer (system default if omitted)")]
    pub printer: Option<String>,

    /// Watch mode - how filesystem events are obtained
    #[arg(short, long, help = "File watching mode")]
    pub mode: Option<WatchMode>,

    /// Polling interval in milliseconds (for polling mode)
    #[arg(long, help = "Polling interval in ms")]
    pub poll_interval: Option<u64>,

    /// Output format for per-file reports
    #[arg(long, default_value = "text", help = "Output format")]
    pub output: OutputFormat,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Log lines only
    Text,
    /// One JSON report per processed file on stdout
    Json,
}

fn parse_print_toggle(value: &str) -> Result<bool, String> {
    parse_toggle(value).ok_or_else(|| format!("expected print, true, disable or false, got '{}'", value))
}

impl Cli {
    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_writer(std::io::stderr)
            .init();
    }

    /// Command-line values take precedence over everything else
    pub fn apply_overrides(&self, config: &mut ServiceConfig) {
        if let Some(path) = &self.watch_path {
            config.watch_path = path.clone();
        }

        if let Some(path) = &self.move_to {
            config.move_to_folder = Some(path.clone());
        }

        if self.no_archive {
            config.move_to_folder = None;
        }

        if let Some(enabled) = self.print {
            config.enable_printing = enabled;
        }

        if let Some(printer) = &self.printer {
            config.print.printer = Some(printer.clone());
        }

        if let Some(mode) = self.mode {
            config.watch_mode = mode;
        }

        if let Some(interval) = self.poll_interval {
            config.poll_interval_ms = interval;
        }
    }

    /// Defaults, config file, environment, then these arguments
    pub fn resolve_config(&self) -> Result<ServiceConfig, ConfigError> {
        let mut config = ServiceConfig::load(self.config.as_deref())?;
        self.apply_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_positional_arguments() {
        let cli = Cli::try_parse_from(["folderwatch", "inbox", "done", "disable"]).unwrap();
        let mut config = ServiceConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.watch_path, PathBuf::from("inbox"));
        assert_eq!(config.archive_dir(), Some(Path::new("done")));
        assert!(!config.enable_printing);
    }

    #[test]
    fn test_print_toggle_spellings() {
        for (word, expected) in [("print", true), ("true", true), ("false", false), ("disable", false)] {
            let cli = Cli::try_parse_from(["folderwatch", "in", "out", word]).unwrap();
            assert_eq!(cli.print, Some(expected), "{}", word);
        }
        assert!(Cli::try_parse_from(["folderwatch", "in", "out", "sometimes"]).is_err());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "folderwatch",
            "--no-archive",
            "--printer",
            "Office Laser",
            "--mode",
            "polling",
            "--poll-interval",
            "250",
            "--output",
            "json",
        ])
        .unwrap();

        let mut config = ServiceConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.archive_dir(), None);
        assert_eq!(config.print.printer.as_deref(), Some("Office Laser"));
        assert_eq!(config.watch_mode, WatchMode::Polling);
        assert_eq!(config.poll_interval_ms, 250);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(config.enable_printing);
    }

    #[test]
    fn test_defaults_leave_config_untouched() {
        let cli = Cli::try_parse_from(["folderwatch"]).unwrap();
        let mut config = ServiceConfig::default();
        cli.apply_overrides(&mut config);

        assert_eq!(config.watch_path, PathBuf::from("WatchedItems"));
        assert_eq!(config.archive_dir(), Some(Path::new("ProcessedFiles")));
        assert_eq!(cli.output, OutputFormat::Text);
    }
}
