use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use folderwatch::{
    cli::{Cli, OutputFormat},
    core::{FileReport, PrintStatus, WatchSupervisor},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.setup_logging();
    install_panic_hook();

    let config = match cli.resolve_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    tracing::info!("Starting FolderWatch on: {}", config.watch_path.display());
    match config.archive_dir() {
        Some(dir) => tracing::info!("Move to folder: {}", dir.display()),
        None => tracing::info!("Move to folder: disabled, files stay in place"),
    }
    tracing::info!("Printing: {}", if config.enable_printing { "enabled" } else { "disabled" });
    if let Some(printer) = &config.print.printer {
        tracing::info!("Printer: {}", printer);
    }

    let (report_tx, report_rx) = mpsc::unbounded_channel();
    let mut supervisor = WatchSupervisor::from_config(config).with_reports(report_tx);
    let reporter = tokio::spawn(emit_reports(report_rx, cli.output));

    supervisor
        .initialize()
        .context("Failed to initialize watch folder")?;

    let handle = supervisor.shutdown_handle();
    ctrlc::set_handler(move || {
        tracing::info!("Received shutdown signal");
        handle.stop();
    })
    .context("Failed to install shutdown handler")?;

    supervisor.run().await.context("File watcher failed")?;

    // Closes the report channel so the reporter can finish
    drop(supervisor);
    let _ = reporter.await;

    Ok(())
}

/// Panics are logged rather than written raw to stderr
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        tracing::error!("Unexpected error: {}", info);
    }));
}

async fn emit_reports(mut reports: mpsc::UnboundedReceiver<FileReport>, output: OutputFormat) {
    while let Some(report) = reports.recv().await {
        match output {
            OutputFormat::Json => match serde_json::to_string(&report) {
                Ok(line) => println!("{}", line),
                Err(err) => tracing::error!("Failed to serialize report for {}: {}", report.file_name, err),
            },
            OutputFormat::Text => log_report(&report),
        }
    }
}

fn log_report(report: &FileReport) {
    let print = match &report.print {
        PrintStatus::Disabled => "printing disabled".to_string(),
        PrintStatus::Skipped => "not printable".to_string(),
        PrintStatus::Printed { strategy, attempts } => format!("printed via {} (attempt {})", strategy, attempts),
        PrintStatus::Failed { reason } => format!("print failed: {}", reason),
    };
    let location = match (&report.archived_to, &report.archive_error) {
        (Some(path), _) => format!("archived to {}", path.display()),
        (None, Some(err)) => format!("left in place: {}", err),
        (None, None) => "left in place".to_string(),
    };
    tracing::info!("Processed {} [{}]: {}, {}", report.file_name, report.print_type, print, location);
}
