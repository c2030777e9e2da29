use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use send_detections::cli::{Cli, Command};
use send_detections::config::SubmitterConfig;
use send_detections::engine::{CancellationSignal, ProcessingSummary, SubmissionEngine};
use send_detections::ui::{self, SubmissionProgress};
use send_detections::{DetectionClient, SubmitError, SubmitOptions, input};

fn init_tracing(verbose: bool) {
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let default_level = if verbose {
        "send_detections=debug"
    } else {
        "send_detections=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    // stdout carries the summary JSON.
    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("Command failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Returns whether every batch succeeded.
async fn run(cli: Cli) -> Result<bool> {
    let mut config = SubmitterConfig::load().context("loading configuration")?;
    cli.apply(&mut config);

    let Command::Submit {
        file,
        debug,
        org_ids,
        output,
        timeout_secs,
    } = cli.command;

    let records = input::read_records(&file)
        .with_context(|| format!("reading detections from {}", file.display()))?;
    info!(records = records.len(), file = %file.display(), "Loaded detections");

    let client = DetectionClient::with_timeouts(
        config.require_token()?.to_string(),
        config.api_url.clone(),
        config.connect_timeout(),
        config.timeout(),
    )?;

    let mut engine_config = config.engine_config();
    engine_config.run_timeout = timeout_secs.map(Duration::from_secs);

    let cancel = CancellationSignal::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received, cancelling pending batches");
                cancel.cancel();
            }
        }
    });

    let progress = Arc::new(SubmissionProgress::start(records.len() as u64));
    let engine = SubmissionEngine::new(client, engine_config)?
        .with_cancellation(cancel)
        .with_observer(progress.clone());

    let options = SubmitOptions::default()
        .debug(debug)
        .organization_ids(org_ids);
    let result = engine.run(records, options).await;
    progress.finish();

    let summary = match result {
        Ok(summary) => summary,
        Err(SubmitError::Cancelled { summary }) => {
            warn!(
                cancelled = summary.batches_cancelled,
                "Run cancelled before all batches were submitted"
            );
            *summary
        }
        Err(e) => return Err(e.into()),
    };

    write_summary(&summary, output.as_deref())?;
    ui::print_summary(&summary);
    Ok(summary.success)
}

fn write_summary(summary: &ProcessingSummary, output: Option<&std::path::Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(summary)?;
    match output {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing summary to {}", path.display()))?,
        None => println!("{json}"),
    }
    Ok(())
}
