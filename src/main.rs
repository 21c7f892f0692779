//! CLI entry point for the CNPJ ETL pipeline.

use std::io::{self, IsTerminal};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use cnpj_etl_core::{CheckpointStore, Database, EventSink, Pipeline};
use tracing::{debug, info, warn};

mod cli;
mod progress;

use cli::{Args, Command, Location, ResetArgs, StatusArgs};
use progress::ProgressSink;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();
    let env_file = load_env_file(&args)?;
    // Parse again so values from the env file fill env-backed options.
    let args = if env_file.is_some() { Args::parse() } else { args };

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(path) = env_file {
        debug!(path = %path.display(), "environment file loaded");
    }
    debug!(?args, "CLI arguments parsed");

    match args.command {
        Command::Run(run) => {
            let config = run.config();
            config.validate().context("invalid configuration")?;
            info!(period = %config.period, "cnpj-etl starting");

            let interrupt = Arc::new(AtomicBool::new(false));
            spawn_interrupt_handler(Arc::clone(&interrupt));

            let mut pipeline = Pipeline::open(config)
                .await
                .context("failed to open databases")?
                .with_interrupt_flag(interrupt);
            let use_spinner = progress::should_use_spinner(
                io::stderr().is_terminal(),
                args.quiet,
                progress::is_dumb_terminal(),
            );
            let spinner = use_spinner.then(|| Arc::new(ProgressSink::spinner()));
            if let Some(sink) = &spinner {
                pipeline = pipeline.with_event_sink(Arc::clone(sink) as Arc<dyn EventSink>);
            }

            let result = pipeline.run().await;
            if let Some(sink) = &spinner {
                sink.finish();
            }
            let summary = match result {
                Ok(summary) => summary,
                Err(err) => {
                    for failure in err.failed_downloads() {
                        eprintln!("failed: {} ({})", failure.logical_name, failure.error);
                    }
                    return Err(err).context("pipeline run failed");
                }
            };

            println!("{summary}");
            let exit = summary.exit();
            Ok(ExitCode::from(u8::try_from(exit.code()).unwrap_or(1)))
        }
        Command::Status(status) => {
            show_status(&status).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Reset(reset) => {
            reset_checkpoints(&reset).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Loads `--env-file`, or `./.env` when present. Returns the loaded path.
fn load_env_file(args: &Args) -> Result<Option<std::path::PathBuf>> {
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load {}", path.display()))?;
            Ok(Some(path.clone()))
        }
        None => Ok(dotenvy::dotenv().ok()),
    }
}

fn spawn_interrupt_handler(interrupt: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight work");
            interrupt.store(true, Ordering::SeqCst);
        }
    });
}

async fn open_store(location: &Location) -> Result<CheckpointStore> {
    let config = location.config();
    let db = Database::new(&config.checkpoint_path)
        .await
        .with_context(|| format!("failed to open {}", config.checkpoint_path.display()))?;
    Ok(CheckpointStore::new(db))
}

async fn show_status(args: &StatusArgs) -> Result<()> {
    let store = open_store(&args.location).await?;
    let period = args.location.period.key();
    let records = store.list(&period, args.stage).await?;

    if records.is_empty() {
        println!("No checkpoints for {period}");
        return Ok(());
    }
    println!("Checkpoints for {period}:");
    for record in records {
        let detail = match record.detail.as_deref() {
            // Extract details hold the entry list; show its size only.
            Some(detail) if detail.starts_with('[') => {
                let entries = serde_json::from_str::<Vec<serde_json::Value>>(detail)
                    .map_or(0, |v| v.len());
                format!("{entries} entries")
            }
            Some(detail) => detail.to_string(),
            None => String::new(),
        };
        println!(
            "  {:<10} {:<11} {:<40} {} {}",
            record.key.stage.as_str(),
            record.status.as_str(),
            record.key.logical_name,
            record.updated_at,
            detail
        );
    }
    Ok(())
}

async fn reset_checkpoints(args: &ResetArgs) -> Result<()> {
    let store = open_store(&args.location).await?;
    let period = args.location.period.key();
    let removed = store.reset_period(&period, args.stage).await?;
    info!(period = %period, removed, "checkpoints cleared");
    println!("Cleared {removed} checkpoints for {period}");
    Ok(())
}
