//! CLI entry point for the corpus mirror.

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use mirror_core::config::resolve_default_config_path;
use mirror_core::{
    DiskUsage, Engine, EngineConfig, HttpProtocolClient, Ledger, RunStats, Selection,
    StatusSnapshot,
};
use serde::Serialize;
use tracing::{debug, info, warn};

mod cli;
mod logging;

use cli::Args;

/// Fallback when no XDG/HOME config directory is available.
const LOCAL_CONFIG_FILE: &str = "corpus-mirror.toml";

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    if args.create_config {
        let path = args
            .config
            .clone()
            .or_else(resolve_default_config_path)
            .unwrap_or_else(|| PathBuf::from(LOCAL_CONFIG_FILE));
        EngineConfig::write_default(&path)
            .with_context(|| format!("could not create {}", path.display()))?;
        println!("Wrote default configuration to {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&args)?;
    let _log_guard = logging::init_logging(&args, &config)?;
    debug!(?args, "CLI arguments parsed");

    if args.cleanup_logs {
        logging::cleanup_logs(&config)?;
    }

    if args.status {
        print_status(&config, args.json)?;
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        base_url = %config.base_url,
        data_dir = %config.data_dir.display(),
        "corpus-mirror starting"
    );

    let client = HttpProtocolClient::new(
        &config.base_url,
        config.connect_timeout_secs,
        config.transfer_timeout_secs,
    )
    .context("could not build HTTP client")?;
    let engine = Arc::new(Engine::new(&config, Arc::new(client))?);

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if let Some(signal) = shutdown_signal().await {
            warn!(signal, "shutdown requested, finishing in-flight checkpoints");
            cancel.cancel();
        }
    });

    let use_spinner = should_use_spinner(io::stderr().is_terminal(), args.quiet);
    let (progress_handle, progress_stop) = spawn_progress_ui(use_spinner, Arc::clone(&engine));

    let selection = Selection {
        categories: None,
        retry_failed: args.retry_failed,
    };
    let result = engine.run(&selection).await;

    progress_stop.store(true, Ordering::SeqCst);
    if let Some(handle) = progress_handle {
        let _ = handle.await;
    }

    let stats = result?;
    if !args.quiet {
        print_summary(&stats, &engine.status());
    }

    Ok(if stats.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Layers defaults, the config file, environment, and CLI flags.
fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("could not load config {}", path.display()))?,
        None => match resolve_default_config_path().filter(|p| p.is_file()) {
            Some(path) => EngineConfig::load(&path)
                .with_context(|| format!("could not load config {}", path.display()))?,
            None => EngineConfig::default(),
        },
    };
    config.apply_env_overrides()?;
    args.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Waits for Ctrl-C or SIGTERM. Returns the signal's name.
#[cfg(unix)]
async fn shutdown_signal() -> Option<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => Some("SIGINT"),
            Some(()) = terminate.recv() => Some("SIGTERM"),
            else => None,
        },
        Err(e) => {
            warn!(error = %e, "could not install SIGTERM handler");
            tokio::signal::ctrl_c().await.ok().map(|()| "SIGINT")
        }
    }
}

/// Waits for Ctrl-C. Returns the signal's name.
#[cfg(not(unix))]
async fn shutdown_signal() -> Option<&'static str> {
    tokio::signal::ctrl_c().await.ok().map(|()| "SIGINT")
}

/// `--status --json` document.
#[derive(Serialize)]
struct StatusReport<'a> {
    #[serde(flatten)]
    ledger: &'a StatusSnapshot,
    disk: Option<DiskUsage>,
}

/// Prints the ledger summary without touching the network or the disk.
fn print_status(config: &EngineConfig, json: bool) -> Result<()> {
    let ledger = Ledger::open_read_only(&config.ledger.path)
        .with_context(|| format!("could not read ledger {}", config.ledger.path.display()))?;
    let snapshot = ledger.snapshot(config.max_attempts);
    let disk = match DiskUsage::measure(&config.data_dir, config.disk.min_free_space_bytes) {
        Ok(usage) => Some(usage),
        Err(e) => {
            warn!(error = %e, "could not measure disk usage");
            None
        }
    };

    if json {
        let report = StatusReport {
            ledger: &snapshot,
            disk,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Ledger: {}", ledger.path().display());
    println!("  total        {}", snapshot.total());
    println!("  completed    {}", snapshot.completed);
    println!("  pending      {}", snapshot.pending);
    println!("  in progress  {}", snapshot.in_progress);
    println!(
        "  failed       {} ({} retryable, {} permanent)",
        snapshot.failed, snapshot.failed_retryable, snapshot.failed_permanent
    );
    println!(
        "  bytes        {} of {}",
        HumanBytes(snapshot.transferred_bytes),
        HumanBytes(snapshot.total_bytes)
    );

    if let Some(disk) = disk {
        println!("Disk: {}", config.data_dir.display());
        println!("  total        {}", HumanBytes(disk.total_bytes));
        println!(
            "  used         {} ({:.1}%)",
            HumanBytes(disk.used_bytes),
            disk.percent_used()
        );
        println!("  free         {}", HumanBytes(disk.free_bytes));
        println!(
            "  sufficient   {} (floor {})",
            if disk.sufficient { "yes" } else { "no" },
            HumanBytes(disk.threshold)
        );
    }
    Ok(())
}

fn print_summary(stats: &RunStats, snapshot: &StatusSnapshot) {
    let headline = if stats.interrupted() {
        "Interrupted"
    } else {
        "Finished"
    };
    println!(
        "{headline}: {} completed, {} failed, {} retried, {} already present ({} fetched)",
        stats.completed(),
        stats.failed(),
        stats.retried(),
        stats.skipped(),
        HumanBytes(stats.bytes_transferred())
    );
    if stats.listing_failures() > 0 {
        println!("{} directories could not be listed", stats.listing_failures());
    }
    if snapshot.failed > 0 {
        println!(
            "{} items failed ({} permanent); rerun with --retry-failed to try them again",
            snapshot.failed, snapshot.failed_permanent
        );
    }
    if stats.interrupted() {
        println!("Progress saved; rerun to resume.");
    }
}

fn should_use_spinner(stderr_is_terminal: bool, quiet: bool) -> bool {
    stderr_is_terminal && !quiet && std::env::var("TERM").map_or(true, |term| term != "dumb")
}

/// Spawns the progress spinner when requested.
/// Returns (handle, stop) so the caller can signal stop and await the handle.
fn spawn_progress_ui(
    use_spinner: bool,
    engine: Arc<Engine>,
) -> (Option<tokio::task::JoinHandle<()>>, Arc<AtomicBool>) {
    if !use_spinner {
        return (None, Arc::new(AtomicBool::new(true)));
    }
    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = Arc::clone(&stop);
    let handle = tokio::spawn(async move {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));

        while !stop_signal.load(Ordering::SeqCst) {
            let status = engine.status();
            let paused = if engine.disk().is_below_threshold() {
                " [paused: low disk space]"
            } else {
                ""
            };
            spinner.set_message(format!(
                "[{}/{}] {} in flight, {} failed, {} of {} | delay {:.1}s{paused}",
                status.completed,
                status.total(),
                status.in_progress,
                status.failed,
                HumanBytes(status.transferred_bytes),
                HumanBytes(status.total_bytes),
                engine.rate_state().delay.as_secs_f64(),
            ));
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        spinner.finish_and_clear();
    });
    (Some(handle), stop)
}
