//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;
use mirror_core::EngineConfig;

const GIB: u64 = 1024 * 1024 * 1024;

/// Mirror a large remote file corpus to local storage.
///
/// Transfers resume from partial files after interruption, requests are paced
/// adaptively, and new work pauses while free space is below a floor.
#[derive(Parser, Debug)]
#[command(name = "corpus-mirror")]
#[command(author, version, about)]
pub struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/corpus-mirror/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write a commented default config file and exit
    #[arg(long)]
    pub create_config: bool,

    /// Print the progress ledger summary and exit without touching the network
    #[arg(long)]
    pub status: bool,

    /// Print the status summary as JSON (with --status)
    #[arg(long, requires = "status")]
    pub json: bool,

    /// Reset failed items to pending with a fresh attempt budget before running
    #[arg(long)]
    pub retry_failed: bool,

    /// Comma-separated categories to mirror (overrides config)
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    pub categories: Option<Vec<String>>,

    /// Concurrent transfers (1-20)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=20))]
    pub max_concurrent: Option<u8>,

    /// Initial delay between requests in seconds
    #[arg(short = 'l', long, value_name = "SECS", value_parser = parse_delay_secs)]
    pub rate_limit: Option<f64>,

    /// Free-space floor in GiB; new transfers pause below it
    #[arg(long, value_name = "GIB")]
    pub min_space_gb: Option<u64>,

    /// Local storage root
    #[arg(long, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Also write logs to this file (rotated daily)
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Delete rotated log files past the retention age before starting
    #[arg(long)]
    pub cleanup_logs: bool,

    /// Cap on requests in any 60-second window (0 disables the cap)
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(0..=6000))]
    pub max_requests_per_minute: Option<u32>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Applies command-line overrides on top of file and environment config.
    pub fn apply_overrides(&self, config: &mut EngineConfig) {
        if let Some(categories) = &self.categories {
            config.categories = categories
                .iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
        if let Some(max_concurrent) = self.max_concurrent {
            config.max_concurrent = usize::from(max_concurrent);
        }
        if let Some(delay) = self.rate_limit {
            config.set_initial_delay(delay);
        }
        if let Some(cap) = self.max_requests_per_minute {
            config.rate.max_requests_per_minute = cap;
        }
        if let Some(gib) = self.min_space_gb {
            config.disk.min_free_space_bytes = gib.saturating_mul(GIB);
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir.clone_from(data_dir);
        }
        if let Some(log_file) = &self.log_file {
            config.logging.file = Some(log_file.clone());
        }
    }

    /// Default log level from the verbosity flags, when any were given.
    #[must_use]
    pub fn level_override(&self) -> Option<&'static str> {
        if self.quiet {
            return Some("error");
        }
        match self.verbose {
            0 => None,
            1 => Some("debug"),
            _ => Some("trace"),
        }
    }
}

fn parse_delay_secs(raw: &str) -> Result<f64, String> {
    let value: f64 = raw
        .parse()
        .map_err(|_| format!("`{raw}` is not a number of seconds"))?;
    if !(0.0..=600.0).contains(&value) {
        return Err(format!("{value} is outside 0-600 seconds"));
    }
    Ok(value)
}
