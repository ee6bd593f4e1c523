//! Subscriber setup and rotated log file housekeeping.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use mirror_core::EngineConfig;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::Args;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Installs the subscriber.
///
/// Priority for the level: `RUST_LOG` > `--quiet` > `-v/-vv` > config.
pub fn init_logging(args: &Args, config: &EngineConfig) -> Result<Option<WorkerGuard>> {
    let default_level = args
        .level_override()
        .map_or_else(|| config.logging.level.to_lowercase(), str::to_string);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_level));

    let console = fmt::layer().with_writer(io::stderr).with_target(false);

    let Some(log_file) = &config.logging.file else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .init();
        return Ok(None);
    };

    let (dir, file_name) = split_log_path(log_file)?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("could not create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(&dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(Some(guard))
}

pub fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("log file path {} has no file name", path.display()))?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    Ok((dir, file_name))
}

/// Deletes the configured log file's rotations older than the retention age.
///
/// Returns how many files were removed; nothing happens without a log file.
pub fn cleanup_logs(config: &EngineConfig) -> Result<usize> {
    let Some(log_file) = &config.logging.file else {
        info!("no log file configured, nothing to clean up");
        return Ok(0);
    };
    let (dir, file_name) = split_log_path(log_file)?;
    let max_age = Duration::from_secs(u64::from(config.logging.retention_days) * SECS_PER_DAY);
    remove_expired_logs(&dir, &file_name, max_age)
        .with_context(|| format!("could not clean up log directory {}", dir.display()))
}

/// Removes `file_name` and its dated rotations in `dir` last modified more
/// than `max_age` ago. Other files are left alone.
fn remove_expired_logs(dir: &Path, file_name: &str, max_age: Duration) -> io::Result<usize> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let rotated_prefix = format!("{file_name}.");
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.filter_map(Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != file_name && !name.starts_with(&rotated_prefix) {
            continue;
        }
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if !metadata.is_file() || age <= max_age {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => {
                debug!(file = %name, age_days = age.as_secs() / SECS_PER_DAY, "removed old log file");
                removed += 1;
            }
            Err(e) => warn!(file = %name, error = %e, "could not remove old log file"),
        }
    }
    if removed > 0 {
        info!(removed, "cleaned up old log files");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn touch(path: &Path, age_days: u64) {
        let file = File::create(path).unwrap();
        let modified = SystemTime::now() - Duration::from_secs(age_days * SECS_PER_DAY);
        file.set_modified(modified).unwrap();
    }

    #[test]
    fn test_split_log_path_defaults_to_current_dir() {
        let (dir, name) = split_log_path(Path::new("mirror.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "mirror.log");

        let (dir, name) = split_log_path(Path::new("logs/mirror.log")).unwrap();
        assert_eq!(dir, PathBuf::from("logs"));
        assert_eq!(name, "mirror.log");
    }

    #[test]
    fn test_remove_expired_logs_keeps_recent_and_unrelated_files() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("mirror.log.2026-08-01");
        let recent = dir.path().join("mirror.log.2026-10-10");
        let unrelated = dir.path().join("notes.txt");
        let prefix_only = dir.path().join("mirror.logger");
        touch(&old, 45);
        touch(&recent, 6);
        touch(&unrelated, 400);
        touch(&prefix_only, 400);

        let removed =
            remove_expired_logs(dir.path(), "mirror.log", Duration::from_secs(30 * SECS_PER_DAY))
                .unwrap();

        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(recent.exists());
        assert!(unrelated.exists());
        assert!(prefix_only.exists());
    }

    #[test]
    fn test_remove_expired_logs_missing_dir_is_noop() {
        let dir = TempDir::new().unwrap();
        let removed =
            remove_expired_logs(&dir.path().join("absent"), "mirror.log", Duration::ZERO).unwrap();
        assert_eq!(removed, 0);
    }
}
