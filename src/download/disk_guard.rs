//! Free-space monitoring for the storage volume.
//!
//! A background task samples free space on a fixed interval and publishes a
//! [`DiskState`] through a `tokio::sync::watch` channel. Workers only read the
//! latest sample; dropping below the threshold pauses admission of new work
//! and is never reported as an item error.

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use super::transfer::PARTIAL_SUFFIX;

/// Default free-space floor (50 GiB).
pub const DEFAULT_MIN_FREE_SPACE_BYTES: u64 = 50 * 1024 * 1024 * 1024;

/// Default sampling interval (60 seconds).
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Source of free-space measurements.
pub trait SpaceProbe: Send + Sync + fmt::Debug {
    /// Returns the bytes available to this process on the volume holding `path`.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the volume cannot be queried.
    fn free_bytes(&self, path: &Path) -> io::Result<u64>;
}

/// [`SpaceProbe`] backed by `statvfs`/`GetDiskFreeSpaceEx` via `fs2`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn free_bytes(&self, path: &Path) -> io::Result<u64> {
        fs2::available_space(path)
    }
}

/// Latest free-space sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskState {
    /// Bytes available, or `None` before the first successful sample.
    pub free_bytes: Option<u64>,
    /// Configured floor.
    pub threshold: u64,
    /// True when `free_bytes < threshold`.
    pub below_threshold: bool,
    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
}

impl DiskState {
    fn unknown(threshold: u64) -> Self {
        Self {
            free_bytes: None,
            threshold,
            below_threshold: false,
            sampled_at: Utc::now(),
        }
    }

    fn measured(free_bytes: u64, threshold: u64) -> Self {
        Self {
            free_bytes: Some(free_bytes),
            threshold,
            below_threshold: free_bytes < threshold,
            sampled_at: Utc::now(),
        }
    }
}

/// Capacity of the volume holding the storage root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DiskUsage {
    /// Volume size.
    pub total_bytes: u64,
    /// Bytes in use, including space reserved for the superuser.
    pub used_bytes: u64,
    /// Bytes available to this process.
    pub free_bytes: u64,
    /// Configured floor.
    pub threshold: u64,
    /// True when `free_bytes` is at or above `threshold`.
    pub sufficient: bool,
}

impl DiskUsage {
    /// Measures the volume holding `path`.
    ///
    /// A path that does not exist yet is measured at its nearest existing
    /// ancestor, so nothing is created.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the volume cannot be queried.
    pub fn measure(path: &Path, threshold: u64) -> io::Result<Self> {
        let existing = path
            .ancestors()
            .find(|p| p.exists())
            .unwrap_or_else(|| Path::new("."));
        let total_bytes = fs2::total_space(existing)?;
        let unreserved = fs2::free_space(existing)?;
        let free_bytes = fs2::available_space(existing)?;
        Ok(Self {
            total_bytes,
            used_bytes: total_bytes.saturating_sub(unreserved),
            free_bytes,
            threshold,
            sufficient: free_bytes >= threshold,
        })
    }

    /// Share of the volume in use, in percent.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn percent_used(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

/// Background monitor of free space under the storage root.
#[derive(Debug)]
pub struct DiskGuard {
    root: PathBuf,
    threshold: u64,
    interval: Duration,
    probe: Arc<dyn SpaceProbe>,
    state: watch::Sender<DiskState>,
}

impl DiskGuard {
    /// Creates a guard and takes one synchronous sample.
    #[must_use]
    pub fn new(
        root: impl Into<PathBuf>,
        threshold: u64,
        interval: Duration,
        probe: Arc<dyn SpaceProbe>,
    ) -> Self {
        let (state, _) = watch::channel(DiskState::unknown(threshold));
        let guard = Self {
            root: root.into(),
            threshold,
            interval,
            probe,
            state,
        };
        guard.sample_now();
        guard
    }

    /// Returns the storage root being watched.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the configured floor in bytes.
    #[must_use]
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Returns the latest sample.
    #[must_use]
    pub fn state(&self) -> DiskState {
        *self.state.borrow()
    }

    /// Returns true when the latest sample is below the floor.
    #[must_use]
    pub fn is_below_threshold(&self) -> bool {
        self.state.borrow().below_threshold
    }

    /// Subscribes to sample updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DiskState> {
        self.state.subscribe()
    }

    /// Samples free space immediately and publishes the result.
    ///
    /// A failed free-space read keeps the previous sample.
    pub fn sample_now(&self) -> DiskState {
        let previous = self.state();
        match self.probe.free_bytes(&self.root) {
            Ok(free) => {
                let next = DiskState::measured(free, self.threshold);
                if next.below_threshold && !previous.below_threshold {
                    warn!(
                        free_bytes = free,
                        threshold = self.threshold,
                        "free space below threshold, pausing new transfers"
                    );
                } else if !next.below_threshold && previous.below_threshold {
                    info!(free_bytes = free, "free space restored, resuming transfers");
                } else {
                    debug!(free_bytes = free, "disk sample");
                }
                self.state.send_replace(next);
                next
            }
            Err(e) => {
                warn!(
                    root = %self.root.display(),
                    error = %e,
                    "free-space check failed, keeping previous sample"
                );
                previous
            }
        }
    }

    /// Spawns the periodic sampler; it stops when `cancel` fires.
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(guard.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; `new` already sampled.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        guard.sample_now();
                    }
                }
            }
            debug!("disk monitor stopped");
        })
    }

    /// Waits until a sample reports space at or above the floor.
    ///
    /// Returns `false` if `cancel` fires first.
    pub async fn wait_for_space(&self, cancel: &CancellationToken) -> bool {
        if !self.is_below_threshold() {
            return true;
        }
        let mut rx = self.subscribe();
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            restored = async { rx.wait_for(|s| !s.below_threshold).await.is_ok() } => restored,
        }
    }

    /// Deletes partial artifacts under the root that no worker currently owns
    /// and no unfinished ledger record will resume from.
    ///
    /// `active` is consulted per file, so a transfer claimed during the scan
    /// keeps its artifact. Returns the number of bytes removed and re-samples
    /// free space.
    #[instrument(skip_all, fields(root = %self.root.display(), resumable = resumable.len()))]
    pub async fn reclaim(&self, active: Arc<DashSet<PathBuf>>, resumable: HashSet<PathBuf>) -> u64 {
        let root = self.root.clone();
        let reclaimed = tokio::task::spawn_blocking(move || {
            remove_orphaned_partials(&root, |path| {
                active.contains(path) || resumable.contains(path)
            })
        })
        .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "reclaim task failed");
                0
            });
        info!(reclaimed_bytes = reclaimed, "reclaimed orphaned partial files");
        self.sample_now();
        reclaimed
    }
}

fn remove_orphaned_partials(root: &Path, keep: impl Fn(&Path) -> bool) -> u64 {
    let mut reclaimed = 0;
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_partial = path
            .file_name()
            .is_some_and(|name| name.to_string_lossy().ends_with(PARTIAL_SUFFIX));
        if !is_partial || keep(path) {
            continue;
        }

        let len = entry.metadata().map(|m| m.len()).unwrap_or(0);
        match std::fs::remove_file(path) {
            Ok(()) => {
                debug!(path = %path.display(), bytes = len, "removed orphaned partial");
                reclaimed += len;
            }
            Err(e) => debug!(path = %path.display(), error = %e, "could not remove partial"),
        }
    }
    reclaimed
}
