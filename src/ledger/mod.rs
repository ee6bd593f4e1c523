//! Durable per-item transfer state.
//!
//! The [`Ledger`] maps each remote item path to a [`TransferRecord`] and is
//! the single source of truth for what remains to be done. Every mutation
//! happens under one coarse mutex; persistence serializes the map under that
//! mutex and writes it on a blocking thread, so workers never wait on disk.
//!
//! # Example
//!
//! ```no_run
//! use mirror_core::ledger::Ledger;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ledger = Ledger::open("data/download_progress.json", 10)?;
//! let snapshot = ledger.snapshot(3);
//! println!("{} completed, {} pending", snapshot.completed, snapshot.pending);
//! ledger.persist().await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod record;
mod store;

pub use error::LedgerError;
pub use record::{ErrorKind, TransferRecord, TransferStatus};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::remote::RemoteItem;

/// Per-status record counts, kept in step with the records themselves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerCounts {
    /// Records waiting to be transferred.
    pub pending: usize,
    /// Records owned by a worker.
    pub in_progress: usize,
    /// Records whose final file is in place.
    pub completed: usize,
    /// Records whose last attempt failed.
    pub failed: usize,
}

impl LedgerCounts {
    /// Recomputes counts from scratch.
    #[must_use]
    pub fn from_records(records: &BTreeMap<String, TransferRecord>) -> Self {
        let mut counts = Self::default();
        for record in records.values() {
            counts.add(record.status);
        }
        counts
    }

    /// Total number of records.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }

    fn slot(&mut self, status: TransferStatus) -> &mut usize {
        match status {
            TransferStatus::Pending => &mut self.pending,
            TransferStatus::InProgress => &mut self.in_progress,
            TransferStatus::Completed => &mut self.completed,
            TransferStatus::Failed => &mut self.failed,
        }
    }

    fn add(&mut self, status: TransferStatus) {
        *self.slot(status) += 1;
    }

    fn remove(&mut self, status: TransferStatus) {
        let slot = self.slot(status);
        *slot = slot.saturating_sub(1);
    }
}

/// Aggregate view of the ledger for status reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    /// Records waiting to be transferred.
    pub pending: usize,
    /// Records owned by a worker.
    pub in_progress: usize,
    /// Records whose final file is in place.
    pub completed: usize,
    /// Records whose last attempt failed.
    pub failed: usize,
    /// Failed records that a later run would retry automatically.
    pub failed_retryable: usize,
    /// Failed records that need `--retry-failed` or operator attention.
    pub failed_permanent: usize,
    /// Sum of known expected sizes.
    pub total_bytes: u64,
    /// Sum of recorded transferred bytes.
    pub transferred_bytes: u64,
}

impl StatusSnapshot {
    /// Total number of known items.
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    records: BTreeMap<String, TransferRecord>,
    counts: LedgerCounts,
    /// Terminal updates since the last persist.
    unsaved: usize,
    /// Bumped on every mutation; orders concurrent persists.
    generation: u64,
}

impl LedgerState {
    /// Applies `f` to the record at `path`, keeping counts consistent.
    fn modify<T>(
        &mut self,
        path: &str,
        f: impl FnOnce(&mut TransferRecord) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let record = self
            .records
            .get_mut(path)
            .ok_or_else(|| LedgerError::UnknownItem(path.to_string()))?;
        let before = record.status;
        let value = f(record)?;
        record.touch();
        let after = record.status;

        if before != after {
            self.counts.remove(before);
            self.counts.add(after);
            if matches!(after, TransferStatus::Completed | TransferStatus::Failed) {
                self.unsaved += 1;
            }
        }
        self.generation += 1;
        Ok(value)
    }

    fn insert(&mut self, path: String, record: TransferRecord) {
        if let Some(previous) = self.records.get(&path) {
            self.counts.remove(previous.status);
        }
        self.counts.add(record.status);
        self.records.insert(path, record);
        self.generation += 1;
    }
}

/// Durable, crash-consistent record of per-item transfer state.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    save_interval: usize,
    state: Mutex<LedgerState>,
    /// Generation of the newest snapshot on disk; held while writing.
    written: Arc<Mutex<u64>>,
}

impl Ledger {
    /// Opens the ledger at `path`, merging any snapshot already there.
    ///
    /// A snapshot that does not parse is moved aside and the ledger starts
    /// empty; partial files on disk still carry their resume offsets.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] if the ledger directory cannot be created
    /// or the existing file cannot be read.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>, save_interval: usize) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
        }

        let ledger = Self {
            path,
            save_interval: save_interval.max(1),
            state: Mutex::new(LedgerState::default()),
            written: Arc::new(Mutex::new(0)),
        };
        match ledger.load() {
            Ok(merged) => info!(records = merged, "ledger loaded"),
            Err(LedgerError::Corrupt { quarantined, .. }) => {
                warn!(
                    quarantined = %quarantined.display(),
                    "starting from an empty ledger"
                );
            }
            Err(e) => return Err(e),
        }
        Ok(ledger)
    }

    /// Loads the ledger at `path` for inspection without touching the disk.
    ///
    /// No directory is created and an unparsable file stays where it is.
    /// Nothing is written unless the caller persists explicitly.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unreadable`] for a file that does not parse, or
    /// [`LedgerError::Io`] if it cannot be read.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let ledger = Self {
            path: path.as_ref().to_path_buf(),
            save_interval: 1,
            state: Mutex::new(LedgerState::default()),
            written: Arc::new(Mutex::new(0)),
        };
        if let Some(file) = store::inspect_snapshot(&ledger.path)? {
            ledger.merge(file);
        }
        Ok(ledger)
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Merges the on-disk snapshot into memory and returns how many records it held.
    ///
    /// A `completed` record is never replaced by a non-completed one; records
    /// left `in_progress` by a crash come back as `pending`; otherwise the more
    /// recently updated record wins.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Corrupt`] after quarantining an unparsable file,
    /// or [`LedgerError::Io`] if the file cannot be read.
    pub fn load(&self) -> Result<usize, LedgerError> {
        let Some(file) = store::read_snapshot(&self.path)? else {
            return Ok(0);
        };
        Ok(self.merge(file))
    }

    fn merge(&self, file: store::LedgerFile) -> usize {
        let loaded = file.records.len();

        let mut state = self.lock();
        for (path, mut incoming) in file.records {
            if incoming.status == TransferStatus::InProgress {
                incoming.status = TransferStatus::Pending;
                incoming.attempts = incoming.attempts.saturating_sub(1);
            }
            let keep_existing = state.records.get(&path).is_some_and(|existing| {
                existing.status == TransferStatus::Completed
                    || (incoming.status != TransferStatus::Completed
                        && existing.last_updated >= incoming.last_updated)
            });
            if !keep_existing {
                state.insert(path, incoming);
            }
        }
        loaded
    }

    /// Returns a copy of the record for `path`, if any.
    #[must_use]
    pub fn record(&self, path: &str) -> Option<TransferRecord> {
        self.lock().records.get(path).cloned()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Returns true when the ledger holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a discovered item and returns its current status.
    ///
    /// New items start `pending`. Known items pick up an expected size or
    /// content tag the record was missing.
    pub fn discover(&self, item: &RemoteItem) -> TransferStatus {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(item.path()) {
            let mut changed = false;
            if record.expected_size.is_none() && item.size().is_some() {
                record.expected_size = item.size();
                changed = true;
            }
            if record.content_tag.is_none() && item.content_tag().is_some() {
                record.content_tag = item.content_tag().map(str::to_string);
                changed = true;
            }
            let status = record.status;
            if changed {
                record.touch();
                state.generation += 1;
            }
            return status;
        }

        state.insert(
            item.path().to_string(),
            TransferRecord::new_pending(item.size(), item.content_tag().map(str::to_string)),
        );
        TransferStatus::Pending
    }

    /// Applies a status change with the record state machine enforced.
    ///
    /// `bytes_transferred` replaces the recorded count; `error` is stored when
    /// the new status is `failed`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownItem`], [`LedgerError::InvalidTransition`],
    /// or [`LedgerError::BytesExceedExpected`].
    pub fn update(
        &self,
        path: &str,
        status: TransferStatus,
        bytes_transferred: u64,
        error: Option<(ErrorKind, String)>,
    ) -> Result<(), LedgerError> {
        self.lock().modify(path, |record| {
            if !record.status.can_transition_to(status) {
                return Err(LedgerError::invalid_transition(path, record.status, status));
            }
            if let Some(expected) = record.expected_size {
                if bytes_transferred > expected {
                    return Err(LedgerError::BytesExceedExpected {
                        path: path.to_string(),
                        bytes: bytes_transferred,
                        expected,
                    });
                }
            }
            record.status = status;
            record.bytes_transferred = bytes_transferred;
            match (status, error) {
                (TransferStatus::Failed, Some((kind, message))) => {
                    record.last_error = Some(kind);
                    record.last_error_message = Some(message);
                }
                (TransferStatus::Completed, _) => {
                    record.last_error = None;
                    record.last_error_message = None;
                }
                _ => {}
            }
            Ok(())
        })
    }

    /// Claims a pending item for a worker and returns the attempt number.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the record is `pending`.
    pub fn begin(&self, path: &str) -> Result<u32, LedgerError> {
        self.lock().modify(path, |record| {
            if record.status != TransferStatus::Pending {
                return Err(LedgerError::invalid_transition(
                    path,
                    record.status,
                    TransferStatus::InProgress,
                ));
            }
            record.status = TransferStatus::InProgress;
            record.attempts += 1;
            Ok(record.attempts)
        })
    }

    /// Records durable progress for an in-flight item.
    ///
    /// # Errors
    ///
    /// See [`Ledger::update`].
    pub fn report_progress(&self, path: &str, bytes: u64) -> Result<(), LedgerError> {
        self.update(path, TransferStatus::InProgress, bytes, None)
    }

    /// Marks an item completed with its final size.
    ///
    /// # Errors
    ///
    /// See [`Ledger::update`].
    pub fn complete(&self, path: &str, bytes: u64) -> Result<(), LedgerError> {
        {
            let mut state = self.lock();
            if let Some(record) = state.records.get_mut(path) {
                if record.expected_size != Some(bytes) {
                    record.expected_size = Some(bytes);
                }
            }
        }
        self.update(path, TransferStatus::Completed, bytes, None)
    }

    /// Marks an item failed, keeping the bytes already on disk.
    ///
    /// # Errors
    ///
    /// See [`Ledger::update`].
    pub fn fail(
        &self,
        path: &str,
        kind: ErrorKind,
        message: impl Into<String>,
        bytes: u64,
    ) -> Result<(), LedgerError> {
        self.update(
            path,
            TransferStatus::Failed,
            bytes,
            Some((kind, message.into())),
        )
    }

    /// Returns a failed item to `pending` for an automatic retry.
    ///
    /// The attempt counter and transferred bytes are kept.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the record is `failed`.
    pub fn requeue(&self, path: &str) -> Result<(), LedgerError> {
        self.lock().modify(path, |record| {
            if record.status != TransferStatus::Failed {
                return Err(LedgerError::invalid_transition(
                    path,
                    record.status,
                    TransferStatus::Pending,
                ));
            }
            record.status = TransferStatus::Pending;
            Ok(())
        })
    }

    /// Returns an in-flight item to `pending` without charging it an attempt.
    ///
    /// Used when a transfer yields to cancellation or disk pressure.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidTransition`] unless the record is `in_progress`.
    pub fn suspend(&self, path: &str, bytes: u64) -> Result<(), LedgerError> {
        self.lock().modify(path, |record| {
            if record.status != TransferStatus::InProgress {
                return Err(LedgerError::invalid_transition(
                    path,
                    record.status,
                    TransferStatus::Pending,
                ));
            }
            record.status = TransferStatus::Pending;
            record.bytes_transferred = record
                .expected_size
                .map_or(bytes, |expected| bytes.min(expected));
            record.attempts = record.attempts.saturating_sub(1);
            Ok(())
        })
    }

    /// Resets every failed record to `pending` with a fresh attempt budget.
    ///
    /// Returns how many records were reset.
    #[instrument(skip(self))]
    pub fn retry_failed(&self) -> usize {
        let mut state = self.lock();
        let failed: Vec<String> = state
            .records
            .iter()
            .filter(|(_, r)| r.status == TransferStatus::Failed)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &failed {
            let reset = state.modify(path, |record| {
                record.status = TransferStatus::Pending;
                record.attempts = 0;
                Ok(())
            });
            if let Err(e) = reset {
                warn!(path = %path, error = %e, "failed to reset record");
            }
        }
        // Resets are worth saving even though they are not terminal updates.
        state.unsaved += failed.len();
        info!(reset = failed.len(), "failed records returned to pending");
        failed.len()
    }

    /// Records the size the protocol reported for an item.
    ///
    /// A smaller size than the recorded byte count means the remote item
    /// changed; the byte count is clamped down.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::UnknownItem`] if the item is not recorded.
    pub fn set_expected_size(&self, path: &str, size: u64) -> Result<(), LedgerError> {
        self.lock().modify(path, |record| {
            if record.expected_size != Some(size) {
                debug!(path, previous = ?record.expected_size, size, "expected size updated");
            }
            record.expected_size = Some(size);
            record.bytes_transferred = record.bytes_transferred.min(size);
            Ok(())
        })
    }

    /// Returns the per-status counts.
    #[must_use]
    pub fn counts(&self) -> LedgerCounts {
        self.lock().counts
    }

    /// Returns the aggregate status view.
    ///
    /// `max_attempts` decides which failed records count as retryable.
    #[must_use]
    pub fn snapshot(&self, max_attempts: u32) -> StatusSnapshot {
        let state = self.lock();
        let mut snapshot = StatusSnapshot {
            pending: state.counts.pending,
            in_progress: state.counts.in_progress,
            completed: state.counts.completed,
            failed: state.counts.failed,
            ..StatusSnapshot::default()
        };
        for record in state.records.values() {
            snapshot.total_bytes += record.expected_size.unwrap_or(0);
            snapshot.transferred_bytes += record.bytes_transferred;
            if record.status == TransferStatus::Failed {
                if record.is_retryable(max_attempts) {
                    snapshot.failed_retryable += 1;
                } else {
                    snapshot.failed_permanent += 1;
                }
            }
        }
        snapshot
    }

    /// Known items that still need work, partial progress first.
    ///
    /// Includes `pending` records and failed records that are retryable under
    /// `max_attempts`. Within each group items keep path order.
    #[must_use]
    pub fn outstanding(&self, max_attempts: u32) -> Vec<(String, TransferRecord)> {
        let state = self.lock();
        let (mut partial, rest): (Vec<_>, Vec<_>) = state
            .records
            .iter()
            .filter(|(_, r)| r.status == TransferStatus::Pending || r.is_retryable(max_attempts))
            .map(|(path, record)| (path.clone(), record.clone()))
            .partition(|(_, record)| record.has_partial_progress());
        partial.extend(rest);
        partial
    }

    /// Paths of unfinished items that already have bytes on disk.
    #[must_use]
    pub fn resumable_paths(&self) -> Vec<String> {
        self.lock()
            .records
            .iter()
            .filter(|(_, record)| record.has_partial_progress())
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Serializes the current state; returns the generation it covers.
    fn serialize(&self) -> Result<(u64, Vec<u8>), LedgerError> {
        let mut state = self.lock();
        let doc = store::LedgerFileRef {
            version: store::FORMAT_VERSION,
            saved_at: Utc::now(),
            counts: state.counts,
            records: &state.records,
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        state.unsaved = 0;
        Ok((state.generation, bytes))
    }

    fn write_if_newer(
        path: &Path,
        written: &Mutex<u64>,
        generation: u64,
        bytes: &[u8],
    ) -> Result<bool, LedgerError> {
        let mut last = written.lock().unwrap_or_else(PoisonError::into_inner);
        if generation < *last {
            return Ok(false);
        }
        store::write_snapshot(path, bytes)?;
        *last = generation;
        Ok(true)
    }

    /// Writes the current state to disk.
    ///
    /// Every update applied before this call is durable once it returns.
    /// Memory is never rolled back on failure.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Io`] or [`LedgerError::Serialize`] when the
    /// snapshot cannot be written.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub async fn persist(&self) -> Result<(), LedgerError> {
        let (generation, bytes) = self.serialize()?;
        let path = self.path.clone();
        let written = Arc::clone(&self.written);
        let wrote = tokio::task::spawn_blocking(move || {
            Self::write_if_newer(&path, &written, generation, &bytes)
        })
        .await
        .map_err(|e| LedgerError::Task(e.to_string()))??;

        if wrote {
            debug!(generation, "ledger persisted");
        } else {
            debug!(generation, "newer snapshot already on disk");
        }
        Ok(())
    }

    /// Synchronous variant of [`Ledger::persist`] for drop paths.
    ///
    /// # Errors
    ///
    /// Same as [`Ledger::persist`].
    pub fn persist_blocking(&self) -> Result<(), LedgerError> {
        let (generation, bytes) = self.serialize()?;
        Self::write_if_newer(&self.path, &self.written, generation, &bytes)?;
        Ok(())
    }

    /// Persists when enough terminal updates have accumulated.
    ///
    /// A failed persist is logged as degraded durability; the run continues.
    pub async fn persist_if_due(&self) {
        if self.lock().unsaved < self.save_interval {
            return;
        }
        if let Err(e) = self.persist().await {
            warn!(error = %e, "ledger persist failed, durability degraded");
        }
    }

    /// Returns a guard that persists the ledger synchronously when dropped.
    #[must_use]
    pub fn flush_guard(self: &Arc<Self>) -> LedgerFlushGuard {
        LedgerFlushGuard {
            ledger: Arc::clone(self),
        }
    }
}

/// Persists the ledger when dropped, including during unwinding.
#[derive(Debug)]
pub struct LedgerFlushGuard {
    ledger: Arc<Ledger>,
}

impl Drop for LedgerFlushGuard {
    fn drop(&mut self) {
        if let Err(e) = self.ledger.persist_blocking() {
            warn!(error = %e, "final ledger flush failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(path: &str, size: Option<u64>) -> RemoteItem {
        RemoteItem::new(path, size, None).unwrap()
    }

    fn ledger_in(dir: &TempDir) -> Ledger {
        Ledger::open(dir.path().join("progress.json"), 2).unwrap()
    }

    #[test]
    fn test_discover_inserts_pending_once() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        assert_eq!(ledger.discover(&item("compound/a", None)), TransferStatus::Pending);
        assert_eq!(ledger.discover(&item("compound/a", Some(5))), TransferStatus::Pending);
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.record("compound/a").unwrap().expected_size, Some(5));
        assert_eq!(ledger.counts().pending, 1);
    }

    #[test]
    fn test_happy_path_state_machine() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.discover(&item("compound/a", Some(10)));

        assert_eq!(ledger.begin("compound/a").unwrap(), 1);
        ledger.report_progress("compound/a", 4).unwrap();
        ledger.complete("compound/a", 10).unwrap();

        let record = ledger.record("compound/a").unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.bytes_transferred, 10);
        let counts = ledger.counts();
        assert_eq!((counts.pending, counts.in_progress, counts.completed), (0, 0, 1));
    }

    #[test]
    fn test_completed_rejects_further_updates() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.discover(&item("a", Some(1)));
        ledger.begin("a").unwrap();
        ledger.complete("a", 1).unwrap();

        assert!(matches!(
            ledger.update("a", TransferStatus::Pending, 0, None),
            Err(LedgerError::InvalidTransition { .. })
        ));
        assert!(ledger.begin("a").is_err());
    }

    #[test]
    fn test_bytes_cannot_exceed_expected() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.discover(&item("a", Some(10)));
        ledger.begin("a").unwrap();
        assert!(matches!(
            ledger.report_progress("a", 11),
            Err(LedgerError::BytesExceedExpected { .. })
        ));
    }

    #[test]
    fn test_fail_requeue_keeps_attempts_and_bytes() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.discover(&item("a", Some(100)));
        ledger.begin("a").unwrap();
        ledger.fail("a", ErrorKind::Connection, "reset", 40).unwrap();
        ledger.requeue("a").unwrap();

        let record = ledger.record("a").unwrap();
        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.bytes_transferred, 40);
        assert_eq!(record.last_error, Some(ErrorKind::Connection));
    }

    #[test]
    fn test_retry_failed_resets_attempts() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.discover(&item("a", None));
        ledger.begin("a").unwrap();
        ledger.fail("a", ErrorKind::NotFound, "gone", 0).unwrap();

        assert_eq!(ledger.retry_failed(), 1);
        let record = ledger.record("a").unwrap();
        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(ledger.counts().failed, 0);
    }

    #[test]
    fn test_suspend_gives_back_attempt() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.discover(&item("a", None));
        ledger.begin("a").unwrap();
        ledger.suspend("a", 7).unwrap();

        let record = ledger.record("a").unwrap();
        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.bytes_transferred, 7);
    }

    #[test]
    fn test_snapshot_splits_failed_by_retryability() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        for (path, kind) in [("a", ErrorKind::Timeout), ("b", ErrorKind::NotFound)] {
            ledger.discover(&item(path, Some(10)));
            ledger.begin(path).unwrap();
            ledger.fail(path, kind, "x", 3).unwrap();
        }
        let snapshot = ledger.snapshot(3);
        assert_eq!(snapshot.failed, 2);
        assert_eq!(snapshot.failed_retryable, 1);
        assert_eq!(snapshot.failed_permanent, 1);
        assert_eq!(snapshot.total_bytes, 20);
        assert_eq!(snapshot.transferred_bytes, 6);
    }

    #[test]
    fn test_outstanding_orders_partial_progress_first() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        ledger.discover(&item("a", Some(10)));
        ledger.discover(&item("b", Some(10)));
        ledger.begin("b").unwrap();
        ledger.suspend("b", 5).unwrap();

        let order: Vec<String> = ledger.outstanding(3).into_iter().map(|(p, _)| p).collect();
        assert_eq!(order, vec!["b".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn test_persist_and_reload_turns_in_progress_into_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        {
            let ledger = Ledger::open(&path, 10).unwrap();
            ledger.discover(&item("a", Some(10)));
            ledger.discover(&item("b", Some(10)));
            ledger.begin("a").unwrap();
            ledger.report_progress("a", 4).unwrap();
            ledger.begin("b").unwrap();
            ledger.complete("b", 10).unwrap();
            ledger.persist().await.unwrap();
        }

        let reloaded = Ledger::open(&path, 10).unwrap();
        let a = reloaded.record("a").unwrap();
        assert_eq!(a.status, TransferStatus::Pending);
        assert_eq!(a.bytes_transferred, 4);
        assert_eq!(a.attempts, 0);
        assert_eq!(reloaded.record("b").unwrap().status, TransferStatus::Completed);
        assert_eq!(reloaded.counts().completed, 1);
    }

    #[test]
    fn test_load_never_downgrades_completed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let ledger = Ledger::open(&path, 10).unwrap();
        ledger.discover(&item("a", Some(1)));
        ledger.persist_blocking().unwrap();

        ledger.begin("a").unwrap();
        ledger.complete("a", 1).unwrap();
        ledger.load().unwrap();

        assert_eq!(ledger.record("a").unwrap().status, TransferStatus::Completed);
    }

    #[test]
    fn test_flush_guard_persists_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let ledger = Arc::new(Ledger::open(&path, 1000).unwrap());
        ledger.discover(&item("a", None));
        {
            let _guard = ledger.flush_guard();
        }
        assert!(path.exists());
        let reloaded = Ledger::open(&path, 10).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_open_quarantines_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        std::fs::write(&path, "garbage").unwrap();

        let ledger = Ledger::open(&path, 10).unwrap();
        assert!(ledger.is_empty());
        let quarantined = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .any(|e| e.file_name().to_string_lossy().contains(".corrupt-"));
        assert!(quarantined);
    }

    #[test]
    fn test_read_only_open_changes_nothing_on_disk() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("state").join("progress.json");
        let ledger = Ledger::open_read_only(&missing).unwrap();
        assert!(ledger.is_empty());
        assert!(!dir.path().join("state").exists());

        let corrupt = dir.path().join("progress.json");
        std::fs::write(&corrupt, "garbage").unwrap();
        assert!(matches!(
            Ledger::open_read_only(&corrupt),
            Err(LedgerError::Unreadable { .. })
        ));
        assert_eq!(std::fs::read_to_string(&corrupt).unwrap(), "garbage");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_read_only_open_reports_saved_records() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let ledger = Ledger::open(&path, 10).unwrap();
        ledger.discover(&item("a", Some(10)));
        ledger.discover(&item("b", Some(10)));
        ledger.begin("a").unwrap();
        ledger.complete("a", 10).unwrap();
        ledger.persist().await.unwrap();

        let snapshot = Ledger::open_read_only(&path).unwrap().snapshot(3);
        assert_eq!((snapshot.completed, snapshot.pending), (1, 1));
        assert_eq!(snapshot.transferred_bytes, 10);
    }

    #[test]
    fn test_resumable_paths_lists_unfinished_partials() {
        let dir = TempDir::new().unwrap();
        let ledger = ledger_in(&dir);
        for name in ["a", "b", "c"] {
            ledger.discover(&item(name, Some(10)));
            ledger.begin(name).unwrap();
        }
        ledger.report_progress("a", 4).unwrap();
        ledger.suspend("a", 4).unwrap();
        ledger.complete("b", 10).unwrap();

        assert_eq!(ledger.resumable_paths(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_persist_if_due_respects_interval() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let ledger = Ledger::open(&path, 2).unwrap();
        for name in ["a", "b"] {
            ledger.discover(&item(name, None));
            ledger.begin(name).unwrap();
        }

        ledger.complete("a", 0).unwrap();
        ledger.persist_if_due().await;
        assert!(!path.exists());

        ledger.complete("b", 0).unwrap();
        ledger.persist_if_due().await;
        assert!(path.exists());
    }
}
