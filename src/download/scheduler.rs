//! Work scheduler: enumeration, ordering, and the bounded worker pool.
//!
//! [`Engine::run`] feeds one shared queue from a producer task. Known items
//! with partial progress go first, then other outstanding items from the
//! ledger, then whatever enumeration discovers. `max_concurrent` workers pull
//! from the queue, each driving a [`TransferUnit`] and retrying transient
//! failures with backoff.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mirror_core::{Engine, EngineConfig, HttpProtocolClient, Selection};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::default();
//! let client = HttpProtocolClient::new(&config.base_url, 30, 300)?;
//! let engine = Engine::new(&config, Arc::new(client))?;
//! let stats = engine.run(&Selection::default()).await?;
//! println!("completed {}, failed {}", stats.completed(), stats.failed());
//! # Ok(())
//! # }
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::disk_guard::{DiskGuard, FsSpaceProbe, SpaceProbe};
use super::error::EngineError;
use super::rate_governor::{RateGovernor, RateState};
use super::retry::{RetryDecision, RetryPolicy, classify_error_kind};
use super::transfer::{TransferOutcome, TransferUnit};
use crate::config::EngineConfig;
use crate::ledger::{ErrorKind, Ledger, StatusSnapshot, TransferStatus};
use crate::remote::{EntryKind, ProtocolClient, ProtocolError, RemoteEntry, RemoteItem};

/// What one [`Engine::run`] call works on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    /// Categories to mirror; `None` means every configured category.
    pub categories: Option<Vec<String>>,
    /// Reset failed records to `pending` with a fresh attempt budget first.
    pub retry_failed: bool,
}

/// Counters for one run.
///
/// Uses atomic counters so workers can update them concurrently.
#[derive(Debug, Default)]
pub struct RunStats {
    completed: AtomicUsize,
    failed: AtomicUsize,
    retried: AtomicUsize,
    skipped: AtomicUsize,
    listing_failures: AtomicUsize,
    bytes_transferred: AtomicU64,
    interrupted: AtomicBool,
}

impl RunStats {
    /// Creates a stats tracker with zero counts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Items completed during this run.
    #[must_use]
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Items left `failed` after their last attempt this run.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    /// Automatic retries scheduled this run.
    #[must_use]
    pub fn retried(&self) -> usize {
        self.retried.load(Ordering::SeqCst)
    }

    /// Items already complete when discovered.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Directories that could not be listed after retries.
    #[must_use]
    pub fn listing_failures(&self) -> usize {
        self.listing_failures.load(Ordering::SeqCst)
    }

    /// Bytes of items fetched to completion this run.
    #[must_use]
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred.load(Ordering::SeqCst)
    }

    /// True when the run stopped because of [`Engine::cancel`].
    #[must_use]
    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// True when nothing failed and the run was not interrupted.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.listing_failures() == 0 && !self.interrupted()
    }

    fn increment(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn copy_from(&self, other: &Self) {
        self.completed.store(other.completed(), Ordering::SeqCst);
        self.failed.store(other.failed(), Ordering::SeqCst);
        self.retried.store(other.retried(), Ordering::SeqCst);
        self.skipped.store(other.skipped(), Ordering::SeqCst);
        self.listing_failures
            .store(other.listing_failures(), Ordering::SeqCst);
        self.bytes_transferred
            .store(other.bytes_transferred(), Ordering::SeqCst);
        self.interrupted.store(other.interrupted(), Ordering::SeqCst);
    }
}

/// The orchestration engine.
///
/// Owns the ledger, the rate governor, and the disk guard for one storage
/// root. `run` and `cancel` are the only externally triggered actions;
/// `status` may be called at any time.
pub struct Engine {
    client: Arc<dyn ProtocolClient>,
    ledger: Arc<Ledger>,
    governor: Arc<RateGovernor>,
    disk: Arc<DiskGuard>,
    transfer: TransferUnit,
    retry_policy: RetryPolicy,
    categories: Vec<String>,
    concurrency: usize,
    reclaim_on_pressure: bool,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("ledger", &self.ledger.path())
            .field("storage_root", &self.disk.root())
            .field("concurrency", &self.concurrency)
            .field("categories", &self.categories)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Creates an engine that measures free space with [`FsSpaceProbe`].
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] for an invalid configuration,
    /// [`EngineError::StorageRoot`] when the data directory cannot be
    /// created, and [`EngineError::Ledger`] when the ledger cannot be opened.
    pub fn new(config: &EngineConfig, client: Arc<dyn ProtocolClient>) -> Result<Self, EngineError> {
        Self::with_space_probe(config, client, Arc::new(FsSpaceProbe))
    }

    /// Creates an engine with a custom free-space source.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::new`].
    #[instrument(level = "debug", skip_all, fields(data_dir = %config.data_dir.display()))]
    pub fn with_space_probe(
        config: &EngineConfig,
        client: Arc<dyn ProtocolClient>,
        probe: Arc<dyn SpaceProbe>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir).map_err(|source| EngineError::StorageRoot {
            path: config.data_dir.clone(),
            source,
        })?;

        let ledger = Arc::new(Ledger::open(
            &config.ledger.path,
            config.ledger.save_interval_items,
        )?);
        let governor = Arc::new(RateGovernor::new(config.rate_governor_config()));
        let disk = Arc::new(DiskGuard::new(
            &config.data_dir,
            config.disk.min_free_space_bytes,
            config.disk_check_interval(),
            probe,
        ));
        let transfer = TransferUnit::new(
            Arc::clone(&client),
            Arc::clone(&ledger),
            Arc::clone(&governor),
            Arc::clone(&disk),
            config.transfer_settings(),
        );

        debug!(
            concurrency = config.max_concurrent,
            max_attempts = config.max_attempts,
            known_items = ledger.len(),
            "creating engine"
        );

        Ok(Self {
            client,
            ledger,
            governor,
            disk,
            transfer,
            retry_policy: config.retry_policy(),
            categories: config.categories.clone(),
            concurrency: config.max_concurrent,
            reclaim_on_pressure: config.disk.reclaim_on_pressure,
            cancel: CancellationToken::new(),
        })
    }

    /// Returns the ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Returns the disk guard.
    #[must_use]
    pub fn disk(&self) -> &Arc<DiskGuard> {
        &self.disk
    }

    /// Returns the current rate governor state.
    #[must_use]
    pub fn rate_state(&self) -> RateState {
        self.governor.snapshot()
    }

    /// Returns the configured worker count.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Returns the aggregate ledger status.
    #[must_use]
    pub fn status(&self) -> StatusSnapshot {
        self.ledger.snapshot(self.retry_policy.max_attempts())
    }

    /// Resets every failed record to `pending`; returns how many were reset.
    pub fn retry_failed(&self) -> usize {
        self.ledger.retry_failed()
    }

    /// Stops dispatch; in-flight transfers suspend at their next checkpoint.
    pub fn cancel(&self) {
        info!("cancellation requested");
        self.cancel.cancel();
    }

    /// Returns a handle that cancels this engine when triggered.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Lazily walks `categories`, yielding every file below them.
    ///
    /// Each listing is paced by the rate governor and retried under the
    /// retry policy. A directory that cannot be listed yields one
    /// [`EngineError::Enumeration`] and the walk continues. The stream ends
    /// early on cancellation.
    #[must_use]
    pub fn enumerate(&self, categories: &[String]) -> BoxStream<'static, Result<RemoteItem, EngineError>> {
        let walk = Walk {
            client: Arc::clone(&self.client),
            governor: Arc::clone(&self.governor),
            policy: self.retry_policy.clone(),
            cancel: self.cancel.clone(),
            dirs: categories.iter().cloned().collect(),
            ready: VecDeque::new(),
        };
        stream::unfold(walk, Walk::next).boxed()
    }

    /// Mirrors the selection until the queue drains or [`Engine::cancel`] fires.
    ///
    /// Item errors never abort the run; they are counted in [`RunStats`] and
    /// recorded in the ledger. The ledger is persisted before returning.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Task`] if the producer task panics.
    #[instrument(skip(self, selection), fields(retry_failed = selection.retry_failed))]
    pub async fn run(&self, selection: &Selection) -> Result<RunStats, EngineError> {
        let _flush = self.ledger.flush_guard();
        let stats = Arc::new(RunStats::new());

        if selection.retry_failed {
            self.ledger.retry_failed();
        }

        let categories = selection
            .categories
            .clone()
            .unwrap_or_else(|| self.categories.clone());
        info!(
            categories = ?categories,
            workers = self.concurrency,
            known_items = self.ledger.len(),
            "starting run"
        );

        let monitor_cancel = self.cancel.child_token();
        let monitor = self.disk.spawn_monitor(monitor_cancel.clone());

        let (tx, rx) = mpsc::channel::<RemoteItem>(self.concurrency * 2);
        let producer = Producer {
            ledger: Arc::clone(&self.ledger),
            stats: Arc::clone(&stats),
            cancel: self.cancel.clone(),
            max_attempts: self.retry_policy.max_attempts(),
            categories: categories.clone(),
            tx,
        };
        let discovered = self.enumerate(&categories);
        let producer_handle = tokio::spawn(producer.run(discovered));

        let worker = Arc::new(Worker {
            transfer: self.transfer.clone(),
            ledger: Arc::clone(&self.ledger),
            disk: Arc::clone(&self.disk),
            policy: self.retry_policy.clone(),
            cancel: self.cancel.clone(),
            stats: Arc::clone(&stats),
            reclaim_on_pressure: self.reclaim_on_pressure,
            reclaimed: AtomicBool::new(false),
            queue: Mutex::new(rx),
        });
        let handles: Vec<_> = (0..self.concurrency)
            .map(|id| {
                let worker = Arc::clone(&worker);
                tokio::spawn(async move { worker.run(id).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker task panicked");
            }
        }
        let produced = producer_handle.await;

        monitor_cancel.cancel();
        if let Err(e) = monitor.await {
            warn!(error = %e, "disk monitor task failed");
        }
        if let Err(e) = self.ledger.persist().await {
            warn!(error = %e, "ledger persist failed at end of run");
        }
        produced.map_err(|e| EngineError::Task(e.to_string()))?;

        stats
            .interrupted
            .store(self.cancel.is_cancelled(), Ordering::SeqCst);
        info!(
            completed = stats.completed(),
            failed = stats.failed(),
            retried = stats.retried(),
            skipped = stats.skipped(),
            bytes = stats.bytes_transferred(),
            interrupted = stats.interrupted(),
            "run finished"
        );

        // Workers and producer are joined, so this is the last reference.
        Ok(Arc::try_unwrap(stats).unwrap_or_else(|shared| {
            let copy = RunStats::new();
            copy.copy_from(&shared);
            copy
        }))
    }
}

/// Returns true when `path` lies under one of `categories`.
fn in_selection(categories: &[String], path: &str) -> bool {
    categories.iter().any(|category| {
        let category = category.trim_matches('/');
        path == category
            || path
                .strip_prefix(category)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// Feeds the worker queue: outstanding ledger items first, then discoveries.
struct Producer {
    ledger: Arc<Ledger>,
    stats: Arc<RunStats>,
    cancel: CancellationToken,
    max_attempts: u32,
    categories: Vec<String>,
    tx: mpsc::Sender<RemoteItem>,
}

impl Producer {
    async fn run(self, mut discovered: BoxStream<'static, Result<RemoteItem, EngineError>>) {
        let mut queued = HashSet::new();

        let outstanding = self.ledger.outstanding(self.max_attempts);
        for (path, record) in outstanding {
            if !in_selection(&self.categories, &path) {
                continue;
            }
            let Some(item) = RemoteItem::new(&path, record.expected_size, record.content_tag) else {
                warn!(path = %path, "skipping unsafe ledger path");
                continue;
            };
            if !self.send(item).await {
                return;
            }
            queued.insert(path);
        }
        debug!(resumed = queued.len(), "queued outstanding items");

        while let Some(next) = discovered.next().await {
            let item = match next {
                Ok(item) => item,
                Err(e) => {
                    warn!(error = %e, "listing failed, continuing with other directories");
                    RunStats::increment(&self.stats.listing_failures);
                    continue;
                }
            };
            if queued.contains(item.path()) {
                continue;
            }

            let eligible = match self.ledger.discover(&item) {
                TransferStatus::Pending => true,
                TransferStatus::Completed => {
                    RunStats::increment(&self.stats.skipped);
                    false
                }
                TransferStatus::Failed => self
                    .ledger
                    .record(item.path())
                    .is_some_and(|r| r.is_retryable(self.max_attempts)),
                TransferStatus::InProgress => false,
            };
            if !eligible {
                continue;
            }
            let path = item.path().to_string();
            if !self.send(item).await {
                return;
            }
            queued.insert(path);
        }
        debug!(queued = queued.len(), "enumeration finished");
    }

    /// Returns false when the run was cancelled or all workers are gone.
    async fn send(&self, item: RemoteItem) -> bool {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(item) => sent.is_ok(),
        }
    }
}

/// State shared by the worker pool.
struct Worker {
    transfer: TransferUnit,
    ledger: Arc<Ledger>,
    disk: Arc<DiskGuard>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    stats: Arc<RunStats>,
    reclaim_on_pressure: bool,
    reclaimed: AtomicBool,
    queue: Mutex<mpsc::Receiver<RemoteItem>>,
}

impl Worker {
    async fn run(&self, id: usize) {
        debug!(worker = id, "worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = {
                let mut queue = self.queue.lock().await;
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => None,
                    item = queue.recv() => item,
                }
            };
            let Some(item) = next else {
                break;
            };
            self.process(&item).await;
        }
        debug!(worker = id, "worker stopped");
    }

    #[instrument(skip(self, item), fields(path = %item.path()))]
    async fn process(&self, item: &RemoteItem) {
        let path = item.path();
        loop {
            if !self.wait_for_disk().await {
                return;
            }
            if let Some(record) = self.ledger.record(path)
                && record.status == TransferStatus::Failed
                && let Err(e) = self.ledger.requeue(path)
            {
                warn!(error = %e, "could not requeue failed item");
                return;
            }

            let outcome = match self.transfer.transfer(item, &self.cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "could not claim item");
                    return;
                }
            };

            match outcome {
                TransferOutcome::Completed { bytes, fetched } => {
                    RunStats::increment(&self.stats.completed);
                    if fetched {
                        self.stats
                            .bytes_transferred
                            .fetch_add(bytes, Ordering::SeqCst);
                    }
                    self.ledger.persist_if_due().await;
                    return;
                }
                TransferOutcome::Deferred { bytes } => {
                    debug!(bytes, "deferred for disk space");
                }
                TransferOutcome::Cancelled { .. } => return,
                TransferOutcome::Failed {
                    kind,
                    attempt,
                    error,
                    ..
                } => {
                    self.ledger.persist_if_due().await;
                    if !self.schedule_retry(kind, attempt, &error).await {
                        return;
                    }
                }
            }
        }
    }

    /// Sleeps out the backoff for a retryable failure.
    ///
    /// Returns false when the item stays failed or the run was cancelled.
    async fn schedule_retry(&self, kind: ErrorKind, attempt: u32, error: &str) -> bool {
        match self.policy.should_retry(classify_error_kind(kind), attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                info!(
                    attempt = next_attempt,
                    max_attempts = self.policy.max_attempts(),
                    delay_ms = delay.as_millis(),
                    error,
                    "retrying transfer"
                );
                RunStats::increment(&self.stats.retried);
                tokio::select! {
                    biased;
                    () = self.cancel.cancelled() => false,
                    () = tokio::time::sleep(delay) => true,
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                warn!(%kind, attempt, %reason, error, "transfer failed");
                RunStats::increment(&self.stats.failed);
                false
            }
        }
    }

    /// Blocks while free space is below the floor.
    ///
    /// Orphaned partials are reclaimed once per low-space episode; artifacts
    /// of deferred or interrupted items are kept. Returns false on
    /// cancellation.
    async fn wait_for_disk(&self) -> bool {
        if !self.disk.is_below_threshold() {
            self.reclaimed.store(false, Ordering::SeqCst);
            return true;
        }
        if self.reclaim_on_pressure && !self.reclaimed.swap(true, Ordering::SeqCst) {
            self.disk
                .reclaim(
                    self.transfer.active_partials(),
                    self.transfer.resumable_partials(),
                )
                .await;
        }
        self.disk.wait_for_space(&self.cancel).await
    }
}

/// Breadth-first walk over the remote directory tree.
struct Walk {
    client: Arc<dyn ProtocolClient>,
    governor: Arc<RateGovernor>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    dirs: VecDeque<String>,
    ready: VecDeque<RemoteItem>,
}

enum ListEnd {
    Cancelled,
    Failed(ProtocolError),
}

impl Walk {
    async fn next(mut self) -> Option<(Result<RemoteItem, EngineError>, Self)> {
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some((Ok(item), self));
            }
            let dir = self.dirs.pop_front()?;
            match self.list(&dir).await {
                Ok(entries) => self.absorb(&dir, entries),
                Err(ListEnd::Cancelled) => return None,
                Err(ListEnd::Failed(source)) => {
                    return Some((Err(EngineError::Enumeration { dir, source }), self));
                }
            }
        }
    }

    fn absorb(&mut self, dir: &str, entries: Vec<RemoteEntry>) {
        let mut files = 0usize;
        for entry in entries {
            match entry.kind {
                EntryKind::Directory => self.dirs.push_back(entry.path),
                EntryKind::File => match RemoteItem::new(&entry.path, entry.size, entry.modified) {
                    Some(item) => {
                        files += 1;
                        self.ready.push_back(item);
                    }
                    None => warn!(path = %entry.path, "skipping unsafe remote path"),
                },
            }
        }
        debug!(dir, files, pending_dirs = self.dirs.len(), "directory listed");
    }

    async fn list(&self, dir: &str) -> Result<Vec<RemoteEntry>, ListEnd> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if !self.governor.acquire_or_cancel(&self.cancel).await {
                return Err(ListEnd::Cancelled);
            }
            let result = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return Err(ListEnd::Cancelled),
                result = self.client.list(dir) => result,
            };
            let error = match result {
                Ok(entries) => {
                    self.governor.report_outcome(true);
                    return Ok(entries);
                }
                Err(e) => e,
            };

            let kind = ErrorKind::from(&error);
            if kind.is_network() {
                self.governor.report_outcome(false);
            }
            match self.policy.should_retry(classify_error_kind(kind), attempt) {
                RetryDecision::Retry { delay, .. } => {
                    warn!(dir, attempt, error = %error, "listing failed, retrying");
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => return Err(ListEnd::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(dir, attempt, %reason, error = %error, "listing failed");
                    return Err(ListEnd::Failed(error));
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_in_selection_matches_whole_segments() {
        let categories = vec!["compound".to_string(), "gene/".to_string()];
        assert!(in_selection(&categories, "compound/a.ttl.gz"));
        assert!(in_selection(&categories, "gene/x/b.ttl.gz"));
        assert!(!in_selection(&categories, "compound2/a.ttl.gz"));
        assert!(!in_selection(&categories, "substance/a.ttl.gz"));
    }

    #[test]
    fn test_run_stats_default() {
        let stats = RunStats::default();
        assert_eq!(stats.completed(), 0);
        assert_eq!(stats.failed(), 0);
        assert_eq!(stats.bytes_transferred(), 0);
        assert!(stats.is_clean());
    }

    #[test]
    fn test_run_stats_thread_safe() {
        use std::thread;

        let stats = Arc::new(RunStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        RunStats::increment(&stats.completed);
                        RunStats::increment(&stats.retried);
                        stats.bytes_transferred.fetch_add(10, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.completed(), 800);
        assert_eq!(stats.retried(), 800);
        assert_eq!(stats.bytes_transferred(), 8000);
    }

    #[test]
    fn test_interrupted_run_is_not_clean() {
        let stats = RunStats::new();
        stats.interrupted.store(true, Ordering::SeqCst);
        assert!(!stats.is_clean());
    }

    #[test]
    fn test_selection_default_uses_configured_categories() {
        let selection = Selection::default();
        assert!(selection.categories.is_none());
        assert!(!selection.retry_failed);
    }
}
