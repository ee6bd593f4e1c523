//! One resumable fetch of one remote item.
//!
//! Bytes land in `<final>.part`; the length of that file is the resume
//! offset on the next attempt. The ledger's byte count is only a hint and
//! is never ahead of what has been fsynced.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures_util::StreamExt;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::constants::{DEFAULT_PROGRESS_INTERVAL_BYTES, DEFAULT_STALL_TIMEOUT};
use super::error::TransferError;
use super::{DiskGuard, RateGovernor};
use crate::ledger::{ErrorKind, Ledger};
use crate::remote::{ByteStream, FetchResponse, ProtocolClient, RemoteItem};

/// Suffix of in-flight artifacts.
pub const PARTIAL_SUFFIX: &str = ".part";

/// Returns the partial artifact path for `final_path`.
#[must_use]
pub fn partial_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Result of one [`TransferUnit::transfer`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// The final file is in place.
    Completed {
        /// Final size in bytes.
        bytes: u64,
        /// False when the artifact was already complete and no request was made.
        fetched: bool,
    },
    /// The attempt failed and the ledger record is `failed`.
    Failed {
        /// Recorded failure kind.
        kind: ErrorKind,
        /// Attempt number that failed.
        attempt: u32,
        /// Durable bytes kept in the artifact.
        bytes: u64,
        /// Human-readable error.
        error: String,
    },
    /// Disk pressure; the record is back to `pending`.
    Deferred {
        /// Durable bytes kept in the artifact.
        bytes: u64,
    },
    /// Cancellation; the record is back to `pending`.
    Cancelled {
        /// Durable bytes kept in the artifact.
        bytes: u64,
    },
}

/// Per-run transfer settings.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Storage root final files are placed under.
    pub root: PathBuf,
    /// Bytes between durability checkpoints.
    pub progress_interval: u64,
    /// Longest wait for the response or the next body chunk.
    pub stall_timeout: Duration,
}

impl TransferSettings {
    /// Settings with default checkpoint interval and stall timeout.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            progress_interval: DEFAULT_PROGRESS_INTERVAL_BYTES,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Yield {
    Deferred,
    Cancelled,
}

enum AttemptEnd {
    Completed { bytes: u64, fetched: bool },
    Yielded { bytes: u64, reason: Yield },
}

enum StreamEnd {
    Finished,
    Yielded(Yield),
}

#[derive(Debug)]
struct Failure {
    error: TransferError,
    bytes: u64,
}

impl Failure {
    fn at(error: impl Into<TransferError>, bytes: u64) -> Self {
        Self {
            error: error.into(),
            bytes,
        }
    }
}

/// Performs resumable transfers of single items.
#[derive(Clone)]
pub struct TransferUnit {
    client: Arc<dyn ProtocolClient>,
    ledger: Arc<Ledger>,
    governor: Arc<RateGovernor>,
    disk: Arc<DiskGuard>,
    active: Arc<DashSet<PathBuf>>,
    settings: TransferSettings,
}

impl std::fmt::Debug for TransferUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferUnit")
            .field("active", &self.active.len())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl TransferUnit {
    /// Creates a transfer unit sharing the run's collaborators.
    #[must_use]
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        ledger: Arc<Ledger>,
        governor: Arc<RateGovernor>,
        disk: Arc<DiskGuard>,
        settings: TransferSettings,
    ) -> Self {
        Self {
            client,
            ledger,
            governor,
            disk,
            active: Arc::new(DashSet::new()),
            settings,
        }
    }

    /// Partial artifacts currently owned by a transfer.
    #[must_use]
    pub fn active_partials(&self) -> Arc<DashSet<PathBuf>> {
        Arc::clone(&self.active)
    }

    /// Partial artifacts of unfinished items the ledger has progress for.
    #[must_use]
    pub fn resumable_partials(&self) -> HashSet<PathBuf> {
        self.ledger
            .resumable_paths()
            .iter()
            .filter_map(|path| RemoteItem::new(path, None, None))
            .map(|item| partial_path(&item.local_path(&self.settings.root)))
            .collect()
    }

    /// Transfers `item`, resuming from its partial artifact.
    ///
    /// The record must be `pending`; it leaves as `completed`, `failed`, or
    /// back at `pending` for deferred and cancelled attempts.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Ledger`] when the item cannot be claimed.
    /// Failures after the claim are reported as [`TransferOutcome::Failed`].
    #[instrument(skip(self, cancel), fields(path = %item.path()))]
    pub async fn transfer(
        &self,
        item: &RemoteItem,
        cancel: &CancellationToken,
    ) -> Result<TransferOutcome, TransferError> {
        if self.disk.is_below_threshold() {
            return Ok(TransferOutcome::Deferred { bytes: 0 });
        }
        if cancel.is_cancelled() {
            return Ok(TransferOutcome::Cancelled { bytes: 0 });
        }

        let attempt = self.ledger.begin(item.path())?;
        let final_path = item.local_path(&self.settings.root);
        let partial = partial_path(&final_path);
        self.active.insert(partial.clone());

        let result = self.attempt(item, &final_path, &partial, cancel).await;
        self.active.remove(&partial);

        Ok(self.settle(item, attempt, result))
    }

    fn settle(
        &self,
        item: &RemoteItem,
        attempt: u32,
        result: Result<AttemptEnd, Failure>,
    ) -> TransferOutcome {
        let path = item.path();
        match result {
            Ok(AttemptEnd::Completed { bytes, fetched }) => {
                if let Err(e) = self.ledger.complete(path, bytes) {
                    warn!(error = %e, "could not record completion");
                }
                if fetched {
                    self.governor.report_outcome(true);
                }
                info!(bytes, fetched, "transfer completed");
                TransferOutcome::Completed { bytes, fetched }
            }
            Ok(AttemptEnd::Yielded { bytes, reason }) => {
                if let Err(e) = self.ledger.suspend(path, bytes) {
                    warn!(error = %e, "could not suspend record");
                }
                debug!(bytes, ?reason, "transfer yielded");
                match reason {
                    Yield::Deferred => TransferOutcome::Deferred { bytes },
                    Yield::Cancelled => TransferOutcome::Cancelled { bytes },
                }
            }
            Err(Failure { error, bytes }) => {
                let kind = error.kind();
                let message = error.to_string();
                if let Err(e) = self.ledger.fail(path, kind, message.clone(), bytes) {
                    warn!(error = %e, "could not record failure");
                }
                if kind.is_network() {
                    self.governor.report_outcome(false);
                }
                warn!(%kind, attempt, bytes, error = %message, "transfer failed");
                TransferOutcome::Failed {
                    kind,
                    attempt,
                    bytes,
                    error: message,
                }
            }
        }
    }

    async fn attempt(
        &self,
        item: &RemoteItem,
        final_path: &Path,
        partial: &Path,
        cancel: &CancellationToken,
    ) -> Result<AttemptEnd, Failure> {
        let path = item.path();
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Failure::at(TransferError::io(parent, e), 0))?;
        }

        let record = self.ledger.record(path);
        let mut expected = item
            .size()
            .or_else(|| record.as_ref().and_then(|r| r.expected_size));

        if let Some(existing) = file_len(final_path).await {
            match expected {
                Some(size) if existing == size => {
                    debug!(bytes = size, "final file already present");
                    discard(partial).await;
                    return Ok(AttemptEnd::Completed {
                        bytes: size,
                        fetched: false,
                    });
                }
                Some(size) if existing > size => {
                    warn!(final_bytes = existing, expected = size, "final file longer than item, replacing");
                    discard(final_path).await;
                }
                _ => adopt_final(final_path, partial, existing).await?,
            }
        }

        let mut offset = artifact_len(partial).await;
        if let Some(hint) = record.as_ref().map(|r| r.bytes_transferred)
            && hint != offset
        {
            debug!(ledger_bytes = hint, artifact_bytes = offset, "artifact length wins over ledger");
        }

        if expected == Some(0) {
            File::create(final_path)
                .await
                .map_err(|e| Failure::at(TransferError::io(final_path, e), 0))?;
            discard(partial).await;
            return Ok(AttemptEnd::Completed {
                bytes: 0,
                fetched: false,
            });
        }
        if let Some(size) = expected {
            if offset == size {
                promote(partial, final_path, offset).await?;
                return Ok(AttemptEnd::Completed {
                    bytes: size,
                    fetched: false,
                });
            }
            if offset > size {
                warn!(artifact_bytes = offset, expected = size, "artifact longer than item, restarting");
                discard(partial).await;
                offset = 0;
            }
        }

        if !self.governor.acquire_or_cancel(cancel).await {
            return Ok(AttemptEnd::Yielded {
                bytes: offset,
                reason: Yield::Cancelled,
            });
        }

        let stall = self.settings.stall_timeout;
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok(AttemptEnd::Yielded { bytes: offset, reason: Yield::Cancelled });
            }
            response = tokio::time::timeout(stall, self.client.fetch(path, offset)) => response,
        };
        let FetchResponse {
            start_offset,
            total_size,
            mut body,
        } = match response {
            Err(_elapsed) => return Err(Failure::at(TransferError::stalled(path, stall), offset)),
            Ok(Err(e)) => return Err(Failure::at(e, offset)),
            Ok(Ok(response)) => response,
        };

        if start_offset != offset {
            if start_offset == 0 {
                info!(offset, "server ignored range request, restarting from 0");
                offset = 0;
            } else {
                discard(partial).await;
                return Err(Failure::at(
                    TransferError::integrity(
                        path,
                        format!("server resumed at byte {start_offset}, requested {offset}"),
                    ),
                    0,
                ));
            }
        }

        if let Some(total) = total_size {
            if expected != Some(total) {
                if let Some(previous) = expected {
                    warn!(previous, reported = total, "remote size changed, adopting reported size");
                }
                expected = Some(total);
                self.ledger
                    .set_expected_size(path, total)
                    .map_err(|e| Failure::at(e, offset))?;
            }
            if offset > total {
                discard(partial).await;
                return Err(Failure::at(
                    TransferError::integrity(
                        path,
                        format!("artifact has {offset} bytes, remote has {total}"),
                    ),
                    0,
                ));
            }
        }

        let file = open_artifact(partial, offset)
            .await
            .map_err(|e| Failure::at(TransferError::io(partial, e), offset))?;
        let mut writer = BufWriter::new(file);
        let mut progress = Progress {
            written: offset,
            durable: offset,
        };

        let streamed = self
            .stream_body(path, partial, &mut body, &mut writer, &mut progress, expected, cancel)
            .await;
        let flushed = checkpoint(&mut writer).await;
        if flushed.is_ok() {
            progress.durable = progress.written;
        }
        drop(writer);

        match streamed {
            Ok(StreamEnd::Yielded(reason)) => Ok(AttemptEnd::Yielded {
                bytes: progress.durable,
                reason,
            }),
            Err(error @ TransferError::Integrity { .. }) => {
                discard(partial).await;
                Err(Failure::at(error, 0))
            }
            Err(error) => Err(Failure::at(error, progress.durable)),
            Ok(StreamEnd::Finished) => {
                if let Err(e) = flushed {
                    return Err(Failure::at(TransferError::io(partial, e), progress.durable));
                }
                if let Some(size) = expected
                    && progress.written != size
                {
                    discard(partial).await;
                    return Err(Failure::at(
                        TransferError::integrity(
                            path,
                            format!("expected {size} bytes, received {}", progress.written),
                        ),
                        0,
                    ));
                }
                promote(partial, final_path, progress.written).await?;
                Ok(AttemptEnd::Completed {
                    bytes: progress.written,
                    fetched: true,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        path: &str,
        partial: &Path,
        body: &mut ByteStream,
        writer: &mut BufWriter<File>,
        progress: &mut Progress,
        expected: Option<u64>,
        cancel: &CancellationToken,
    ) -> Result<StreamEnd, TransferError> {
        let stall = self.settings.stall_timeout;
        let mut since_checkpoint = 0u64;
        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(StreamEnd::Yielded(Yield::Cancelled)),
                next = tokio::time::timeout(stall, body.next()) => next,
            };
            let chunk = match next {
                Err(_elapsed) => return Err(TransferError::stalled(path, stall)),
                Ok(None) => return Ok(StreamEnd::Finished),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(chunk))) => chunk,
            };

            let len = chunk.len() as u64;
            if let Some(size) = expected
                && progress.written + len > size
            {
                return Err(TransferError::integrity(
                    path,
                    format!("received more than the expected {size} bytes"),
                ));
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransferError::io(partial, e))?;
            progress.written += len;
            since_checkpoint += len;

            if since_checkpoint >= self.settings.progress_interval {
                checkpoint(writer)
                    .await
                    .map_err(|e| TransferError::io(partial, e))?;
                progress.durable = progress.written;
                since_checkpoint = 0;
                self.ledger.report_progress(path, progress.durable)?;
                debug!(bytes = progress.durable, "checkpoint");

                if self.disk.is_below_threshold() {
                    return Ok(StreamEnd::Yielded(Yield::Deferred));
                }
            }
        }
    }
}

struct Progress {
    written: u64,
    durable: u64,
}

async fn artifact_len(partial: &Path) -> u64 {
    file_len(partial).await.unwrap_or(0)
}

async fn file_len(path: &Path) -> Option<u64> {
    tokio::fs::metadata(path)
        .await
        .ok()
        .filter(std::fs::Metadata::is_file)
        .map(|m| m.len())
}

/// Turns a final file of unconfirmed size back into the resume artifact.
///
/// The longer of the two files is kept; the next fetch resumes after it and
/// the size the server reports decides whether anything is missing.
async fn adopt_final(final_path: &Path, partial: &Path, existing: u64) -> Result<(), Failure> {
    if existing > artifact_len(partial).await {
        debug!(bytes = existing, "resuming from existing final file");
        tokio::fs::rename(final_path, partial)
            .await
            .map_err(|e| Failure::at(TransferError::io(final_path, e), 0))
    } else {
        discard(final_path).await;
        Ok(())
    }
}

async fn open_artifact(partial: &Path, offset: u64) -> io::Result<File> {
    if offset == 0 {
        return OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(partial)
            .await;
    }

    let file = OpenOptions::new().append(true).open(partial).await?;
    let len = file.metadata().await?.len();
    if len != offset {
        return Err(io::Error::other(format!(
            "artifact changed while opening: {len} bytes, resume offset {offset}"
        )));
    }
    Ok(file)
}

/// Flushes buffered bytes and fsyncs the file data.
async fn checkpoint(writer: &mut BufWriter<File>) -> io::Result<()> {
    writer.flush().await?;
    writer.get_ref().sync_data().await
}

async fn promote(partial: &Path, final_path: &Path, bytes: u64) -> Result<(), Failure> {
    tokio::fs::rename(partial, final_path)
        .await
        .map_err(|e| Failure::at(TransferError::io(final_path, e), bytes))
}

async fn discard(partial: &Path) {
    match tokio::fs::remove_file(partial).await {
        Ok(()) => debug!(path = %partial.display(), "discarded artifact"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %partial.display(), error = %e, "could not discard artifact"),
    }
}
