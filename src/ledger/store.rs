//! On-disk form of the ledger: one pretty-printed JSON document replaced atomically.
//!
//! A snapshot is written to `<file>.tmp`, fsynced, and renamed over the target,
//! so a crash leaves either the previous snapshot or the new one, never a mix.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{LedgerCounts, LedgerError, TransferRecord};

/// Current snapshot format version.
pub(crate) const FORMAT_VERSION: u32 = 1;

/// Snapshot document as read back from disk.
#[derive(Debug, Deserialize)]
pub(crate) struct LedgerFile {
    pub(crate) version: u32,
    #[serde(default)]
    pub(crate) records: BTreeMap<String, TransferRecord>,
}

/// Snapshot document as written, borrowing the in-memory records.
#[derive(Debug, Serialize)]
pub(crate) struct LedgerFileRef<'a> {
    pub(crate) version: u32,
    pub(crate) saved_at: DateTime<Utc>,
    pub(crate) counts: LedgerCounts,
    pub(crate) records: &'a BTreeMap<String, TransferRecord>,
}

/// Reads the snapshot at `path`.
///
/// Returns `Ok(None)` when no file exists. A file that does not parse is
/// renamed to `<file>.corrupt-<timestamp>` and reported as
/// [`LedgerError::Corrupt`].
pub(crate) fn read_snapshot(path: &Path) -> Result<Option<LedgerFile>, LedgerError> {
    match inspect_snapshot(path) {
        Err(LedgerError::Unreadable {
            source: parse_error,
            ..
        }) => {
            let quarantined = quarantine_path(path);
            fs::rename(path, &quarantined).map_err(|e| LedgerError::io(path, e))?;
            warn!(
                path = %path.display(),
                quarantined = %quarantined.display(),
                error = %parse_error,
                "ledger file unreadable, moved aside"
            );
            Err(LedgerError::Corrupt {
                path: path.to_path_buf(),
                quarantined,
            })
        }
        other => other,
    }
}

/// Reads the snapshot at `path` without changing anything on disk.
///
/// A file that does not parse is reported as [`LedgerError::Unreadable`]
/// and left where it is.
pub(crate) fn inspect_snapshot(path: &Path) -> Result<Option<LedgerFile>, LedgerError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(LedgerError::io(path, e)),
    };

    let file = serde_json::from_slice::<LedgerFile>(&bytes).map_err(|source| {
        LedgerError::Unreadable {
            path: path.to_path_buf(),
            source,
        }
    })?;
    if file.version > FORMAT_VERSION {
        warn!(
            path = %path.display(),
            version = file.version,
            supported = FORMAT_VERSION,
            "ledger written by a newer version, reading known fields only"
        );
    }
    debug!(path = %path.display(), records = file.records.len(), "ledger snapshot read");
    Ok(Some(file))
}

/// Atomically replaces the snapshot at `path` with `contents`.
pub(crate) fn write_snapshot(path: &Path, contents: &[u8]) -> Result<(), LedgerError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).map_err(|e| LedgerError::io(parent, e))?;
    }

    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp).map_err(|e| LedgerError::io(&tmp, e))?;
        file.write_all(contents)
            .map_err(|e| LedgerError::io(&tmp, e))?;
        file.sync_all().map_err(|e| LedgerError::io(&tmp, e))?;
    }
    fs::rename(&tmp, path).map_err(|e| LedgerError::io(path, e))?;

    // Make the rename itself durable.
    #[cfg(unix)]
    if let Some(parent) = parent {
        if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
            debug!(dir = %parent.display(), error = %e, "directory fsync skipped");
        }
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S")));
    PathBuf::from(name)
}
