//! Error types for the download module.
//!
//! [`TransferError`] describes why one transfer attempt failed and maps onto
//! the [`ErrorKind`] stored in the ledger. [`EngineError`] covers the fatal,
//! run-level conditions checked before any work starts.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::ledger::{ErrorKind, LedgerError};
use crate::remote::ProtocolError;

/// Errors that end one transfer attempt.
#[derive(Debug, Error)]
pub enum TransferError {
    /// The protocol client reported a failure.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No body bytes arrived within the stall timeout.
    #[error("transfer of {path} stalled for {}s", timeout.as_secs())]
    Stalled {
        /// Corpus path involved.
        path: String,
        /// Configured stall timeout.
        timeout: Duration,
    },

    /// File system error while writing or promoting the artifact.
    #[error("IO error at {path}: {source}")]
    Io {
        /// File path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Received length disagrees with the expected size.
    #[error("integrity check failed for {path}: {detail}")]
    Integrity {
        /// Corpus path involved.
        path: String,
        /// What disagreed.
        detail: String,
    },

    /// The ledger refused a bookkeeping update.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl TransferError {
    /// Creates a stall error.
    pub fn stalled(path: impl Into<String>, timeout: Duration) -> Self {
        Self::Stalled {
            path: path.into(),
            timeout,
        }
    }

    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an integrity error.
    pub fn integrity(path: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Integrity {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Returns the kind recorded on the item's ledger record.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Protocol(e) => ErrorKind::from(e),
            Self::Stalled { .. } => ErrorKind::Timeout,
            Self::Io { .. } | Self::Ledger(_) => ErrorKind::Io,
            Self::Integrity { .. } => ErrorKind::Integrity,
        }
    }
}

/// Fatal run-level errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The configuration failed validation.
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The storage root cannot be created or written.
    #[error("storage root {path} is not usable: {source}")]
    StorageRoot {
        /// Configured data directory.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The ledger could not be opened.
    #[error("ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),

    /// A category could not be listed at all.
    #[error("failed to enumerate {dir}: {source}")]
    Enumeration {
        /// Directory being listed.
        dir: String,
        /// Last protocol error.
        #[source]
        source: ProtocolError,
    },

    /// A worker or producer task panicked.
    #[error("engine task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_kinds() {
        assert_eq!(
            TransferError::from(ProtocolError::not_found("a")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            TransferError::stalled("a", Duration::from_secs(5)).kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            TransferError::integrity("a", "short body").kind(),
            ErrorKind::Integrity
        );
        let io = std::io::Error::new(std::io::ErrorKind::StorageFull, "full");
        assert_eq!(TransferError::io("/data/a.part", io).kind(), ErrorKind::Io);
    }

    #[test]
    fn test_stalled_display() {
        let msg = TransferError::stalled("compound/a", Duration::from_secs(300)).to_string();
        assert_eq!(msg, "transfer of compound/a stalled for 300s");
    }
}
