//! Error types for ledger operations.

use std::path::PathBuf;

use thiserror::Error;

use super::TransferStatus;

/// Errors that can occur while reading, updating or persisting the ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Filesystem failure on the ledger file or its directory.
    #[error("ledger I/O error at {path}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The snapshot could not be serialized.
    #[error("failed to serialize ledger snapshot: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The ledger file exists but does not parse; it was moved aside.
    #[error("ledger file {path} is corrupt and was moved to {quarantined}")]
    Corrupt {
        /// Original ledger path.
        path: PathBuf,
        /// Where the unreadable file now lives.
        quarantined: PathBuf,
    },

    /// The ledger file exists but does not parse; it was left in place.
    #[error("ledger file {path} is unreadable: {source}")]
    Unreadable {
        /// Ledger path.
        path: PathBuf,
        /// Parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// No record exists for the item.
    #[error("no ledger record for {0}")]
    UnknownItem(String),

    /// The requested status change breaks the record state machine.
    #[error("invalid transition for {path}: {from} -> {to}")]
    InvalidTransition {
        /// Item path.
        path: String,
        /// Current status.
        from: TransferStatus,
        /// Requested status.
        to: TransferStatus,
    },

    /// The update would record more bytes than the item's expected size.
    #[error("{path}: {bytes} bytes exceeds expected size {expected}")]
    BytesExceedExpected {
        /// Item path.
        path: String,
        /// Requested byte count.
        bytes: u64,
        /// Known expected size.
        expected: u64,
    },

    /// A blocking persist task panicked or was cancelled.
    #[error("ledger persist task failed: {0}")]
    Task(String),
}

impl LedgerError {
    /// Creates an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a transition error.
    pub fn invalid_transition(
        path: impl Into<String>,
        from: TransferStatus,
        to: TransferStatus,
    ) -> Self {
        Self::InvalidTransition {
            path: path.into(),
            from,
            to,
        }
    }
}
