//! Per-item transfer record types and status definitions.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::ProtocolError;

/// Status of one remote item in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Known but not yet transferred (or requeued after a failure).
    Pending,
    /// Owned by a worker right now.
    InProgress,
    /// Final file is in place. Terminal.
    Completed,
    /// Last attempt failed; see `last_error`.
    Failed,
}

impl TransferStatus {
    /// Returns the serialized string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    ///
    /// `in_progress -> pending` is the suspend edge used when a transfer
    /// yields to cancellation or disk pressure.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::InProgress)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::InProgress, Self::Pending)
                | (Self::Failed, Self::Pending)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TransferStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid transfer status: {s}")),
        }
    }
}

/// Classification of the last failure recorded for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused/reset or a transient server status.
    Connection,
    /// Request or body read timed out, or the stream stalled.
    Timeout,
    /// Credentials required or access refused.
    Auth,
    /// Remote item no longer exists.
    NotFound,
    /// Server rejected the request with a non-retryable status.
    Rejected,
    /// Final length disagreed with the expected size.
    Integrity,
    /// Local filesystem failure while writing the artifact.
    Io,
}

impl ErrorKind {
    /// Returns the serialized string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::Rejected => "rejected",
            Self::Integrity => "integrity",
            Self::Io => "io",
        }
    }

    /// Returns true for failures worth retrying automatically.
    #[must_use]
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Connection | Self::Timeout | Self::Integrity | Self::Io
        )
    }

    /// Returns true when the failure says something about the server's health
    /// and should feed the rate governor.
    #[must_use]
    pub fn is_network(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<&ProtocolError> for ErrorKind {
    fn from(error: &ProtocolError) -> Self {
        match error {
            ProtocolError::Connection { .. } => Self::Connection,
            ProtocolError::Auth { .. } => Self::Auth,
            ProtocolError::NotFound { .. } => Self::NotFound,
            ProtocolError::Timeout { .. } => Self::Timeout,
            ProtocolError::Rejected { .. } => Self::Rejected,
        }
    }
}

/// Durable state for one remote item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRecord {
    /// Current status.
    pub status: TransferStatus,
    /// Bytes durably written to the partial artifact (or the final file).
    pub bytes_transferred: u64,
    /// Expected size once known from the listing or the protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_size: Option<u64>,
    /// Modification marker or checksum observed at discovery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_tag: Option<String>,
    /// Attempts consumed since the last explicit retry reset.
    pub attempts: u32,
    /// Kind of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
    /// Message of the most recent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
    /// When the item was first discovered.
    pub first_seen: DateTime<Utc>,
    /// When this record last changed.
    pub last_updated: DateTime<Utc>,
}

impl TransferRecord {
    /// Creates a fresh pending record.
    #[must_use]
    pub fn new_pending(expected_size: Option<u64>, content_tag: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            status: TransferStatus::Pending,
            bytes_transferred: 0,
            expected_size,
            content_tag,
            attempts: 0,
            last_error: None,
            last_error_message: None,
            first_seen: now,
            last_updated: now,
        }
    }

    /// Returns true when the record failed with a transient kind and still has
    /// attempt budget left.
    #[must_use]
    pub fn is_retryable(&self, max_attempts: u32) -> bool {
        self.status == TransferStatus::Failed
            && self.last_error.is_some_and(ErrorKind::is_transient)
            && self.attempts < max_attempts
    }

    /// Returns true when some bytes are already on disk for this item.
    #[must_use]
    pub fn has_partial_progress(&self) -> bool {
        self.status != TransferStatus::Completed && self.bytes_transferred > 0
    }

    pub(crate) fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_status_roundtrip() {
        for status in [
            TransferStatus::Pending,
            TransferStatus::InProgress,
            TransferStatus::Completed,
            TransferStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
        }
        assert!("done".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_completed_is_terminal() {
        for next in [
            TransferStatus::Pending,
            TransferStatus::InProgress,
            TransferStatus::Failed,
        ] {
            assert!(!TransferStatus::Completed.can_transition_to(next));
        }
    }

    #[test]
    fn test_failed_only_returns_to_pending() {
        assert!(TransferStatus::Failed.can_transition_to(TransferStatus::Pending));
        assert!(!TransferStatus::Failed.can_transition_to(TransferStatus::InProgress));
        assert!(!TransferStatus::Failed.can_transition_to(TransferStatus::Completed));
        assert!(!TransferStatus::Pending.can_transition_to(TransferStatus::Completed));
    }

    #[test]
    fn test_error_kind_classification() {
        assert!(ErrorKind::Connection.is_transient());
        assert!(ErrorKind::Integrity.is_transient());
        assert!(!ErrorKind::NotFound.is_transient());
        assert!(!ErrorKind::Auth.is_transient());
        assert!(ErrorKind::Timeout.is_network());
        assert!(!ErrorKind::Integrity.is_network());
    }

    #[test]
    fn test_error_kind_from_protocol_error() {
        assert_eq!(
            ErrorKind::from(&ProtocolError::not_found("a")),
            ErrorKind::NotFound
        );
        assert_eq!(
            ErrorKind::from(&ProtocolError::rejected("a", 400)),
            ErrorKind::Rejected
        );
    }

    #[test]
    fn test_record_serializes_snake_case_status() {
        let mut record = TransferRecord::new_pending(Some(10), None);
        record.status = TransferStatus::InProgress;
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"in_progress\""), "{json}");
        assert!(!json.contains("content_tag"), "{json}");
    }

    #[test]
    fn test_is_retryable_respects_budget_and_kind() {
        let mut record = TransferRecord::new_pending(None, None);
        record.status = TransferStatus::Failed;
        record.last_error = Some(ErrorKind::Timeout);
        record.attempts = 2;
        assert!(record.is_retryable(3));
        record.attempts = 3;
        assert!(!record.is_retryable(3));
        record.attempts = 1;
        record.last_error = Some(ErrorKind::NotFound);
        assert!(!record.is_retryable(3));
    }
}
