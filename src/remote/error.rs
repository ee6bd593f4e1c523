//! Error types for protocol client operations.

use thiserror::Error;

/// Errors a [`ProtocolClient`](super::ProtocolClient) can report.
///
/// Messages are carried as strings so in-memory clients can build them
/// without a transport error value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Connection refused/reset, DNS failure, or a transient server status.
    #[error("connection error for {path}: {reason}")]
    Connection {
        /// Corpus path or listing directory involved.
        path: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The server requires credentials or refused access.
    #[error("access denied for {path}: {reason}")]
    Auth {
        /// Corpus path involved.
        path: String,
        /// Human-readable cause.
        reason: String,
    },

    /// The remote item does not exist (or no longer exists).
    #[error("remote item not found: {path}")]
    NotFound {
        /// Corpus path involved.
        path: String,
    },

    /// The request or a body read timed out.
    #[error("timeout talking to server for {path}")]
    Timeout {
        /// Corpus path involved.
        path: String,
    },

    /// The server rejected the request with a non-retryable status.
    #[error("server rejected request for {path} (status {status})")]
    Rejected {
        /// Corpus path involved.
        path: String,
        /// Protocol status code.
        status: u16,
    },
}

impl ProtocolError {
    /// Creates a connection error.
    pub fn connection(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Connection {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates an access-denied error.
    pub fn auth(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Auth {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound { path: path.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(path: impl Into<String>) -> Self {
        Self::Timeout { path: path.into() }
    }

    /// Creates a rejected-status error.
    pub fn rejected(path: impl Into<String>, status: u16) -> Self {
        Self::Rejected {
            path: path.into(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display_includes_path() {
        let error = ProtocolError::connection("compound/a.ttl.gz", "connection reset");
        let msg = error.to_string();
        assert!(msg.contains("compound/a.ttl.gz"), "{msg}");
        assert!(msg.contains("connection reset"), "{msg}");
    }

    #[test]
    fn test_rejected_display_includes_status() {
        let msg = ProtocolError::rejected("x", 400).to_string();
        assert!(msg.contains("400"), "{msg}");
    }
}
