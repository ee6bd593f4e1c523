//! Corpus Mirror Core Library
//!
//! This library provides the download orchestration engine behind the
//! `corpus-mirror` tool, which retrieves a large, hierarchically organized
//! remote file corpus while surviving interruption, staying polite to the
//! remote server, and keeping local storage above a free-space floor.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`remote`] - Remote item model and the protocol client seam (HTTP implementation included)
//! - [`ledger`] - Durable per-item transfer state used for resumption and reporting
//! - [`download`] - Rate governor, disk guard, transfer unit, retry policy, and scheduler
//! - [`config`] - Static configuration snapshot, TOML loading, and environment overrides

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod ledger;
pub mod remote;
mod user_agent;

// Re-export commonly used types
pub use config::{ConfigError, EngineConfig};
pub use download::{
    DEFAULT_MAX_ATTEMPTS, DiskGuard, DiskState, DiskUsage, Engine, EngineError, FailureType,
    FsSpaceProbe,
    RateGovernor, RateGovernorConfig, RetryDecision, RetryPolicy, RunStats, Selection,
    SpaceProbe, TransferError, TransferOutcome, TransferSettings, TransferUnit,
    classify_error_kind,
};
pub use ledger::{
    ErrorKind, Ledger, LedgerCounts, LedgerError, StatusSnapshot, TransferRecord, TransferStatus,
};
pub use remote::{
    EntryKind, FetchResponse, HttpClientError, HttpProtocolClient, ProtocolClient, ProtocolError, RemoteEntry,
    RemoteItem,
};
