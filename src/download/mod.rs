//! Transfer orchestration: pacing, disk gating, resumable transfers, and the
//! worker pool that ties them together.
//!
//! # Components
//!
//! - [`RateGovernor`]: adaptive spacing between requests to the remote
//! - [`DiskGuard`]: background free-space sampling for the storage root
//! - [`TransferUnit`]: one resumable fetch into a `.part` artifact
//! - [`RetryPolicy`]: exponential backoff for transient failures
//! - [`Engine`]: enumeration, ordering, and the bounded worker pool

pub mod constants;
pub mod disk_guard;
mod error;
pub mod rate_governor;
mod retry;
mod scheduler;
mod transfer;

pub use disk_guard::{DiskGuard, DiskState, DiskUsage, FsSpaceProbe, SpaceProbe};
pub use error::{EngineError, TransferError};
pub use rate_governor::{RateGovernor, RateGovernorConfig, RateState};
pub use retry::{
    DEFAULT_MAX_ATTEMPTS, FailureType, RetryDecision, RetryPolicy, classify_error_kind,
};
pub use scheduler::{Engine, RunStats, Selection};
pub use transfer::{
    PARTIAL_SUFFIX, TransferOutcome, TransferSettings, TransferUnit, partial_path,
};

