//! Constants for the download module (timeouts, checkpoints, pool bounds).

use std::time::Duration;

/// Default protocol connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default stall timeout for responses and body reads (5 minutes).
pub const STALL_TIMEOUT_SECS: u64 = 300;

/// [`STALL_TIMEOUT_SECS`] as a `Duration`.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(STALL_TIMEOUT_SECS);

/// Bytes written between durability checkpoints (8 MiB).
pub const DEFAULT_PROGRESS_INTERVAL_BYTES: u64 = 8 * 1024 * 1024;

/// Default number of concurrent workers.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Minimum allowed concurrency.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency; the remote is a shared public server.
pub const MAX_CONCURRENCY: usize = 20;

/// Terminal updates between ledger snapshots.
pub const DEFAULT_SAVE_INTERVAL_ITEMS: usize = 10;
