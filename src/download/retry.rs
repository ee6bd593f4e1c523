//! Retry logic with exponential backoff for failed transfers and listings.
//!
//! A failure is first recorded as an [`ErrorKind`] on the item's ledger
//! record, then classified into a [`FailureType`]:
//! - [`FailureType::Transient`] - connection drops, timeouts, integrity
//!   mismatches and local I/O hiccups that may succeed on retry
//! - [`FailureType::Permanent`] - the item is gone or the server refuses it
//! - [`FailureType::NeedsAuth`] - credentials required (never retried automatically)
//!
//! The [`RetryPolicy`] then decides whether to retry based on failure type
//! and attempt count, calculating exponential backoff delays with jitter.
//! The per-item attempt budget is independent of the rate governor's delay.
//!
//! # Example
//!
//! ```
//! use mirror_core::download::{RetryPolicy, RetryDecision, classify_error_kind};
//! use mirror_core::ledger::ErrorKind;
//!
//! let policy = RetryPolicy::default();
//! let failure_type = classify_error_kind(ErrorKind::Connection);
//!
//! match policy.should_retry(failure_type, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("Retrying in {:?} (attempt {})", delay, attempt);
//!     }
//!     RetryDecision::DoNotRetry { reason } => {
//!         println!("Not retrying: {}", reason);
//!     }
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use crate::ledger::ErrorKind;

/// Default maximum attempts per item (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff (1 second).
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Default backoff multiplier (doubles each attempt).
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Classification of transfer failure types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: connection reset, timeout, 5xx/429 status, short body.
    Transient,

    /// Permanent failure that won't succeed regardless of retries.
    ///
    /// Examples: 404/410, other rejected 4xx statuses.
    Permanent,

    /// Authentication or authorization required.
    NeedsAuth,
}

/// Decision on whether to retry a failed transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Configuration for retry behavior with exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 1 second
/// - `max_delay`: 32 seconds
/// - `backoff_multiplier`: 2.0
///
/// # Delay Calculation
///
/// ```text
/// delay = min(base_delay * multiplier^(attempt-1), max_delay) + jitter
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial attempt).
    max_attempts: u32,

    /// Base delay for the first retry.
    base_delay: Duration,

    /// Maximum delay cap.
    max_delay: Duration,

    /// Multiplier applied each attempt.
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a new retry policy with custom settings.
    ///
    /// # Arguments
    ///
    /// * `max_attempts` - Maximum attempts including initial (must be >= 1)
    /// * `base_delay` - Base delay for first retry
    /// * `max_delay` - Maximum delay cap
    /// * `backoff_multiplier` - Multiplier for exponential increase
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Creates a policy with a custom `max_attempts`, using defaults for other settings.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Determines whether to retry after attempt number `attempt` failed.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure - retry would not help".to_string(),
                };
            }
            FailureType::NeedsAuth => {
                return RetryDecision::DoNotRetry {
                    reason: "authentication required - retry without credentials would not help"
                        .to_string(),
                };
            }
            FailureType::Transient => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, max = self.max_attempts, "max attempts reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.calculate_delay(attempt);
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );

        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Calculates the backoff delay after attempt `attempt` (1-indexed).
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let multiplier = f64::from(self.backoff_multiplier);

        let exponent = f64::from(attempt.saturating_sub(1));
        let delay_ms = base_ms * multiplier.powf(exponent);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        Duration::from_millis(capped_ms as u64) + Self::calculate_jitter()
    }

    /// Random jitter between 0 and `MAX_JITTER`, so workers that failed
    /// together do not retry together.
    #[allow(clippy::cast_possible_truncation)]
    fn calculate_jitter() -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_ms = rng.gen_range(0..=MAX_JITTER.as_millis() as u64);
        Duration::from_millis(jitter_ms)
    }
}

/// Classifies a recorded failure kind for retry decisions.
///
/// | Kind | Type |
/// |------|------|
/// | Connection, Timeout | Transient |
/// | Integrity | Transient (artifact discarded, retried from 0) |
/// | Io | Transient |
/// | NotFound, Rejected | Permanent |
/// | Auth | NeedsAuth |
#[must_use]
pub fn classify_error_kind(kind: ErrorKind) -> FailureType {
    match kind {
        ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Integrity | ErrorKind::Io => {
            FailureType::Transient
        }
        ErrorKind::NotFound | ErrorKind::Rejected => FailureType::Permanent,
        ErrorKind::Auth => FailureType::NeedsAuth,
    }
}
