//! Adaptive request pacing for a single remote server.
//!
//! Every listing and fetch request passes through [`RateGovernor::acquire`],
//! which enforces a minimum spacing between grants. The spacing adapts to
//! feedback: a failure doubles it (capped at `max_delay`), a streak of
//! successes shrinks it by 10% (floored at `min_delay`). An optional cap on
//! grants per sliding window applies on top of the spacing.
//!
//! # Example
//!
//! ```no_run
//! use mirror_core::download::{RateGovernor, RateGovernorConfig};
//!
//! # async fn example() {
//! let governor = RateGovernor::new(RateGovernorConfig::default());
//! governor.acquire().await;
//! // ... perform the request ...
//! governor.report_outcome(true);
//! # }
//! ```

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default initial inter-request delay (2 seconds).
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Default lower bound for the delay (500ms).
pub const DEFAULT_MIN_DELAY: Duration = Duration::from_millis(500);

/// Default upper bound for the delay (30 seconds).
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Default number of consecutive successes before the delay shrinks.
pub const DEFAULT_SUCCESS_STREAK: u32 = 5;

/// Window the request cap is counted over.
pub const DEFAULT_REQUEST_WINDOW: Duration = Duration::from_secs(60);

/// Smallest delay a failure backs off from, so a zero delay still grows.
pub const MIN_BACKOFF_STEP: Duration = Duration::from_millis(500);

/// Tunables for [`RateGovernor`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateGovernorConfig {
    /// Delay used before any feedback arrives.
    pub initial_delay: Duration,
    /// Floor for the delay.
    pub min_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Consecutive successes required before shrinking the delay.
    pub success_streak: u32,
    /// Multiplier applied after a full success streak (< 1.0).
    pub decrease_factor: f64,
    /// Multiplier applied after a failure (> 1.0).
    pub increase_factor: f64,
    /// Maximum grants per `request_window`; 0 means uncapped.
    pub max_requests_per_window: u32,
    /// Sliding window for `max_requests_per_window`.
    pub request_window: Duration,
}

impl Default for RateGovernorConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            min_delay: DEFAULT_MIN_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            success_streak: DEFAULT_SUCCESS_STREAK,
            decrease_factor: 0.9,
            increase_factor: 2.0,
            max_requests_per_window: 0,
            request_window: DEFAULT_REQUEST_WINDOW,
        }
    }
}

/// Point-in-time view of the governor's adaptive state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateState {
    /// Current inter-request delay.
    pub delay: Duration,
    /// Successes since the last failure or delay decrease.
    pub consecutive_successes: u32,
    /// Failures since the last success.
    pub consecutive_errors: u32,
}

/// Grant history guarded by the async gate.
#[derive(Debug, Default)]
struct Grants {
    last: Option<Instant>,
    recent: VecDeque<Instant>,
}

impl Grants {
    fn expire(&mut self, window: Duration) {
        while self
            .recent
            .front()
            .is_some_and(|granted| granted.elapsed() >= window)
        {
            self.recent.pop_front();
        }
    }
}

/// Thread-safe admission gate with adaptive spacing.
///
/// Adaptive state lives behind a `std::sync::Mutex` that is never held
/// across an await; the grant history lives behind a `tokio::sync::Mutex`
/// so waiters queue in order.
#[derive(Debug)]
pub struct RateGovernor {
    config: RateGovernorConfig,
    state: Mutex<RateState>,
    grants: tokio::sync::Mutex<Grants>,
}

impl RateGovernor {
    /// Creates a governor; the initial delay is clamped into `[min, max]`.
    #[must_use]
    pub fn new(config: RateGovernorConfig) -> Self {
        let delay = config
            .initial_delay
            .clamp(config.min_delay, config.max_delay.max(config.min_delay));
        Self {
            state: Mutex::new(RateState {
                delay,
                consecutive_successes: 0,
                consecutive_errors: 0,
            }),
            grants: tokio::sync::Mutex::new(Grants::default()),
            config,
        }
    }

    /// Creates a governor that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(RateGovernorConfig {
            initial_delay: Duration::ZERO,
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..RateGovernorConfig::default()
        })
    }

    /// Returns true when all delay bounds are zero and grants are uncapped.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.config.max_delay.is_zero() && self.config.max_requests_per_window == 0
    }

    fn lock_state(&self) -> MutexGuard<'_, RateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current inter-request delay.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        self.lock_state().delay
    }

    /// Returns the current adaptive state.
    #[must_use]
    pub fn snapshot(&self) -> RateState {
        *self.lock_state()
    }

    /// Waits until the current delay has elapsed since the previous grant
    /// and the request cap has room.
    ///
    /// The first grant is immediate.
    #[instrument(level = "debug", skip(self))]
    pub async fn acquire(&self) {
        if self.is_disabled() {
            return;
        }

        let mut grants = self.grants.lock().await;
        let cap = self.config.max_requests_per_window as usize;
        let window = self.config.request_window;
        if cap > 0 {
            grants.expire(window);
            if grants.recent.len() >= cap
                && let Some(&oldest) = grants.recent.front()
            {
                let wait = window.saturating_sub(oldest.elapsed());
                debug!(wait_ms = wait.as_millis(), cap, "request cap reached");
                tokio::time::sleep(wait).await;
                grants.expire(window);
            }
        }

        if let Some(previous) = grants.last {
            let delay = self.current_delay();
            let elapsed = previous.elapsed();
            if elapsed < delay {
                let wait = delay.saturating_sub(elapsed);
                debug!(wait_ms = wait.as_millis(), delay_ms = delay.as_millis(), "pacing request");
                tokio::time::sleep(wait).await;
            }
        } else {
            debug!("first request - no delay");
        }

        let now = Instant::now();
        grants.last = Some(now);
        if cap > 0 {
            grants.recent.push_back(now);
        }
    }

    /// Like [`RateGovernor::acquire`] but gives up when `cancel` fires.
    ///
    /// Returns `true` when a slot was granted.
    pub async fn acquire_or_cancel(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = self.acquire() => true,
        }
    }

    /// Feeds one request outcome into the adaptive delay.
    pub fn report_outcome(&self, success: bool) {
        let mut state = self.lock_state();
        let before = state.delay;

        if success {
            state.consecutive_errors = 0;
            state.consecutive_successes += 1;
            if state.consecutive_successes >= self.config.success_streak {
                state.consecutive_successes = 0;
                let scaled = before.mul_f64(self.config.decrease_factor);
                state.delay = scaled.max(self.config.min_delay);
                if state.delay != before {
                    debug!(
                        from_ms = before.as_millis(),
                        to_ms = state.delay.as_millis(),
                        "success streak, shortening delay"
                    );
                }
            }
        } else {
            state.consecutive_successes = 0;
            state.consecutive_errors += 1;
            let base = before.max(self.config.min_delay).max(MIN_BACKOFF_STEP);
            let scaled = base.mul_f64(self.config.increase_factor);
            state.delay = scaled.min(self.config.max_delay);

            if state.delay == self.config.max_delay && before < self.config.max_delay {
                warn!(
                    delay_secs = state.delay.as_secs_f64(),
                    "request delay at ceiling - server is struggling or throttling"
                );
            } else if state.delay != before {
                info!(
                    from_ms = before.as_millis(),
                    to_ms = state.delay.as_millis(),
                    consecutive_errors = state.consecutive_errors,
                    "request failed, lengthening delay"
                );
            }
        }
    }
}
