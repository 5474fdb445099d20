// crates/o11y-harness-core/src/poll.rs
// ============================================================================
// Module: Bounded Poller
// Description: Interval-based predicate polling with a hard deadline.
// Purpose: Let assertions tolerate delayed telemetry without hanging.
// Dependencies: thiserror, tokio, tracing
// ============================================================================

//! ## Overview
//! [`Poller`] evaluates a synchronous predicate until it reports `true` or a
//! deadline passes. The first evaluation happens immediately when the call
//! starts; later evaluations happen once per interval. The last wait before the
//! deadline is shortened so the poller never oversleeps it.
//! Invariants:
//! - At most one predicate evaluation is in flight per call, and none happen
//!   after the call returns.
//! - Each call owns its own sleep timer; every return path drops it.
//! - A predicate error ends the call immediately.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::convert::Infallible;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tokio::time::sleep;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default delay between predicate evaluations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Default overall deadline for a poll call.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(4500);

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Errors returned by a poll call.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The deadline passed while the predicate was still false.
    #[error("condition was not satisfied in time ({attempts} attempts over {waited_ms} ms)")]
    Timeout {
        /// Number of predicate evaluations performed.
        attempts: u32,
        /// Time spent waiting, in milliseconds.
        waited_ms: u128,
    },
    /// The predicate itself failed.
    #[error("poll predicate failed: {0}")]
    Predicate(E),
    /// The interval or timeout cannot produce a bounded wait.
    #[error("invalid poll schedule: {0}")]
    InvalidSchedule(&'static str),
}

impl<E> PollError<E> {
    /// Returns true when the error is a deadline expiry.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

// ============================================================================
// SECTION: Poller
// ============================================================================

/// Result of a satisfied poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOutcome {
    /// Number of predicate evaluations, including the successful one.
    pub attempts: u32,
    /// Time between the call start and the successful evaluation.
    pub elapsed: Duration,
}

/// Interval and deadline for predicate polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poller {
    /// Delay between evaluations.
    interval: Duration,
    /// Overall deadline measured from the call start.
    timeout: Duration,
}

impl Default for Poller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL, DEFAULT_POLL_TIMEOUT)
    }
}

impl Poller {
    /// Creates a poller with the given interval and timeout.
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
        }
    }

    /// Returns a copy with a different timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the delay between evaluations.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the overall deadline.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Polls a fallible predicate until it returns `Ok(true)`.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Timeout`] when the deadline passes,
    /// [`PollError::Predicate`] when the predicate fails, and
    /// [`PollError::InvalidSchedule`] for a zero interval or timeout.
    pub async fn wait_until<F, E>(&self, mut predicate: F) -> Result<PollOutcome, PollError<E>>
    where
        F: FnMut() -> Result<bool, E>,
    {
        if self.interval.is_zero() {
            return Err(PollError::InvalidSchedule("interval must be greater than zero"));
        }
        if self.timeout.is_zero() {
            return Err(PollError::InvalidSchedule("timeout must be greater than zero"));
        }
        let started = Instant::now();
        let deadline = started
            .checked_add(self.timeout)
            .ok_or(PollError::InvalidSchedule("timeout overflows the clock"))?;
        let mut attempts = 0u32;
        loop {
            attempts = attempts.saturating_add(1);
            match predicate() {
                Ok(true) => {
                    let elapsed = started.elapsed();
                    tracing::debug!(attempts, elapsed_ms = elapsed.as_millis(), "poll satisfied");
                    return Ok(PollOutcome {
                        attempts,
                        elapsed,
                    });
                }
                Ok(false) => {}
                Err(err) => return Err(PollError::Predicate(err)),
            }
            let now = Instant::now();
            if now >= deadline {
                let waited_ms = now.duration_since(started).as_millis();
                tracing::debug!(attempts, waited_ms, "poll deadline expired");
                return Err(PollError::Timeout {
                    attempts,
                    waited_ms,
                });
            }
            sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Polls an infallible predicate until it returns `true`.
    ///
    /// # Errors
    ///
    /// Returns [`PollError::Timeout`] when the deadline passes and
    /// [`PollError::InvalidSchedule`] for a zero interval or timeout.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<PollOutcome, PollError<Infallible>>
    where
        F: FnMut() -> bool,
    {
        self.wait_until(|| Ok::<bool, Infallible>(predicate())).await
    }
}

/// Polls `predicate` every `interval` until it holds or `timeout` elapses.
///
/// # Errors
///
/// See [`Poller::wait_until`].
pub async fn wait_until<F, E>(
    predicate: F,
    interval: Duration,
    timeout: Duration,
) -> Result<PollOutcome, PollError<E>>
where
    F: FnMut() -> Result<bool, E>,
{
    Poller::new(interval, timeout).wait_until(predicate).await
}
