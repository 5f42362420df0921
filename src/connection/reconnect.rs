//! Reconnection backoff and the single pending reattempt timer.
//!
//! `delay(attempt) = 2^attempt * base`, with `base` defaulting to one
//! second. After an unclean closure a reattempt is scheduled while
//! `attempt < max_attempts - 1`; a clean closure (code 1000) never
//! schedules one.
//!
//! | `max_attempts` | Scheduled delays |
//! |---|---|
//! | 1 | none |
//! | 3 | 1s, 2s |
//! | 5 (default) | 1s, 2s, 4s, 8s |
//!
//! The timer is a spawned sleep that posts a ticket on the driver's tick
//! channel. Scheduling a new timer aborts the previous one, and a ticket is
//! only honored if it matches the timer currently pending.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::protocol::CloseInfo;

// ============================================================================
// Constants
// ============================================================================

/// Default number of attempts, counting the initial connection.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay before the first reattempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

// ============================================================================
// Backoff
// ============================================================================

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Attempts allowed, counting the initial connection.
    max_attempts: u32,
    /// Delay for attempt 0.
    base: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

impl Backoff {
    /// Creates a policy.
    #[inline]
    #[must_use]
    pub const fn new(max_attempts: u32, base: Duration) -> Self {
        Self { max_attempts, base }
    }

    /// Attempts allowed, counting the initial connection.
    #[inline]
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before reattempt number `attempt` (zero based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(attempt))
    }

    /// Returns `true` if a reattempt may follow failure number `attempt`.
    #[inline]
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_attempts.saturating_sub(1)
    }

    /// Every delay the policy will ever schedule, in order.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts.saturating_sub(1)).map(|attempt| self.delay(attempt))
    }
}

// ============================================================================
// RetryDecision
// ============================================================================

/// Outcome of reporting a closure to the [`Reconnector`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A reattempt timer is armed.
    Scheduled {
        /// Zero-based reattempt number.
        attempt: u32,
        /// Time until the reattempt.
        delay: Duration,
    },
    /// No attempts left. Terminal until the next explicit connect.
    Exhausted {
        /// Reattempts made before giving up.
        attempts: u32,
    },
    /// The peer closed normally; nothing to recover.
    CleanClosure,
}

// ============================================================================
// Reconnector
// ============================================================================

/// Timer owned by the reconnector.
#[derive(Debug)]
struct PendingRetry {
    /// Ticket posted when the timer fires.
    ticket: u64,
    /// Sleep task.
    task: JoinHandle<()>,
}

/// Tracks failed attempts and owns the single pending reattempt timer.
#[derive(Debug)]
pub struct Reconnector {
    /// Delay policy.
    backoff: Backoff,
    /// Failures since the last successful connection.
    attempt: u32,
    /// Armed timer, if any.
    pending: Option<PendingRetry>,
    /// Next ticket number.
    next_ticket: u64,
    /// Where fired tickets go.
    ticks: mpsc::UnboundedSender<u64>,
}

impl Reconnector {
    /// Creates a reconnector that posts fired tickets on `ticks`.
    #[must_use]
    pub fn new(backoff: Backoff, ticks: mpsc::UnboundedSender<u64>) -> Self {
        Self {
            backoff,
            attempt: 0,
            pending: None,
            next_ticket: 0,
            ticks,
        }
    }

    /// The delay policy.
    #[inline]
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Failures since the last successful connection.
    #[inline]
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns `true` if a reattempt timer is armed.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Reports a closure and arms a timer if the policy allows it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn on_close(&mut self, close: &CloseInfo) -> RetryDecision {
        if close.is_normal() {
            self.cancel();
            return RetryDecision::CleanClosure;
        }

        if !self.backoff.allows(self.attempt) {
            self.cancel();
            debug!(attempts = self.attempt, "Reconnect attempts exhausted");
            return RetryDecision::Exhausted {
                attempts: self.attempt,
            };
        }

        let attempt = self.attempt;
        let delay = self.backoff.delay(attempt);
        self.attempt += 1;
        self.arm(delay);

        debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        RetryDecision::Scheduled { attempt, delay }
    }

    /// Consumes a fired ticket.
    ///
    /// Returns `false` for tickets of timers that were cancelled or
    /// superseded.
    pub fn take_due(&mut self, ticket: u64) -> bool {
        if self
            .pending
            .as_ref()
            .is_some_and(|pending| pending.ticket == ticket)
        {
            self.pending = None;
            return true;
        }

        trace!(ticket, "Ignoring stale reconnect ticket");
        false
    }

    /// Aborts the pending timer. Returns `true` if one was armed.
    pub fn cancel(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.task.abort();
                trace!(ticket = pending.ticket, "Reconnect timer cancelled");
                true
            }
            None => false,
        }
    }

    /// Forgets previous failures.
    #[inline]
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Arms a timer, replacing any pending one.
    fn arm(&mut self, delay: Duration) {
        self.cancel();

        let ticket = self.next_ticket;
        self.next_ticket += 1;

        let ticks = self.ticks.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ticks.send(ticket);
        });

        self.pending = Some(PendingRetry { ticket, task });
    }
}

impl Drop for Reconnector {
    fn drop(&mut self) {
        self.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================
