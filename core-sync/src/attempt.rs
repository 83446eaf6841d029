//! # Per-Item Attempt State Machine
//!
//! Tracks retries of a single change item independently of any concurrency
//! primitive.
//!
//! ## State Machine
//!
//! ```text
//! Pending → Attempting(1) → Succeeded
//!               ↓    ↑
//!               ↓    └── Attempting(n+1)   (transient failure, n < max)
//!               ↓
//!             Failed                        (permanent failure, or n == max)
//! ```
//!
//! `Succeeded` and `Failed` are terminal. The worker drives the machine and
//! asks [`RetryPolicy::delay_for`] how long to sleep between attempts.
//!
//! A fallback phase may follow a failed one through
//! [`ItemAttempt::restart_phase`]. All phases share one budget of
//! `max_attempts`; [`ItemAttempt::reserve`] holds attempts back from the
//! first phase so that a fallback is still possible after transient failures.

use crate::{Result, SyncError};
use core_runtime::BackupConfig;
use rand::Rng;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Attempt State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Pending,
    /// Attempt number `n` (1-based) is in flight
    Attempting(u32),
    Succeeded,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::Failed)
    }
}

impl fmt::Display for AttemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptState::Pending => f.write_str("pending"),
            AttemptState::Attempting(n) => write!(f, "attempting({})", n),
            AttemptState::Succeeded => f.write_str("succeeded"),
            AttemptState::Failed => f.write_str("failed"),
        }
    }
}

/// What the worker should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then start attempt `next_attempt`
    Retry { next_attempt: u32 },
    GiveUp,
}

/// Attempt bookkeeping for one change item.
#[derive(Debug, Clone)]
pub struct ItemAttempt {
    state: AttemptState,
    max_attempts: u32,
    /// Attempts consumed by earlier phases (e.g. before an extract fallback)
    carried_attempts: u32,
    /// Attempts the current phase may not use
    reserved: u32,
}

impl ItemAttempt {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: AttemptState::Pending,
            max_attempts: max_attempts.max(1),
            carried_attempts: 0,
            reserved: 0,
        }
    }

    /// Hold back up to `attempts` from the current phase for a later one. The
    /// current phase always keeps at least one attempt.
    pub fn reserve(mut self, attempts: u32) -> Self {
        let available = self.max_attempts.saturating_sub(self.carried_attempts);
        self.reserved = attempts.min(available.saturating_sub(1));
        self
    }

    /// Attempts the current phase may start in total.
    fn phase_budget(&self) -> u32 {
        self.max_attempts
            .saturating_sub(self.carried_attempts)
            .saturating_sub(self.reserved)
    }

    /// Attempts left for later phases once the current one is terminal.
    pub fn remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts())
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Total attempts started so far, across phases.
    pub fn attempts(&self) -> u32 {
        let current = match self.state {
            AttemptState::Pending => 0,
            AttemptState::Attempting(n) => n,
            AttemptState::Succeeded | AttemptState::Failed => 0,
        };
        self.carried_attempts + current
    }

    /// Pending → Attempting(1). Returns the attempt number.
    pub fn begin(&mut self) -> Result<u32> {
        self.transition(AttemptState::Attempting(1))?;
        Ok(1)
    }

    /// Attempting(n) → Attempting(n + 1) after a retry was granted.
    pub fn retry(&mut self) -> Result<u32> {
        let AttemptState::Attempting(n) = self.state else {
            return Err(self.invalid(AttemptState::Attempting(1), "no attempt in flight"));
        };
        self.transition(AttemptState::Attempting(n + 1))?;
        Ok(n + 1)
    }

    pub fn succeed(&mut self) -> Result<()> {
        self.transition(AttemptState::Succeeded)
    }

    /// Record a failed attempt and decide whether another one is allowed.
    ///
    /// Permanent failures and exhausted budgets move to `Failed`.
    pub fn record_failure(&mut self, transient: bool) -> Result<RetryDecision> {
        let AttemptState::Attempting(n) = self.state else {
            return Err(self.invalid(AttemptState::Failed, "no attempt in flight"));
        };

        if transient && n < self.phase_budget() {
            return Ok(RetryDecision::Retry { next_attempt: n + 1 });
        }

        self.transition(AttemptState::Failed)?;
        self.carried_attempts += n;
        Ok(RetryDecision::GiveUp)
    }

    /// Start a fallback phase with whatever budget is left, reserved attempts
    /// included. Only valid from `Failed` with attempts remaining.
    pub fn restart_phase(&mut self) -> Result<()> {
        if self.state != AttemptState::Failed {
            return Err(self.invalid(AttemptState::Pending, "only a failed phase can restart"));
        }
        if self.remaining() == 0 {
            return Err(self.invalid(AttemptState::Pending, "attempt budget exhausted"));
        }
        self.state = AttemptState::Pending;
        self.reserved = 0;
        Ok(())
    }

    fn transition(&mut self, to: AttemptState) -> Result<()> {
        validate_transition(self.state, to, self.phase_budget())?;
        if to == AttemptState::Succeeded {
            if let AttemptState::Attempting(n) = self.state {
                self.carried_attempts += n;
            }
        }
        self.state = to;
        Ok(())
    }

    fn invalid(&self, to: AttemptState, reason: &str) -> SyncError {
        SyncError::InvalidStateTransition {
            from: self.state.to_string(),
            to: to.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Transition rules, independent of who drives the machine.
pub fn validate_transition(from: AttemptState, to: AttemptState, max_attempts: u32) -> Result<()> {
    let valid = match (from, to) {
        (AttemptState::Pending, AttemptState::Attempting(1)) => true,

        (AttemptState::Attempting(n), AttemptState::Attempting(m)) => m == n + 1 && m <= max_attempts,
        (AttemptState::Attempting(_), AttemptState::Succeeded) => true,
        (AttemptState::Attempting(_), AttemptState::Failed) => true,

        // Terminal states cannot transition
        (AttemptState::Succeeded, _) => false,
        (AttemptState::Failed, _) => false,

        _ => false,
    };

    if !valid {
        return Err(SyncError::InvalidStateTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason: format!("Cannot transition from {} to {}", from, to),
        });
    }

    Ok(())
}

// ============================================================================
// Retry Policy
// ============================================================================

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackupConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BackupConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
            max_backoff: config.max_backoff,
            jitter: config.jitter,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay before `next_attempt` (2-based: the first retry is attempt 2).
    ///
    /// `initial * 2^(next_attempt - 2)`, capped at `max_backoff`. With jitter
    /// the delay is drawn uniformly from the upper half of that value.
    pub fn delay_for(&self, next_attempt: u32) -> Duration {
        let exponent = next_attempt.saturating_sub(2).min(20);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        if !self.jitter || base.is_zero() {
            return base;
        }

        let millis = base.as_millis() as u64;
        let low = millis / 2;
        Duration::from_millis(rand::thread_rng().gen_range(low..=millis))
    }

    pub fn new_attempt(&self) -> ItemAttempt {
        ItemAttempt::new(self.max_attempts)
    }
}
