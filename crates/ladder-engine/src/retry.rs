//! Step-boundary retries.
//!
//! Commit conflicts mean another writer got there first: the step is
//! re-evaluated from fresh state, up to a fixed number of times. Transient
//! storage failures are retried with exponential backoff and jitter.
//! Everything else is returned at once.

use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use ladder_core::error::StoreError;

use crate::config::RetryPolicy;
use crate::error::CascadeError;

/// Classifies a failure for the retry loop.
pub trait Retryable {
    fn is_transient(&self) -> bool;
    fn is_conflict(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }

    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

impl Retryable for CascadeError {
    fn is_transient(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_transient)
    }

    fn is_conflict(&self) -> bool {
        self.store_error().is_some_and(StoreError::is_conflict)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Sleep, then try again.
    Backoff(Duration),
    /// Re-evaluate immediately against fresh state.
    Reevaluate,
    GiveUp,
}

/// Retry budget for one step.
pub struct Retrier<'a> {
    policy: &'a RetryPolicy,
    max_conflicts: u32,
    attempts: u32,
    conflicts: u32,
}

impl<'a> Retrier<'a> {
    pub fn new(policy: &'a RetryPolicy, max_conflicts: u32) -> Self {
        Self { policy, max_conflicts, attempts: 1, conflicts: 0 }
    }

    pub fn decide<E: Retryable>(&mut self, err: &E) -> RetryDecision {
        if err.is_conflict() && self.conflicts < self.max_conflicts {
            self.conflicts += 1;
            return RetryDecision::Reevaluate;
        }
        if err.is_transient() && self.attempts < self.policy.max_attempts {
            let delay = jittered(self.policy.backoff_ceiling(self.attempts - 1));
            self.attempts += 1;
            return RetryDecision::Backoff(delay);
        }
        RetryDecision::GiveUp
    }

    /// Run `op` until it succeeds or the budget is spent.
    pub fn run<T, E, F>(&mut self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut() -> Result<T, E>,
    {
        loop {
            let err = match op() {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            match self.decide(&err) {
                RetryDecision::Reevaluate => {
                    warn!(op = what, conflicts = self.conflicts, error = %err, "commit conflict, re-evaluating");
                }
                RetryDecision::Backoff(delay) => {
                    warn!(op = what, attempt = self.attempts, delay_ms = delay.as_millis() as u64, error = %err, "transient storage failure, backing off");
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                RetryDecision::GiveUp => return Err(err),
            }
        }
    }
}

/// Half the ceiling plus a random share of the other half.
fn jittered(ceiling: Duration) -> Duration {
    let ms = ceiling.as_millis() as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    let half = ms / 2;
    Duration::from_millis(half + rand::thread_rng().gen_range(0..=ms - half))
}
