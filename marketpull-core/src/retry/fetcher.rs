//! The retry loop around a single logical upstream query.
//!
//! Every attempt is preceded by the fixed request delay. A failed attempt is
//! classified, the process sleeps for that kind's delay, and the budget
//! shrinks by one, the last failure included. When the budget is spent the
//! caller gets the shaped placeholder plus a message; upstream failures never
//! escape as errors, so batch jobs over many instruments run to completion.
//!
//! The sleeps are blocking on purpose: they serialize outbound traffic
//! against the provider's request quota.

use super::classify::{classify, BackoffPolicy, FailureKind};
use crate::error::EngineError;
use crate::upstream::UpstreamError;
use std::sync::Mutex;
use std::time::Duration;

/// Outcome of one logical retrieval: the value, or a placeholder plus error.
#[derive(Debug, Clone, PartialEq)]
pub enum Retrieval<T> {
    Complete(T),
    Failed { placeholder: T, error: String },
}

impl<T> Retrieval<T> {
    pub fn is_complete(&self) -> bool {
        matches!(self, Retrieval::Complete(_))
    }

    /// The table either way: real data or the placeholder.
    pub fn value(&self) -> &T {
        match self {
            Retrieval::Complete(value) => value,
            Retrieval::Failed { placeholder, .. } => placeholder,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Retrieval::Complete(_) => None,
            Retrieval::Failed { error, .. } => Some(error),
        }
    }

    pub fn into_value(self) -> T {
        match self {
            Retrieval::Complete(value) => value,
            Retrieval::Failed { placeholder, .. } => placeholder,
        }
    }

    /// `(table, error)` pair for callers that log and move on.
    pub fn into_parts(self) -> (T, Option<String>) {
        match self {
            Retrieval::Complete(value) => (value, None),
            Retrieval::Failed { placeholder, error } => (placeholder, Some(error)),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Retrieval<U> {
        match self {
            Retrieval::Complete(value) => Retrieval::Complete(f(value)),
            Retrieval::Failed { placeholder, error } => Retrieval::Failed {
                placeholder: f(placeholder),
                error,
            },
        }
    }
}

/// Why a single attempt did not produce a value.
#[derive(Debug)]
pub enum AttemptError {
    /// Retryable upstream failure.
    Upstream(UpstreamError),
    /// Caller bug; surfaces immediately.
    Fatal(EngineError),
}

impl From<UpstreamError> for AttemptError {
    fn from(e: UpstreamError) -> Self {
        AttemptError::Upstream(e)
    }
}

impl From<EngineError> for AttemptError {
    fn from(e: EngineError) -> Self {
        AttemptError::Fatal(e)
    }
}

/// Result of a retry loop plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct RetryReport<T> {
    pub retrieval: Retrieval<T>,
    /// Upstream calls issued, successful one included.
    pub attempts: u32,
    pub last_failure: Option<FailureKind>,
}

/// Blocks the current thread between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Real sleeping via `std::thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested sleeps without blocking.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().into_iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

/// Retry loop bound to a policy, a sleeper and an attempt budget.
pub struct RetryingFetcher<'a> {
    policy: &'a BackoffPolicy,
    sleeper: &'a dyn Sleeper,
    max_retries: u32,
}

impl<'a> RetryingFetcher<'a> {
    /// `max_retries` is the total number of upstream calls allowed.
    pub fn new(policy: &'a BackoffPolicy, sleeper: &'a dyn Sleeper, max_retries: u32) -> Self {
        Self {
            policy,
            sleeper,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Run `call` until it succeeds or the budget is spent.
    ///
    /// `placeholder` builds the shaped empty value returned on exhaustion.
    /// Only [`AttemptError::Fatal`] ends the loop with `Err`.
    pub fn fetch<T, F, P>(
        &self,
        label: &str,
        mut call: F,
        placeholder: P,
    ) -> Result<RetryReport<T>, EngineError>
    where
        F: FnMut() -> Result<T, AttemptError>,
        P: FnOnce() -> Result<T, EngineError>,
    {
        let mut remaining = self.max_retries;
        let mut attempts = 0;
        let mut last_failure = None;
        let mut last_message = None;

        while remaining > 0 {
            self.sleeper.sleep(self.policy.request_delay());
            attempts += 1;
            tracing::info!("Downloading {label} (attempt {attempts}/{}).", self.max_retries);

            match call() {
                Ok(value) => {
                    tracing::info!("Successfully downloaded {label}.");
                    return Ok(RetryReport {
                        retrieval: Retrieval::Complete(value),
                        attempts,
                        last_failure,
                    });
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Upstream(e)) => {
                    let kind = classify(&e);
                    let delay = self.policy.delay_for(kind);
                    tracing::warn!(
                        "{kind} for {label}: {e}. Sleeping for {:.0}s.",
                        delay.as_secs_f64()
                    );
                    self.sleeper.sleep(delay);
                    last_failure = Some(kind);
                    last_message = Some(e.to_string());
                    remaining -= 1;
                }
            }
        }

        tracing::error!(
            "Data retrieval for {label} failed after {} retries.",
            self.max_retries
        );
        let error = match last_message {
            Some(message) => format!("Max retries exceeded: {message}"),
            None => "Max retries exceeded.".to_string(),
        };
        Ok(RetryReport {
            retrieval: Retrieval::Failed {
                placeholder: placeholder()?,
                error,
            },
            attempts,
            last_failure,
        })
    }
}
