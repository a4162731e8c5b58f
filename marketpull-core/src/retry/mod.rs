//! Failure classification, backoff policy and the retrying fetcher.

pub mod classify;
pub mod fetcher;

pub use classify::{classify, classify_message, BackoffPolicy, FailureKind};
pub use fetcher::{
    AttemptError, RecordingSleeper, RetryReport, RetryingFetcher, Retrieval, Sleeper,
    ThreadSleeper,
};
