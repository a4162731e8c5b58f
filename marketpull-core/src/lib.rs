//! Marketpull Core: resilient retrieval of market data from a rate-limited API.
//!
//! This crate contains the retrieval engine:
//! - Date range planning (period-end target dates, decade windows)
//! - Failure classification with per-kind backoff
//! - A retry loop that returns shaped placeholders instead of failing
//! - Window assembly into one duplicate-free, date-ordered series
//! - The downloader operations, flat-file store and chain archive

pub mod archive;
pub mod assemble;
pub mod config;
pub mod downloader;
pub mod error;
pub mod frame;
pub mod planner;
pub mod retry;
pub mod shape;
pub mod store;
pub mod upstream;

pub use config::FetchConfig;
pub use downloader::{
    ChainKind, ChainQuery, ChainSeries, DataQuery, Downloader, SeriesRetrieval, TimeseriesQuery,
    WindowReport,
};
pub use error::EngineError;
pub use retry::{BackoffPolicy, FailureKind, Retrieval};
