//! Upstream client trait, request types and structured upstream errors.
//!
//! The MarketDataClient trait abstracts over the remote market-data API so the
//! engine can be driven by the HTTP client in production and by scripted
//! fakes in tests. Clients never retry; the retrying fetcher sits above them.

use chrono::NaiveDate;
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::EngineError;

/// Extra request parameters passed through to the upstream verbatim.
pub type Params = BTreeMap<String, String>;

/// What an upstream call hands back.
///
/// Some endpoints return a bare table, others a table paired with metadata
/// (warnings, partial-resolution errors). [`crate::shape::unpack`] reduces
/// either form to the table.
#[derive(Debug, Clone)]
pub enum Payload {
    Table(DataFrame),
    Tuple(Vec<Payload>),
    Value(serde_json::Value),
}

impl Payload {
    /// Table paired with a metadata value.
    pub fn with_meta(table: DataFrame, meta: serde_json::Value) -> Self {
        Payload::Tuple(vec![Payload::Table(table), Payload::Value(meta)])
    }

    /// Metadata attached to a `(table, metadata)` pair, if any.
    pub fn meta(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Tuple(items) => items.iter().skip(1).find_map(|item| match item {
                Payload::Value(v) => Some(v),
                _ => None,
            }),
            _ => None,
        }
    }
}

/// Structured upstream failure.
///
/// The upstream does not publish a stable code table, so the classifier reads
/// the rendered message; every variant keeps whatever code it saw in there.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    #[error("transport error: {0}")]
    Transport(String),

    /// No response within the client's request timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("upstream error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("no data returned: {0}")]
    Empty(String),

    #[error("unexpected response: {0}")]
    Malformed(String),
}

/// Index or ETP chain as of one date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainRequest {
    /// Identifier as sent upstream, prefix included.
    pub instrument: String,
    pub date: NaiveDate,
    pub fields: Vec<String>,
    pub params: Params,
}

/// One window of a time series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesRequest {
    pub instrument: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub fields: Vec<String>,
    pub interval: Interval,
    pub adjustment: Adjustment,
    pub calendar: Option<String>,
    pub count: Option<u32>,
}

/// Reference data for a list of instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRequest {
    pub instruments: Vec<String>,
    pub fields: Vec<String>,
    pub params: Params,
}

/// Sampling interval of a time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Minute,
    Hour,
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::Hour => "hour",
            Interval::Daily => "daily",
            Interval::Weekly => "weekly",
            Interval::Monthly => "monthly",
            Interval::Quarterly => "quarterly",
            Interval::Yearly => "yearly",
        }
    }
}

impl FromStr for Interval {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "minute" => Ok(Interval::Minute),
            "hour" => Ok(Interval::Hour),
            "daily" => Ok(Interval::Daily),
            "weekly" => Ok(Interval::Weekly),
            "monthly" => Ok(Interval::Monthly),
            "quarterly" => Ok(Interval::Quarterly),
            "yearly" => Ok(Interval::Yearly),
            other => Err(EngineError::InvalidParameter(format!(
                "unknown interval '{other}'"
            ))),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Corporate action adjustment of returned prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adjustment {
    #[default]
    Adjusted,
    Unadjusted,
}

impl Adjustment {
    pub fn as_str(self) -> &'static str {
        match self {
            Adjustment::Adjusted => "adjusted",
            Adjustment::Unadjusted => "unadjusted",
        }
    }
}

impl FromStr for Adjustment {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "adjusted" => Ok(Adjustment::Adjusted),
            "unadjusted" => Ok(Adjustment::Unadjusted),
            other => Err(EngineError::InvalidParameter(format!(
                "unknown adjustment '{other}': choose adjusted or unadjusted"
            ))),
        }
    }
}

/// Capability-typed client for the remote market-data API.
///
/// Implementations perform exactly one upstream call per method invocation
/// and report any failure as an [`UpstreamError`].
pub trait MarketDataClient: Send + Sync {
    /// Human-readable name of this client.
    fn name(&self) -> &str;

    /// Constituents of an index or ETP chain as of a date.
    fn fetch_chain(&self, request: &ChainRequest) -> Result<Payload, UpstreamError>;

    /// Time series for one instrument over one window.
    ///
    /// Tables carry a `date` column plus one column per requested field.
    fn fetch_timeseries(&self, request: &TimeseriesRequest) -> Result<Payload, UpstreamError>;

    /// Reference fields for a list of instruments.
    fn fetch_data(&self, request: &DataRequest) -> Result<Payload, UpstreamError>;
}

impl<C: MarketDataClient + ?Sized> MarketDataClient for Box<C> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn fetch_chain(&self, request: &ChainRequest) -> Result<Payload, UpstreamError> {
        (**self).fetch_chain(request)
    }

    fn fetch_timeseries(&self, request: &TimeseriesRequest) -> Result<Payload, UpstreamError> {
        (**self).fetch_timeseries(request)
    }

    fn fetch_data(&self, request: &DataRequest) -> Result<Payload, UpstreamError> {
        (**self).fetch_data(request)
    }
}
