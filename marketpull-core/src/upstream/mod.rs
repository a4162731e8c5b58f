//! Upstream market-data API boundary.

pub mod http;
pub mod provider;

pub use http::HttpClient;
pub use provider::{
    Adjustment, ChainRequest, DataRequest, Interval, MarketDataClient, Params, Payload,
    TimeseriesRequest, UpstreamError,
};
