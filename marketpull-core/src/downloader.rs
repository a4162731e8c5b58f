//! Downloader: the logical retrieval operations on top of the retry engine.
//!
//! Each operation builds an upstream request, runs it through a
//! [`RetryingFetcher`] and shapes the outcome. Upstream failures come back as
//! [`Retrieval::Failed`] values; only caller mistakes and local frame errors
//! surface as [`EngineError`].

use crate::assemble::{join_errors, join_onto, merge_windows, stack_aligned};
use crate::config::FetchConfig;
use crate::error::EngineError;
use crate::frame::{date_column, dates_of, missing_ratios, value_columns, DATE_COLUMN};
use crate::planner::generate_decade_dates;
use crate::retry::{
    AttemptError, BackoffPolicy, RetryReport, RetryingFetcher, Retrieval, Sleeper, ThreadSleeper,
};
use crate::shape::{empty_chain, empty_data, empty_on_dates, empty_window, unpack};
use crate::upstream::{
    Adjustment, ChainRequest, DataRequest, Interval, MarketDataClient, Params, Payload,
    TimeseriesRequest, UpstreamError,
};
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Prefix turning an index code into its chain identifier.
pub const INDEX_CHAIN_PREFIX: &str = "0#.";
/// Prefix turning an index code into its price series identifier.
pub const INDEX_SERIES_PREFIX: &str = ".";
/// Maximum NaN share per column accepted by [`Downloader::index_data`].
pub const DEFAULT_NAN_RATIO: f64 = 0.25;
/// Upstream cell error code for identifiers that could not all be resolved.
const PARTIAL_RESOLUTION_CODE: i64 = 412;

/// Which kind of chain to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainKind {
    Index,
    Etp,
}

impl ChainKind {
    pub fn prefix(self) -> &'static str {
        match self {
            ChainKind::Index => INDEX_CHAIN_PREFIX,
            ChainKind::Etp => "",
        }
    }

    /// Directory holding saved chains of this kind.
    pub fn folder(self) -> &'static str {
        match self {
            ChainKind::Index => "index_chain",
            ChainKind::Etp => "etp_chain",
        }
    }
}

/// Chain constituents as of one date.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainQuery {
    pub ric: String,
    pub date: NaiveDate,
    pub kind: ChainKind,
    pub fields: Vec<String>,
    pub params: Params,
}

impl ChainQuery {
    pub fn index(ric: impl Into<String>, date: NaiveDate, fields: Vec<String>) -> Self {
        Self {
            ric: ric.into(),
            date,
            kind: ChainKind::Index,
            fields,
            params: Params::new(),
        }
    }

    pub fn etp(ric: impl Into<String>, date: NaiveDate, fields: Vec<String>) -> Self {
        Self {
            kind: ChainKind::Etp,
            ..Self::index(ric, date, fields)
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Identifier as sent upstream.
    pub fn instrument(&self) -> String {
        format!("{}{}", self.kind.prefix(), self.ric)
    }
}

/// Chains for a series of dates, oldest first.
#[derive(Debug, Clone)]
pub struct ChainSeries {
    pub entries: Vec<(NaiveDate, Retrieval<DataFrame>)>,
}

impl ChainSeries {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(date, error)` for every date whose chain could not be retrieved.
    pub fn errors(&self) -> Vec<(NaiveDate, &str)> {
        self.entries
            .iter()
            .filter_map(|(date, r)| r.error().map(|e| (*date, e)))
            .collect()
    }

    /// Retrieved chains stacked into one table with a leading `date` column.
    ///
    /// Dates whose chain failed are left out.
    pub fn to_frame(&self) -> Result<DataFrame, EngineError> {
        let mut frames = Vec::new();
        for (date, retrieval) in &self.entries {
            let Retrieval::Complete(table) = retrieval else {
                continue;
            };
            let mut table = table.clone();
            let dates = vec![*date; table.height()];
            table.insert_column(0, date_column(DATE_COLUMN, &dates)?)?;
            frames.push(table);
        }
        stack_aligned(frames)
    }
}

/// Time series over a range that is split into decade windows.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeseriesQuery {
    pub ric: String,
    pub end: NaiveDate,
    pub num_years: Option<u32>,
    pub start: Option<NaiveDate>,
    pub fields: Vec<String>,
    pub interval: Interval,
    pub adjustment: Adjustment,
    pub calendar: Option<String>,
    pub count: Option<u32>,
}

impl TimeseriesQuery {
    /// Daily adjusted `CLOSE` for the `num_years` years up to `end`.
    pub fn years(ric: impl Into<String>, end: NaiveDate, num_years: u32) -> Self {
        Self {
            ric: ric.into(),
            end,
            num_years: Some(num_years),
            start: None,
            fields: vec!["CLOSE".to_string()],
            interval: Interval::Daily,
            adjustment: Adjustment::Adjusted,
            calendar: None,
            count: None,
        }
    }

    /// Daily adjusted `CLOSE` over `[start, end]`.
    pub fn between(ric: impl Into<String>, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            num_years: None,
            start: Some(start),
            ..Self::years(ric, end, 1)
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_interval(mut self, interval: Interval) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_adjustment(mut self, adjustment: Adjustment) -> Self {
        self.adjustment = adjustment;
        self
    }

    /// Output column names: the identifier for a single field,
    /// `"{ric}|{field}"` otherwise.
    pub fn output_columns(&self) -> Vec<String> {
        if self.fields.len() == 1 {
            vec![self.ric.clone()]
        } else {
            self.fields
                .iter()
                .map(|field| format!("{}|{field}", self.ric))
                .collect()
        }
    }
}

/// Bookkeeping for one decade window.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Assembled series plus what happened in each window.
#[derive(Debug, Clone)]
pub struct SeriesRetrieval {
    pub result: Retrieval<DataFrame>,
    pub windows: Vec<WindowReport>,
}

impl SeriesRetrieval {
    pub fn is_complete(&self) -> bool {
        self.result.is_complete()
    }

    pub fn failed_windows(&self) -> impl Iterator<Item = &WindowReport> {
        self.windows.iter().filter(|w| w.error.is_some())
    }
}

/// Reference fields for a set of instruments at one date.
#[derive(Debug, Clone, PartialEq)]
pub struct DataQuery {
    pub instruments: Vec<String>,
    pub fields: Vec<String>,
    pub date: NaiveDate,
    pub prefix: Option<String>,
    /// Sent verbatim; when empty, `SDate` and `EDate` default to `date`.
    pub params: Params,
}

impl DataQuery {
    pub fn new(instruments: Vec<String>, fields: Vec<String>, date: NaiveDate) -> Self {
        Self {
            instruments,
            fields,
            date,
            prefix: None,
            params: Params::new(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    fn resolved_instruments(&self) -> Vec<String> {
        match &self.prefix {
            Some(prefix) => self
                .instruments
                .iter()
                .map(|ric| format!("{prefix}{ric}"))
                .collect(),
            None => self.instruments.clone(),
        }
    }

    fn resolved_params(&self) -> Params {
        if !self.params.is_empty() {
            return self.params.clone();
        }
        let date = self.date.to_string();
        Params::from([
            ("SDate".to_string(), date.clone()),
            ("EDate".to_string(), date),
        ])
    }
}

/// Retrieval operations against one upstream client.
pub struct Downloader<C> {
    client: C,
    policy: BackoffPolicy,
    max_retries: u32,
    sleeper: Arc<dyn Sleeper>,
}

impl<C: MarketDataClient> Downloader<C> {
    pub fn new(client: C, policy: BackoffPolicy) -> Self {
        Self {
            client,
            policy,
            max_retries: crate::config::DEFAULT_MAX_RETRIES,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn from_config(client: C, config: &FetchConfig) -> Self {
        Self::new(client, config.backoff.clone()).with_max_retries(config.max_retries)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    fn fetcher(&self) -> RetryingFetcher<'_> {
        RetryingFetcher::new(&self.policy, self.sleeper.as_ref(), self.max_retries)
    }

    /// Chain constituents as of `query.date`.
    pub fn chain(&self, query: &ChainQuery) -> Result<RetryReport<DataFrame>, EngineError> {
        if query.ric.is_empty() {
            return Err(EngineError::InvalidParameter("chain RIC cannot be empty".into()));
        }
        let instrument = query.instrument();
        let request = ChainRequest {
            instrument: instrument.clone(),
            date: query.date,
            fields: query.fields.clone(),
            params: query.params.clone(),
        };
        let label = format!("{instrument} at {}", query.date);

        self.fetcher().fetch(
            &label,
            || {
                let table = unpack(self.client.fetch_chain(&request)?)?;
                if table.height() == 0 {
                    return Err(UpstreamError::Empty(label.clone()).into());
                }
                Ok(table)
            },
            || empty_chain(&instrument),
        )
    }

    /// Chains of `ric` for every date, oldest first.
    ///
    /// Repeated dates are fetched once.
    pub fn chain_series(
        &self,
        kind: ChainKind,
        ric: &str,
        dates: &[NaiveDate],
        fields: &[String],
    ) -> Result<ChainSeries, EngineError> {
        let mut unique: Vec<NaiveDate> = Vec::with_capacity(dates.len());
        for date in dates {
            if !unique.contains(date) {
                unique.push(*date);
            }
        }
        unique.sort();

        let mut entries = Vec::with_capacity(unique.len());
        for date in unique {
            let query = ChainQuery {
                ric: ric.to_string(),
                date,
                kind,
                fields: fields.to_vec(),
                params: Params::new(),
            };
            let report = self.chain(&query)?;
            if let Some(error) = report.retrieval.error() {
                tracing::error!("Chain {} at {date} failed: {error}", query.instrument());
            }
            entries.push((date, report.retrieval));
        }
        Ok(ChainSeries { entries })
    }

    /// Time series of one instrument, assembled from decade windows.
    ///
    /// With an `accumulator` the series is outer-joined onto it by date and a
    /// failed window is padded on the accumulator's dates; otherwise on every
    /// calendar day of the window. Partial failures still yield `Complete`,
    /// with the failed windows listed in the report.
    pub fn stock_timeseries(
        &self,
        query: &TimeseriesQuery,
        accumulator: Option<DataFrame>,
    ) -> Result<SeriesRetrieval, EngineError> {
        if query.ric.is_empty() {
            return Err(EngineError::InvalidParameter("RIC cannot be empty".into()));
        }
        if query.fields.is_empty() {
            return Err(EngineError::InvalidParameter("field list cannot be empty".into()));
        }
        if let Some((i, field)) = query
            .fields
            .iter()
            .enumerate()
            .find(|(i, f)| query.fields[..*i].iter().any(|g| g.eq_ignore_ascii_case(f)))
        {
            return Err(EngineError::InvalidParameter(format!(
                "field '{field}' is requested twice (position {i})"
            )));
        }
        let windows = generate_decade_dates(query.end, query.num_years, query.start)?;
        let known_dates = accumulator.as_ref().map(dates_of).transpose()?;
        let columns = query.output_columns();

        let mut frames = Vec::with_capacity(windows.len());
        let mut reports = Vec::with_capacity(windows.len());

        for (start, end) in windows.windows() {
            let request = TimeseriesRequest {
                instrument: query.ric.clone(),
                start,
                end,
                fields: query.fields.clone(),
                interval: query.interval,
                adjustment: query.adjustment,
                calendar: query.calendar.clone(),
                count: query.count,
            };
            let label = format!("{} from {start} to {end}", query.ric);

            let report = self.fetcher().fetch(
                &label,
                || {
                    let payload = self.client.fetch_timeseries(&request)?;
                    name_series(unpack(payload)?, query, &label)
                },
                || match &known_dates {
                    Some(dates) => {
                        let inside: Vec<NaiveDate> = dates
                            .iter()
                            .copied()
                            .filter(|d| *d >= start && *d <= end)
                            .collect();
                        empty_on_dates(&columns, &inside)
                    }
                    None => empty_window(&columns, start, end),
                },
            )?;

            if report.retrieval.error().is_some() {
                tracing::warn!("No data retrieved for {label}, adding NaNs.");
            }
            let (frame, error) = report.retrieval.into_parts();
            reports.push(WindowReport {
                start,
                end,
                attempts: report.attempts,
                error,
            });
            frames.push(frame);
        }

        let merged = merge_windows(frames)?;
        let shaped = match accumulator {
            Some(acc) => join_onto(acc, merged)?,
            None => merged,
        };
        tracing::info!(
            "Finished downloading {} from {} to {}.",
            query.ric,
            windows.first_start().unwrap_or(query.end),
            query.end
        );

        let result = if reports.iter().all(|r| r.error.is_some()) {
            Retrieval::Failed {
                placeholder: shaped,
                error: join_errors(reports.iter().filter_map(|r| r.error.as_deref())),
            }
        } else {
            Retrieval::Complete(shaped)
        };
        Ok(SeriesRetrieval {
            result,
            windows: reports,
        })
    }

    /// Price series of an index: the code gets the `"."` prefix and a single
    /// field is named after the prefixed code.
    pub fn index_timeseries(&self, query: &TimeseriesQuery) -> Result<SeriesRetrieval, EngineError> {
        let prefixed = TimeseriesQuery {
            ric: format!("{INDEX_SERIES_PREFIX}{}", query.ric),
            ..query.clone()
        };
        self.stock_timeseries(&prefixed, None)
    }

    /// Reference fields for many instruments at one date.
    ///
    /// A table counts only when it has more rows than a tenth of the
    /// requested instruments, unless the upstream reports that some
    /// identifiers could not be resolved; then whatever came back is kept.
    pub fn constituents_data(&self, query: &DataQuery) -> Result<RetryReport<DataFrame>, EngineError> {
        if query.instruments.is_empty() {
            return Err(EngineError::InvalidParameter("RIC list cannot be empty".into()));
        }
        if query.fields.is_empty() {
            return Err(EngineError::InvalidParameter("field list cannot be empty".into()));
        }
        let instruments = query.resolved_instruments();
        let request = DataRequest {
            instruments: instruments.clone(),
            fields: query.fields.clone(),
            params: query.resolved_params(),
        };
        let threshold = instruments.len() / 10;
        let label = format!(
            "{} instruments with fields {:?} at {}",
            instruments.len(),
            query.fields,
            query.date
        );

        self.fetcher().fetch(
            &label,
            || {
                let payload = self.client.fetch_data(&request)?;
                let unresolved = partial_resolution(&payload);
                let table = unpack(payload)?;
                if table.height() > threshold {
                    return Ok(table);
                }
                if !unresolved.is_empty() {
                    for message in &unresolved {
                        tracing::warn!(
                            "Unable to resolve all requested identifiers: {message}. \
                             Returning received data of {label}."
                        );
                    }
                    return Ok(table);
                }
                Err(AttemptError::Upstream(UpstreamError::Empty(format!(
                    "{} rows for {label}",
                    table.height()
                ))))
            },
            || empty_data(&instruments, &query.fields),
        )
    }

    /// Reference fields of a single index, rejected when any column has a
    /// missing share of `nan_ratio` or more.
    pub fn index_data(
        &self,
        query: &DataQuery,
        nan_ratio: f64,
    ) -> Result<Retrieval<DataFrame>, EngineError> {
        if query.instruments.len() != 1 {
            return Err(EngineError::InvalidParameter(format!(
                "index data takes exactly one RIC, got {}",
                query.instruments.len()
            )));
        }
        if !(0.0..=1.0).contains(&nan_ratio) {
            return Err(EngineError::InvalidParameter(format!(
                "nan_ratio must lie in [0, 1], got {nan_ratio}"
            )));
        }

        let report = self.constituents_data(query)?;
        let table = match report.retrieval {
            Retrieval::Complete(table) => table,
            failed @ Retrieval::Failed { .. } => {
                tracing::error!(
                    "Finally failed to download index data for {}: {}",
                    query.instruments[0],
                    failed.error().unwrap_or_default()
                );
                return Ok(failed);
            }
        };

        let sparse = missing_ratios(&table)
            .into_iter()
            .find(|(_, ratio)| *ratio >= nan_ratio);
        match sparse {
            Some((column, ratio)) => {
                let error = format!(
                    "column '{column}' is {:.0}% empty (limit {:.0}%)",
                    ratio * 100.0,
                    nan_ratio * 100.0
                );
                tracing::error!(
                    "Rejected index data for {}: {error}",
                    query.instruments[0]
                );
                Ok(Retrieval::Failed {
                    placeholder: empty_data(&query.resolved_instruments(), &query.fields)?,
                    error,
                })
            }
            None => Ok(Retrieval::Complete(table)),
        }
    }
}

/// Name the value columns of a window table after the query.
///
/// Columns follow `query.fields` order; a requested field the window lacks is
/// NaN-filled. Tables without a date column, without values, or with a value
/// column that was never requested count as a retryable failure.
fn name_series(
    table: DataFrame,
    query: &TimeseriesQuery,
    label: &str,
) -> Result<DataFrame, AttemptError> {
    let Ok(dates) = table.column(DATE_COLUMN) else {
        return Err(UpstreamError::Malformed(format!("{label}: no '{DATE_COLUMN}' column")).into());
    };
    let values = value_columns(&table);
    if table.height() == 0 || values.is_empty() {
        return Err(UpstreamError::Empty(label.to_string()).into());
    }
    if let Some(stray) = values
        .iter()
        .find(|name| !query.fields.iter().any(|f| f.eq_ignore_ascii_case(name)))
    {
        return Err(UpstreamError::Malformed(format!(
            "{label}: unrequested column '{stray}'"
        ))
        .into());
    }

    let mut named = vec![dates.clone()];
    for (field, output) in query.fields.iter().zip(query.output_columns()) {
        let column = match values.iter().find(|name| name.eq_ignore_ascii_case(field)) {
            Some(source) => {
                let mut column = table.column(source).map_err(EngineError::from)?.clone();
                column.rename(output.as_str().into());
                column
            }
            None => {
                tracing::warn!("{label}: no '{field}' returned, adding NaNs.");
                Column::new(output.as_str().into(), vec![f64::NAN; table.height()])
            }
        };
        named.push(column);
    }
    Ok(DataFrame::new(named).map_err(EngineError::from)?)
}

/// Messages of partial-resolution cell errors attached to a payload.
fn partial_resolution(payload: &Payload) -> Vec<String> {
    let Some(serde_json::Value::Array(errors)) = payload.meta() else {
        return Vec::new();
    };
    errors
        .iter()
        .filter(|e| e.get("code").and_then(serde_json::Value::as_i64) == Some(PARTIAL_RESOLUTION_CODE))
        .map(|e| {
            e.get("message")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unresolved identifiers")
                .to_string()
        })
        .collect()
}
