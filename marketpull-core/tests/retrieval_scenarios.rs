//! End-to-end retrieval scenarios against a deterministic fake upstream.

use chrono::{Datelike, NaiveDate};
use marketpull_core::downloader::{ChainKind, DataQuery, Downloader, TimeseriesQuery};
use marketpull_core::frame::{date_column, dates_of, DATE_COLUMN};
use marketpull_core::planner::generate_target_dates;
use marketpull_core::retry::{BackoffPolicy, FailureKind, RecordingSleeper, Retrieval};
use marketpull_core::upstream::{
    ChainRequest, DataRequest, MarketDataClient, Payload, TimeseriesRequest, UpstreamError,
};
use polars::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

/// Fake upstream that fails on a schedule.
///
/// Every `fail_every`-th call overall answers with a gateway timeout. Time
/// series windows starting on a date in `dead_windows` always fail with a
/// rate limit.
struct FlakyUpstream {
    calls: AtomicU32,
    failures: AtomicU32,
    fail_every: u32,
    dead_windows: HashSet<NaiveDate>,
    chain_rows: usize,
    seen: Mutex<Vec<String>>,
}

impl FlakyUpstream {
    fn new(fail_every: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            fail_every,
            dead_windows: HashSet::new(),
            chain_rows: 3,
            seen: Mutex::new(Vec::new()),
        }
    }

    fn with_dead_window(mut self, start: NaiveDate) -> Self {
        self.dead_windows.insert(start);
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    fn tick(&self, what: String) -> Result<(), UpstreamError> {
        self.seen.lock().unwrap().push(what);
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_every > 0 && n % self.fail_every == 0 {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(UpstreamError::Api {
                code: 2504,
                message: "Gateway Time-out".into(),
            });
        }
        Ok(())
    }
}

impl MarketDataClient for FlakyUpstream {
    fn name(&self) -> &str {
        "flaky"
    }

    fn fetch_chain(&self, request: &ChainRequest) -> Result<Payload, UpstreamError> {
        self.tick(format!("{}({})", request.instrument, request.date))?;
        let rics: Vec<String> = (0..self.chain_rows)
            .map(|i| format!("{i:04}.HK"))
            .collect();
        let table = DataFrame::new(vec![Column::new("Instrument".into(), rics)])
            .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(Payload::Table(table))
    }

    fn fetch_timeseries(&self, request: &TimeseriesRequest) -> Result<Payload, UpstreamError> {
        self.tick(format!("{} {}", request.instrument, request.start))?;
        if self.dead_windows.contains(&request.start) {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(UpstreamError::Status {
                code: 429,
                message: "Too Many Requests".into(),
            });
        }
        // Weekdays only, starting one day early so adjacent windows share
        // a date. Values carry the window's start year.
        let dates: Vec<NaiveDate> = request
            .start
            .pred_opt()
            .unwrap()
            .iter_days()
            .take_while(|day| *day <= request.end)
            .filter(|day| day.weekday().number_from_monday() <= 5)
            .collect();
        let values = vec![request.start.year() as f64; dates.len()];
        let table = DataFrame::new(vec![
            date_column(DATE_COLUMN, &dates).unwrap(),
            Column::new("CLOSE".into(), values),
        ])
        .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(Payload::Table(table))
    }

    fn fetch_data(&self, request: &DataRequest) -> Result<Payload, UpstreamError> {
        self.tick(format!("{:?}", request.instruments))?;
        let table = DataFrame::new(vec![Column::new(
            "Instrument".into(),
            request.instruments.clone(),
        )])
        .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(Payload::Table(table))
    }
}

fn policy() -> BackoffPolicy {
    BackoffPolicy::immediate()
        .with_request_delay(Duration::from_secs(3))
        .with_delay(FailureKind::GatewayTimeout, Duration::from_secs(300))
        .with_delay(FailureKind::RateLimited, Duration::from_secs(21_600))
}

fn downloader(
    upstream: FlakyUpstream,
    max_retries: u32,
) -> (Downloader<FlakyUpstream>, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let dl = Downloader::new(upstream, policy())
        .with_max_retries(max_retries)
        .with_sleeper(sleeper.clone());
    (dl, sleeper)
}

#[test]
fn monthly_chain_survives_gateway_timeouts() {
    let dates = generate_target_dates(d(2024, 12, 31), 3, "months", false).unwrap();
    assert_eq!(dates.len(), 36);

    let (dl, sleeper) = downloader(FlakyUpstream::new(3), 5);
    let series = dl
        .chain_series(ChainKind::Index, "HSI", &dates, &["TR.ISIN".to_string()])
        .unwrap();

    assert_eq!(series.len(), 36);
    assert!(series.errors().is_empty());
    assert!(series.entries.iter().all(|(_, r)| r.is_complete()));

    // 36 successes; every third call fails, so 17 induced retries
    let upstream = dl.client();
    assert_eq!(upstream.failures(), 17);
    assert_eq!(upstream.calls(), 36 + 17);

    // one request delay per call, one gateway delay per failure
    assert_eq!(
        sleeper.total(),
        Duration::from_secs(53 * 3 + 17 * 300)
    );

    let frame = series.to_frame().unwrap();
    assert_eq!(frame.height(), 36 * 3);
    let mut stamped = dates_of(&frame).unwrap();
    stamped.dedup();
    assert_eq!(stamped, dates);
}

#[test]
fn chain_series_fetches_repeated_dates_once() {
    let dates = vec![d(2024, 6, 30), d(2024, 3, 31), d(2024, 6, 30)];
    let (dl, _) = downloader(FlakyUpstream::new(0), 5);
    let series = dl
        .chain_series(ChainKind::Etp, "SPY", &dates, &[])
        .unwrap();

    let got: Vec<NaiveDate> = series.entries.iter().map(|(date, _)| *date).collect();
    assert_eq!(got, vec![d(2024, 3, 31), d(2024, 6, 30)]);
    assert_eq!(
        *dl.client().seen.lock().unwrap(),
        vec!["SPY(2024-03-31)", "SPY(2024-06-30)"]
    );
}

#[test]
fn always_failing_chain_returns_placeholder_after_budget() {
    let (dl, sleeper) = downloader(FlakyUpstream::new(1), 4);
    let series = dl
        .chain_series(ChainKind::Index, "HSI", &[d(2024, 12, 31)], &[])
        .unwrap();

    let errors = series.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].1.contains("Max retries exceeded"));
    assert_eq!(dl.client().calls(), 4);
    assert_eq!(sleeper.total(), Duration::from_secs(4 * 3 + 4 * 300));

    let placeholder = series.entries[0].1.value();
    let value = placeholder.column("0#.HSI").unwrap().f64().unwrap().get(0).unwrap();
    assert!(value.is_nan());
    assert_eq!(series.to_frame().unwrap().height(), 0);
}

#[test]
fn decade_windows_merge_without_duplicate_boundaries() {
    let (dl, _) = downloader(FlakyUpstream::new(0), 3);
    let query = TimeseriesQuery::between("0005.HK", d(2012, 6, 1), d(2024, 12, 31));
    let retrieval = dl.stock_timeseries(&query, None).unwrap();

    assert!(retrieval.is_complete());
    assert_eq!(retrieval.windows.len(), 2);
    assert_eq!(retrieval.windows[0].end, d(2014, 12, 31));
    assert_eq!(retrieval.windows[1].start, d(2015, 1, 1));

    let table = retrieval.result.value();
    let dates = dates_of(table).unwrap();
    assert!(dates.windows(2).all(|pair| pair[0] < pair[1]));
    // the newer window reaches back into the older one; the older row wins
    let boundary = dates.iter().position(|day| *day == d(2014, 12, 31)).unwrap();
    let close = table.column("0005.HK").unwrap().f64().unwrap();
    assert_eq!(close.get(boundary), Some(2012.0));
    assert_eq!(close.get(boundary + 1), Some(2015.0));
    assert_eq!(*dates.last().unwrap(), d(2024, 12, 31));
}

#[test]
fn failed_window_is_padded_and_reported() {
    let upstream = FlakyUpstream::new(0).with_dead_window(d(2012, 6, 1));
    let (dl, _) = downloader(upstream, 2);
    let query = TimeseriesQuery::between("0005.HK", d(2012, 6, 1), d(2024, 12, 31));
    let retrieval = dl.stock_timeseries(&query, None).unwrap();

    // one good window is enough for a complete result
    assert!(retrieval.is_complete());
    let failed: Vec<_> = retrieval.failed_windows().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 2);
    assert!(failed[0].error.as_deref().unwrap().contains("429"));

    // padding covers every calendar day of the dead window
    let table = retrieval.result.value();
    let dates = dates_of(table).unwrap();
    assert_eq!(dates[0], d(2012, 6, 1));
    assert!(dates.contains(&d(2012, 6, 2)));
    let close = table.column("0005.HK").unwrap().f64().unwrap();
    assert!(close.get(0).unwrap().is_nan());
}

#[test]
fn all_windows_failing_yields_failed_with_joined_errors() {
    let upstream = FlakyUpstream::new(0)
        .with_dead_window(d(2012, 6, 1))
        .with_dead_window(d(2015, 1, 1));
    let (dl, _) = downloader(upstream, 1);
    let query = TimeseriesQuery::between("0005.HK", d(2012, 6, 1), d(2024, 12, 31));
    let retrieval = dl.stock_timeseries(&query, None).unwrap();

    match &retrieval.result {
        Retrieval::Failed { placeholder, error } => {
            // both windows failed with the same message, reported once
            assert_eq!(error.matches("Max retries exceeded").count(), 1);
            assert_eq!(dates_of(placeholder).unwrap().len(), 4597);
        }
        Retrieval::Complete(_) => panic!("expected a failed retrieval"),
    }
}

#[test]
fn series_is_joined_onto_accumulator() {
    let (dl, _) = downloader(FlakyUpstream::new(0), 3);

    let index = dl
        .index_timeseries(&TimeseriesQuery::years("HSI", d(2024, 12, 31), 1))
        .unwrap();
    assert!(index.is_complete());
    let index_table = index.result.into_value();
    assert!(index_table.column(".HSI").is_ok());

    let stock = dl
        .stock_timeseries(
            &TimeseriesQuery::years("0005.HK", d(2024, 12, 31), 1),
            Some(index_table.clone()),
        )
        .unwrap();
    let joined = stock.result.value();
    assert_eq!(joined.width(), 3);
    assert_eq!(joined.height(), index_table.height());
    assert_eq!(
        dl.client().seen.lock().unwrap()[0],
        ".HSI 2024-01-01".to_string()
    );
}

#[test]
fn failed_window_on_accumulator_uses_its_dates() {
    let accumulator = DataFrame::new(vec![
        date_column(DATE_COLUMN, &[d(2024, 1, 2), d(2024, 1, 3), d(2025, 1, 2)]).unwrap(),
        Column::new(".HSI".into(), &[1.0, 2.0, 3.0]),
    ])
    .unwrap();
    let upstream = FlakyUpstream::new(0).with_dead_window(d(2024, 1, 1));
    let (dl, _) = downloader(upstream, 1);

    let retrieval = dl
        .stock_timeseries(
            &TimeseriesQuery::between("0005.HK", d(2024, 1, 1), d(2024, 12, 31)),
            Some(accumulator),
        )
        .unwrap();

    assert!(!retrieval.is_complete());
    let table = retrieval.result.value();
    assert_eq!(
        dates_of(table).unwrap(),
        vec![d(2024, 1, 2), d(2024, 1, 3), d(2025, 1, 2)]
    );
    let stock = table.column("0005.HK").unwrap().f64().unwrap();
    assert!(stock.get(0).unwrap().is_nan());
    assert_eq!(stock.get(2), None);
}

#[test]
fn constituents_default_to_target_date_parameters() {
    let (dl, _) = downloader(FlakyUpstream::new(2), 5);
    let rics: Vec<String> = (0..30).map(|i| format!("{i:04}.HK")).collect();
    let report = dl
        .constituents_data(&DataQuery::new(rics, vec!["TR.ISIN".into()], d(2024, 12, 31)))
        .unwrap();

    assert_eq!(report.attempts, 1);
    assert_eq!(report.retrieval.value().height(), 30);
}

/// Upstream whose table layout drifts between calls: the weight column of
/// a chain is numeric on some dates and text on others, and time series
/// windows before 2015 carry no volume.
struct DriftingUpstream {
    calls: AtomicU32,
}

impl DriftingUpstream {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

impl MarketDataClient for DriftingUpstream {
    fn name(&self) -> &str {
        "drifting"
    }

    fn fetch_chain(&self, _: &ChainRequest) -> Result<Payload, UpstreamError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let weight = if n % 2 == 0 {
            Column::new("Weight".into(), &[f64::NAN, f64::NAN])
        } else {
            Column::new("Weight".into(), &["9.5", "n/a"])
        };
        let table = DataFrame::new(vec![
            Column::new("Instrument".into(), &["0005.HK", "0700.HK"]),
            weight,
        ])
        .map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(Payload::Table(table))
    }

    fn fetch_timeseries(&self, request: &TimeseriesRequest) -> Result<Payload, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let dates: Vec<NaiveDate> = request
            .start
            .iter_days()
            .take_while(|day| *day <= request.end)
            .filter(|day| day.weekday().number_from_monday() <= 5)
            .collect();
        let mut columns = vec![
            date_column(DATE_COLUMN, &dates).unwrap(),
            Column::new("CLOSE".into(), vec![1.0; dates.len()]),
        ];
        if request.start.year() >= 2015 {
            columns.push(Column::new("VOLUME".into(), vec![100.0; dates.len()]));
        }
        let table = DataFrame::new(columns).map_err(|e| UpstreamError::Malformed(e.to_string()))?;
        Ok(Payload::Table(table))
    }

    fn fetch_data(&self, _: &DataRequest) -> Result<Payload, UpstreamError> {
        Err(UpstreamError::Empty("no reference data".into()))
    }
}

#[test]
fn chain_columns_with_drifting_types_still_stack() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let dl = Downloader::new(DriftingUpstream::new(), policy()).with_sleeper(sleeper);
    let dates = vec![d(2024, 3, 31), d(2024, 6, 30), d(2024, 9, 30)];

    let series = dl
        .chain_series(ChainKind::Index, "HSI", &dates, &["TR.IndexWeight".to_string()])
        .unwrap();
    assert!(series.errors().is_empty());

    let frame = series.to_frame().unwrap();
    assert_eq!(frame.height(), 6);
    let weight = frame.column("Weight").unwrap().str().unwrap();
    // blank on the first date, text on the second
    assert_eq!(weight.get(0), None);
    assert_eq!(weight.get(2), Some("9.5"));
    assert_eq!(weight.get(3), Some("n/a"));
}

#[test]
fn window_missing_a_field_keeps_one_column_per_field() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let dl = Downloader::new(DriftingUpstream::new(), policy()).with_sleeper(sleeper);
    let query = TimeseriesQuery::between("0005.HK", d(2012, 6, 1), d(2024, 12, 31))
        .with_fields(vec!["CLOSE".into(), "VOLUME".into()]);

    let retrieval = dl.stock_timeseries(&query, None).unwrap();

    assert!(retrieval.is_complete());
    assert_eq!(retrieval.failed_windows().count(), 0);
    let table = retrieval.result.value();
    let names: Vec<String> = table
        .get_column_names()
        .iter()
        .map(|name| name.to_string())
        .collect();
    assert_eq!(names, vec!["date", "0005.HK|CLOSE", "0005.HK|VOLUME"]);

    let dates = dates_of(table).unwrap();
    let first_new = dates.iter().position(|day| *day >= d(2015, 1, 1)).unwrap();
    let close = table.column("0005.HK|CLOSE").unwrap().f64().unwrap();
    let volume = table.column("0005.HK|VOLUME").unwrap().f64().unwrap();
    assert_eq!(close.get(0), Some(1.0));
    assert!(volume.get(0).unwrap().is_nan());
    assert_eq!(volume.get(first_new), Some(100.0));
}
