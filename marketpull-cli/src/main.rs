//! Marketpull CLI: batch downloads against the market-data API.
//!
//! Commands:
//! - `dates`: print the target dates a batch job would query
//! - `chain`: download index or ETP chains for every target date
//! - `timeseries`: index price series plus every constituent, joined by date
//! - `data`: reference fields for all constituents, chunked, per target date

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use marketpull_core::archive::{split_chunks, ChainArchive, DEFAULT_CHUNK_SIZE};
use marketpull_core::assemble::stack_aligned;
use marketpull_core::downloader::{ChainKind, DataQuery, Downloader, TimeseriesQuery};
use marketpull_core::planner::{target_dates, Frequency};
use marketpull_core::store::DatasetWriter;
use marketpull_core::upstream::{HttpClient, MarketDataClient};
use marketpull_core::FetchConfig;
use polars::prelude::DataFrame;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Constituent series between intermediate saves of the joined table.
const SAVE_EVERY: usize = 10;

#[derive(Parser)]
#[command(
    name = "marketpull",
    about = "Marketpull CLI: resilient market data downloads"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Application key; overrides the config file.
    #[arg(long, global = true)]
    api_key: Option<String>,

    /// Attempts per request; overrides the config file.
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Root directory for downloaded files.
    #[arg(long, global = true, default_value = "download")]
    out_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Schedule {
    /// Last target date (YYYY-MM-DD).
    #[arg(long)]
    end: NaiveDate,

    /// Years of history.
    #[arg(long, default_value_t = 2)]
    years: u32,

    /// Spacing of target dates: months, quarters or years.
    #[arg(long, default_value = "quarters")]
    frequency: Frequency,
}

impl Schedule {
    fn dates(&self, reverse: bool) -> Result<Vec<NaiveDate>> {
        Ok(target_dates(self.end, self.years, self.frequency, reverse)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the target dates for a schedule.
    Dates {
        #[command(flatten)]
        schedule: Schedule,

        /// Most recent date first.
        #[arg(long, default_value_t = false)]
        reverse: bool,
    },
    /// Download index (or ETP) chains for every target date.
    Chain {
        /// Index or ETP codes (e.g., HSI SPX).
        #[arg(required = true)]
        names: Vec<String>,

        #[command(flatten)]
        schedule: Schedule,

        /// Fields to request per constituent.
        #[arg(long, value_delimiter = ',', default_value = "TR.ISIN")]
        fields: Vec<String>,

        /// Resolve ETP holdings instead of index chains.
        #[arg(long, default_value_t = false)]
        etp: bool,
    },
    /// Download the index series and every archived constituent.
    Timeseries {
        /// Index code whose chain archive lists the constituents.
        name: String,

        /// First date of the series (YYYY-MM-DD).
        #[arg(long)]
        start: NaiveDate,

        /// Last date of the series (YYYY-MM-DD).
        #[arg(long)]
        end: NaiveDate,

        /// Field to request.
        #[arg(long, default_value = "CLOSE")]
        field: String,
    },
    /// Download reference fields for all archived constituents.
    Data {
        /// Index code whose chain archive lists the constituents.
        name: String,

        #[command(flatten)]
        schedule: Schedule,

        /// Fields to request.
        #[arg(long, value_delimiter = ',', required = true)]
        fields: Vec<String>,

        /// Identifiers per request.
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => FetchConfig::from_file(path)?,
        None => FetchConfig::default(),
    };
    if let Some(key) = cli.api_key.clone() {
        config.api_key = Some(key);
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    let writer = DatasetWriter::new(&cli.out_dir);

    match cli.command {
        Commands::Dates { schedule, reverse } => {
            for date in schedule.dates(reverse)? {
                println!("{date}");
            }
            Ok(())
        }
        Commands::Chain {
            names,
            schedule,
            fields,
            etp,
        } => {
            let kind = if etp { ChainKind::Etp } else { ChainKind::Index };
            run_chain(&connect(&config)?, &writer, &names, &schedule, &fields, kind)
        }
        Commands::Timeseries {
            name,
            start,
            end,
            field,
        } => run_timeseries(&connect(&config)?, &writer, &name, start, end, &field),
        Commands::Data {
            name,
            schedule,
            fields,
            chunk_size,
        } => run_data(&connect(&config)?, &writer, &name, &schedule, &fields, chunk_size),
    }
}

fn connect(config: &FetchConfig) -> Result<Downloader<HttpClient>> {
    if config.api_key.is_none() {
        bail!("an API key is required: pass --api-key or set api_key in the config file");
    }
    let client = HttpClient::new(config)?;
    Ok(Downloader::from_config(client, config))
}

fn run_chain(
    downloader: &Downloader<HttpClient>,
    writer: &DatasetWriter,
    names: &[String],
    schedule: &Schedule,
    fields: &[String],
    kind: ChainKind,
) -> Result<()> {
    let dates = schedule.dates(false)?;
    let mut failures = Vec::new();

    for name in names {
        let series = match downloader.chain_series(kind, name, &dates, fields) {
            Ok(series) => series,
            Err(error) => {
                tracing::error!("Skipping chains of {name}: {error}");
                failures.push(format!("{name}: {error}"));
                continue;
            }
        };
        for (date, retrieval) in &series.entries {
            match retrieval.error() {
                Some(error) => failures.push(format!("{name} at {date}: {error}")),
                None => {
                    let mut table = retrieval.value().clone();
                    writer.write(&writer.chain_path(name, kind, *date), &mut table)?;
                }
            }
        }
    }

    report_failures(&failures);
    Ok(())
}

fn run_timeseries(
    downloader: &Downloader<HttpClient>,
    writer: &DatasetWriter,
    name: &str,
    start: NaiveDate,
    end: NaiveDate,
    field: &str,
) -> Result<()> {
    let archive = ChainArchive::new(writer.root().join(name), ChainKind::Index);
    let rics = archive
        .identifiers()
        .with_context(|| format!("no chain archive for {name}; run `marketpull chain` first"))?;
    let path = writer.timeseries_path(name, start, end);

    let index_query = TimeseriesQuery::between(name, start, end).with_fields(vec![field.to_string()]);
    let index = downloader.index_timeseries(&index_query)?;
    if let Some(error) = index.result.error() {
        bail!("index series for {name} failed: {error}");
    }
    let mut table = index.result.into_value();
    tracing::info!("Index series for {name} complete, starting {} constituents.", rics.len());

    let mut failures = Vec::new();
    for (counter, ric) in rics.iter().enumerate() {
        let query = TimeseriesQuery::between(ric, start, end).with_fields(vec![field.to_string()]);
        table = add_constituent(downloader, table, &query, &mut failures);

        let percent_done = (counter + 1) as f64 / rics.len() as f64 * 100.0;
        tracing::info!("[{percent_done:.2}%] Download {ric} completed.");
        if counter % SAVE_EVERY == 0 {
            writer.write(&path, &mut table)?;
        }
    }

    writer.write(&path, &mut table)?;
    report_failures(&failures);
    Ok(())
}

/// Join one constituent's series onto `table`.
///
/// Failed windows are recorded. When the constituent cannot be processed at
/// all, the error is recorded and `table` comes back unchanged.
fn add_constituent<C: MarketDataClient>(
    downloader: &Downloader<C>,
    table: DataFrame,
    query: &TimeseriesQuery,
    failures: &mut Vec<String>,
) -> DataFrame {
    let ric = &query.ric;
    match downloader.stock_timeseries(query, Some(table.clone())) {
        Ok(retrieval) => {
            for window in retrieval.failed_windows() {
                failures.push(format!(
                    "{ric} from {} to {}: {}",
                    window.start,
                    window.end,
                    window.error.as_deref().unwrap_or_default()
                ));
            }
            retrieval.result.into_value()
        }
        Err(error) => {
            tracing::error!("Skipping {ric}: {error}");
            failures.push(format!("{ric}: {error}"));
            table
        }
    }
}

fn run_data(
    downloader: &Downloader<HttpClient>,
    writer: &DatasetWriter,
    name: &str,
    schedule: &Schedule,
    fields: &[String],
    chunk_size: usize,
) -> Result<()> {
    let archive = ChainArchive::new(writer.root().join(name), ChainKind::Index);
    let rics = archive
        .identifiers()
        .with_context(|| format!("no chain archive for {name}; run `marketpull chain` first"))?;
    let chunks = split_chunks(&rics, chunk_size)?;
    let mut failures = Vec::new();

    for date in schedule.dates(false)? {
        match reference_data_at(downloader, name, date, &chunks, fields, &mut failures) {
            Some(mut merged) => {
                writer.write(&writer.reference_data_path(name, date), &mut merged)?;
            }
            None => tracing::warn!("No data collected for {name} at {date}."),
        }
    }

    report_failures(&failures);
    Ok(())
}

/// Reference data of every chunk at `date`, stacked into one table.
///
/// A chunk that fails is recorded and left out; `None` when nothing usable
/// came back.
fn reference_data_at<C: MarketDataClient>(
    downloader: &Downloader<C>,
    name: &str,
    date: NaiveDate,
    chunks: &[Vec<String>],
    fields: &[String],
    failures: &mut Vec<String>,
) -> Option<DataFrame> {
    let mut tables = Vec::with_capacity(chunks.len());
    for (part, chunk) in chunks.iter().enumerate() {
        tracing::info!("Downloading chunk {}/{} for {name} at {date}.", part + 1, chunks.len());
        let query = DataQuery::new(chunk.clone(), fields.to_vec(), date);
        let error = match downloader.constituents_data(&query) {
            Ok(report) => match report.retrieval.into_parts() {
                (table, None) => {
                    tables.push(table);
                    continue;
                }
                (_, Some(error)) => error,
            },
            Err(error) => error.to_string(),
        };
        failures.push(format!("{name} chunk {} at {date}: {error}", part + 1));
    }

    if tables.is_empty() {
        return None;
    }
    match stack_aligned(tables) {
        Ok(merged) => Some(merged),
        Err(error) => {
            tracing::error!("Could not combine chunks for {name} at {date}: {error}");
            failures.push(format!("{name} at {date}: {error}"));
            None
        }
    }
}

fn report_failures(failures: &[String]) {
    if failures.is_empty() {
        return;
    }
    for failure in failures {
        eprintln!("Error: {failure}");
    }
    eprintln!("{} retrievals failed.", failures.len());
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketpull_core::frame::{date_column, DATE_COLUMN};
    use marketpull_core::retry::{BackoffPolicy, RecordingSleeper};
    use marketpull_core::upstream::{
        ChainRequest, DataRequest, Payload, TimeseriesRequest, UpstreamError,
    };
    use polars::prelude::Column;
    use std::sync::{Arc, Mutex};

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    /// Replays queued payloads in order.
    struct Replay {
        payloads: Mutex<Vec<Payload>>,
    }

    impl Replay {
        fn new(mut payloads: Vec<Payload>) -> Self {
            payloads.reverse();
            Self {
                payloads: Mutex::new(payloads),
            }
        }

        fn next(&self) -> Result<Payload, UpstreamError> {
            self.payloads
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| UpstreamError::Empty("replay exhausted".into()))
        }
    }

    impl MarketDataClient for Replay {
        fn name(&self) -> &str {
            "replay"
        }

        fn fetch_chain(&self, _: &ChainRequest) -> Result<Payload, UpstreamError> {
            self.next()
        }

        fn fetch_timeseries(&self, _: &TimeseriesRequest) -> Result<Payload, UpstreamError> {
            self.next()
        }

        fn fetch_data(&self, _: &DataRequest) -> Result<Payload, UpstreamError> {
            self.next()
        }
    }

    fn downloader(payloads: Vec<Payload>) -> Downloader<Replay> {
        Downloader::new(Replay::new(payloads), BackoffPolicy::immediate())
            .with_max_retries(1)
            .with_sleeper(Arc::new(RecordingSleeper::new()))
    }

    fn not_a_table() -> Payload {
        Payload::Value(serde_json::json!({"status": "queued"}))
    }

    fn isin_chunk(instrument: &str, isin: Column) -> Payload {
        Payload::Table(
            DataFrame::new(vec![Column::new("Instrument".into(), &[instrument]), isin]).unwrap(),
        )
    }

    #[test]
    fn bad_constituent_keeps_the_accumulated_table() {
        let table = DataFrame::new(vec![
            date_column(DATE_COLUMN, &[d(2024, 1, 2), d(2024, 1, 3)]).unwrap(),
            Column::new(".HSI".into(), &[1.0, 2.0]),
            Column::new("0005.HK".into(), &[50.0, 51.0]),
        ])
        .unwrap();
        let dl = downloader(vec![not_a_table()]);
        let query = TimeseriesQuery::between("0700.HK", d(2024, 1, 1), d(2024, 12, 31));
        let mut failures = Vec::new();

        let kept = add_constituent(&dl, table.clone(), &query, &mut failures);

        assert!(kept.equals_missing(&table));
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("0700.HK:"));
    }

    #[test]
    fn chunks_with_blank_and_filled_columns_are_combined() {
        let dl = downloader(vec![
            isin_chunk("A.N", Column::new("ISIN".into(), &[f64::NAN])),
            isin_chunk("B.N", Column::new("ISIN".into(), &["US0000000001"])),
        ]);
        let chunks = vec![vec!["A.N".to_string()], vec!["B.N".to_string()]];
        let mut failures = Vec::new();

        let merged = reference_data_at(
            &dl,
            "SPX",
            d(2024, 12, 31),
            &chunks,
            &["TR.ISIN".to_string()],
            &mut failures,
        )
        .unwrap();

        assert!(failures.is_empty());
        assert_eq!(merged.height(), 2);
        let isin = merged.column("ISIN").unwrap().str().unwrap();
        assert_eq!(isin.get(1), Some("US0000000001"));
    }

    #[test]
    fn failing_chunk_is_recorded_and_others_kept() {
        let dl = downloader(vec![
            not_a_table(),
            isin_chunk("B.N", Column::new("ISIN".into(), &["US0000000001"])),
        ]);
        let chunks = vec![vec!["A.N".to_string()], vec!["B.N".to_string()]];
        let mut failures = Vec::new();

        let merged = reference_data_at(
            &dl,
            "SPX",
            d(2024, 12, 31),
            &chunks,
            &["TR.ISIN".to_string()],
            &mut failures,
        )
        .unwrap();

        assert_eq!(merged.height(), 1);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].starts_with("SPX chunk 1 at 2024-12-31"));
    }
}
