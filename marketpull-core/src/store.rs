//! Flat-file dataset store.
//!
//! Layout under the store root:
//! - `{name}/index_chain/{name}_chain_{date}.csv`
//! - `{name}/etp_chain/{name}_chain_{date}.csv`
//! - `{name}/time_series_data/{name}_time_series_{start}_{end}.csv`
//! - `{name}/additional_stock_data/{name}_additional_stock_data_{date}.csv`
//!
//! Writes are atomic (write to `.tmp`, rename into place) and every CSV gets
//! a `.meta.json` sidecar with its shape and a blake3 hash of the bytes.

use crate::downloader::ChainKind;
use crate::error::EngineError;
use chrono::NaiveDate;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const TIMESERIES_FOLDER: &str = "time_series_data";
pub const REFERENCE_DATA_FOLDER: &str = "additional_stock_data";

/// Sidecar describing one written CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub file: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub data_hash: String,
    pub written_at: chrono::NaiveDateTime,
}

pub struct DatasetWriter {
    root: PathBuf,
}

impl DatasetWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chain_dir(&self, name: &str, kind: ChainKind) -> PathBuf {
        self.root.join(name).join(kind.folder())
    }

    pub fn chain_path(&self, name: &str, kind: ChainKind, date: NaiveDate) -> PathBuf {
        self.chain_dir(name, kind)
            .join(format!("{name}_chain_{date}.csv"))
    }

    pub fn timeseries_path(&self, name: &str, start: NaiveDate, end: NaiveDate) -> PathBuf {
        self.root
            .join(name)
            .join(TIMESERIES_FOLDER)
            .join(format!("{name}_time_series_{start}_{end}.csv"))
    }

    pub fn reference_data_path(&self, name: &str, date: NaiveDate) -> PathBuf {
        self.root
            .join(name)
            .join(REFERENCE_DATA_FOLDER)
            .join(format!("{name}_additional_stock_data_{date}.csv"))
    }

    /// Write `df` as CSV at `path`, creating parent directories.
    pub fn write(&self, path: &Path, df: &mut DataFrame) -> Result<DatasetMeta, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EngineError::Storage(format!("create {}: {e}", parent.display())))?;
        }

        let mut bytes = Vec::new();
        CsvWriter::new(&mut bytes)
            .include_header(true)
            .finish(df)?;

        let tmp_path = path.with_extension("csv.tmp");
        fs::write(&tmp_path, &bytes)
            .map_err(|e| EngineError::Storage(format!("write {}: {e}", tmp_path.display())))?;
        fs::rename(&tmp_path, path).map_err(|e| {
            let _ = fs::remove_file(&tmp_path);
            EngineError::Storage(format!("atomic rename failed: {e}"))
        })?;

        let meta = DatasetMeta {
            file: path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            rows: df.height(),
            columns: df
                .get_column_names()
                .into_iter()
                .map(|c| c.to_string())
                .collect(),
            data_hash: blake3::hash(&bytes).to_hex().to_string(),
            written_at: chrono::Local::now().naive_local(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| EngineError::Storage(format!("meta serialization: {e}")))?;
        fs::write(meta_path(path), meta_json)
            .map_err(|e| EngineError::Storage(format!("meta write: {e}")))?;

        tracing::info!("Saved {} rows to {}.", meta.rows, path.display());
        Ok(meta)
    }

    /// Sidecar of a previously written file, if readable.
    pub fn read_meta(&self, path: &Path) -> Option<DatasetMeta> {
        let content = fs::read_to_string(meta_path(path)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// True when the file exists and still matches its sidecar hash.
    pub fn verify(&self, path: &Path) -> bool {
        let Some(meta) = self.read_meta(path) else {
            return false;
        };
        match fs::read(path) {
            Ok(bytes) => blake3::hash(&bytes).to_hex().to_string() == meta.data_hash,
            Err(_) => false,
        }
    }

    /// Read a written time series back, parsing the `date` column.
    pub fn read_table(&self, path: &Path) -> Result<DataFrame, EngineError> {
        if !path.exists() {
            return Err(EngineError::Storage(format!(
                "{} does not exist",
                path.display()
            )));
        }
        let df = CsvReadOptions::default()
            .with_has_header(true)
            .with_parse_options(CsvParseOptions::default().with_try_parse_dates(true))
            .try_into_reader_with_file_path(Some(path.to_path_buf()))?
            .finish()?;
        Ok(df)
    }
}

fn meta_path(path: &Path) -> PathBuf {
    path.with_extension("meta.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{date_column, dates_of, DATE_COLUMN};
    use tempfile::TempDir;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn series() -> DataFrame {
        DataFrame::new(vec![
            date_column(DATE_COLUMN, &[d(2024, 1, 2), d(2024, 1, 3)]).unwrap(),
            Column::new("SPY".into(), &[470.5, 468.8]),
        ])
        .unwrap()
    }

    #[test]
    fn paths_follow_layout() {
        let writer = DatasetWriter::new("download");
        assert_eq!(
            writer.chain_path("HSI", ChainKind::Index, d(2024, 12, 31)),
            PathBuf::from("download/HSI/index_chain/HSI_chain_2024-12-31.csv")
        );
        assert_eq!(
            writer.chain_path("SPY", ChainKind::Etp, d(2024, 12, 31)),
            PathBuf::from("download/SPY/etp_chain/SPY_chain_2024-12-31.csv")
        );
        assert_eq!(
            writer.timeseries_path("HSI", d(2015, 1, 1), d(2024, 12, 31)),
            PathBuf::from("download/HSI/time_series_data/HSI_time_series_2015-01-01_2024-12-31.csv")
        );
        assert_eq!(
            writer.reference_data_path("HSI", d(2024, 12, 31)),
            PathBuf::from("download/HSI/additional_stock_data/HSI_additional_stock_data_2024-12-31.csv")
        );
    }

    #[test]
    fn write_is_atomic_and_leaves_sidecar() {
        let dir = TempDir::new().unwrap();
        let writer = DatasetWriter::new(dir.path());
        let path = writer.timeseries_path("SPY", d(2024, 1, 1), d(2024, 1, 31));

        let meta = writer.write(&path, &mut series()).unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("csv.tmp").exists());
        assert_eq!(meta.rows, 2);
        assert_eq!(meta.columns, vec!["date", "SPY"]);
        assert_eq!(writer.read_meta(&path), Some(meta));
        assert!(writer.verify(&path));

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("date,SPY"));
        assert!(text.contains("2024-01-02"));
    }

    #[test]
    fn tampered_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        let writer = DatasetWriter::new(dir.path());
        let path = dir.path().join("x.csv");
        writer.write(&path, &mut series()).unwrap();

        fs::write(&path, "date,SPY\n2024-01-02,0.0\n").unwrap();
        assert!(!writer.verify(&path));
    }

    #[test]
    fn written_series_reads_back_with_dates() {
        let dir = TempDir::new().unwrap();
        let writer = DatasetWriter::new(dir.path());
        let path = dir.path().join("spy.csv");
        writer.write(&path, &mut series()).unwrap();

        let back = writer.read_table(&path).unwrap();
        assert_eq!(dates_of(&back).unwrap(), vec![d(2024, 1, 2), d(2024, 1, 3)]);
    }

    #[test]
    fn reading_missing_file_is_storage_error() {
        let writer = DatasetWriter::new("nowhere");
        assert!(matches!(
            writer.read_table(Path::new("nowhere/none.csv")),
            Err(EngineError::Storage(_))
        ));
    }
}
