//! Reader for chain files saved by earlier runs.
//!
//! A chain archive is the `index_chain/` or `etp_chain/` folder of one index
//! under the store root. The union of identifiers across all saved dates is
//! the instrument universe for time series and reference data jobs.

use crate::downloader::ChainKind;
use crate::error::EngineError;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Identifiers per request when batching reference data.
pub const DEFAULT_CHUNK_SIZE: usize = 2000;

/// Column holding the identifier in saved chains of `kind`.
pub fn identifier_column(kind: ChainKind) -> &'static str {
    match kind {
        ChainKind::Index => "Instrument",
        ChainKind::Etp => "Constituent RIC",
    }
}

pub struct ChainArchive {
    index_dir: PathBuf,
    kind: ChainKind,
}

impl ChainArchive {
    /// Archive for the index stored at `index_dir` (e.g. `download/HSI`).
    pub fn new(index_dir: impl Into<PathBuf>, kind: ChainKind) -> Self {
        Self {
            index_dir: index_dir.into(),
            kind,
        }
    }

    pub fn chain_dir(&self) -> PathBuf {
        self.index_dir.join(self.kind.folder())
    }

    /// Saved chain CSVs, sorted by path.
    pub fn csv_files(&self) -> Result<Vec<PathBuf>, EngineError> {
        let dir = self.chain_dir();
        let entries = fs::read_dir(&dir)
            .map_err(|e| EngineError::Storage(format!("read dir {}: {e}", dir.display())))?;

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| EngineError::Storage(format!("dir entry: {e}")))?;
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("csv") {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(EngineError::Storage(format!(
                "no CSV files found in {}",
                dir.display()
            )));
        }
        files.sort();
        Ok(files)
    }

    /// Sorted distinct identifiers across `files`.
    ///
    /// Files that cannot be read, or lack the identifier column, are logged
    /// and skipped.
    pub fn unique_identifiers(&self, files: &[PathBuf]) -> Vec<String> {
        let column = identifier_column(self.kind);
        let mut unique = BTreeSet::new();
        let mut counts = Vec::new();

        for file in files {
            match read_column(file, column) {
                Ok(values) => {
                    tracing::info!("Processed file: {} | rows: {}", file.display(), values.len());
                    counts.push(values.len());
                    unique.extend(values);
                }
                Err(e) => tracing::error!("Error reading file {}: {e}", file.display()),
            }
        }

        if let (Some(min), Some(max)) = (counts.iter().min(), counts.iter().max()) {
            tracing::info!(
                "Min RIC count: {min} | Max RIC count: {max} | Total unique RICs: {}.",
                unique.len()
            );
        } else {
            tracing::warn!("No valid RICs found in {} files.", files.len());
        }
        unique.into_iter().collect()
    }

    /// `csv_files` followed by `unique_identifiers`.
    pub fn identifiers(&self) -> Result<Vec<String>, EngineError> {
        let files = self.csv_files()?;
        Ok(self.unique_identifiers(&files))
    }
}

/// Index folder names directly under `root`, sorted.
pub fn index_names(root: &Path, include_hidden: bool) -> Result<Vec<String>, EngineError> {
    let entries = fs::read_dir(root)
        .map_err(|e| EngineError::Storage(format!("read dir {}: {e}", root.display())))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| EngineError::Storage(format!("dir entry: {e}")))?;
        if !entry.path().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') != include_hidden {
            continue;
        }
        names.push(name);
    }
    if names.is_empty() {
        tracing::warn!("No index names found in {}.", root.display());
    }
    names.sort();
    Ok(names)
}

/// Consecutive chunks of at most `size` items; the last may be shorter.
pub fn split_chunks<T: Clone>(items: &[T], size: usize) -> Result<Vec<Vec<T>>, EngineError> {
    if size == 0 {
        return Err(EngineError::InvalidParameter("chunk size must be positive".into()));
    }
    Ok(items.chunks(size).map(|chunk| chunk.to_vec()).collect())
}

/// Non-empty values of one named column.
fn read_column(path: &Path, column: &str) -> Result<Vec<String>, EngineError> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| EngineError::Storage(format!("open: {e}")))?;
    let headers = reader
        .headers()
        .map_err(|e| EngineError::Storage(format!("headers: {e}")))?;
    let at = headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| EngineError::Storage(format!("missing column '{column}'")))?;

    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| EngineError::Storage(format!("record: {e}")))?;
        if let Some(value) = record.get(at).map(str::trim).filter(|v| !v.is_empty()) {
            values.push(value.to_string());
        }
    }
    Ok(values)
}
