//! Small DataFrame helpers shared by the shaper, assembler and store.

use crate::error::EngineError;
use chrono::NaiveDate;
use polars::prelude::*;

/// Name of the date key column in every time series table.
pub const DATE_COLUMN: &str = "date";

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Build a polars `Date` column from calendar dates.
pub fn date_column(name: &str, dates: &[NaiveDate]) -> Result<Column, EngineError> {
    let epoch = epoch();
    let days: Vec<i32> = dates
        .iter()
        .map(|d| (*d - epoch).num_days() as i32)
        .collect();
    Column::new(name.into(), days)
        .cast(&DataType::Date)
        .map_err(|e| EngineError::Frame(format!("date cast: {e}")))
}

/// Read the `date` column back into calendar dates.
///
/// A table without a `date` column, or with nulls in it, is not a time series.
pub fn dates_of(df: &DataFrame) -> Result<Vec<NaiveDate>, EngineError> {
    let column = df.column(DATE_COLUMN).map_err(|_| {
        EngineError::InvalidType(format!("table has no '{DATE_COLUMN}' column"))
    })?;
    let date_ca = column
        .date()
        .map_err(|e| EngineError::InvalidType(format!("date column type: {e}")))?;

    let epoch = epoch();
    (0..df.height())
        .map(|i| {
            date_ca
                .get(i)
                .map(|days| epoch + chrono::Duration::days(days as i64))
                .ok_or_else(|| EngineError::InvalidType(format!("null date at row {i}")))
        })
        .collect()
}

/// Names of all columns except the date key, in table order.
pub fn value_columns(df: &DataFrame) -> Vec<String> {
    df.get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .filter(|name| name != DATE_COLUMN)
        .collect()
}

/// Share of missing cells (null, or NaN for float columns) per column.
pub fn missing_ratios(df: &DataFrame) -> Vec<(String, f64)> {
    let height = df.height();
    df.get_columns()
        .iter()
        .map(|column| {
            let name = column.name().to_string();
            if height == 0 {
                return (name, 1.0);
            }
            let nan_count = column
                .f64()
                .map(|ca| ca.into_iter().filter(|v| v.is_some_and(f64::is_nan)).count())
                .unwrap_or(0);
            let missing = column.null_count() + nan_count;
            (name, missing as f64 / height as f64)
        })
        .collect()
}
