//! Result shaping: NaN placeholders and payload unpacking.
//!
//! Placeholders keep the expected keys and columns so that downstream merges
//! and CSV writers never trip over a missing shape.

use crate::error::EngineError;
use crate::frame::{date_column, DATE_COLUMN};
use crate::upstream::Payload;
use chrono::NaiveDate;
use polars::prelude::*;

/// Leading column of reference data tables.
pub const INSTRUMENT_COLUMN: &str = "Instrument";

/// One-row, one-column table named after `ric`, holding NaN.
pub fn empty_chain(ric: &str) -> Result<DataFrame, EngineError> {
    if ric.is_empty() {
        return Err(EngineError::InvalidParameter(
            "RIC cannot be an empty string".into(),
        ));
    }
    Ok(DataFrame::new(vec![Column::new(ric.into(), [f64::NAN])])?)
}

/// One all-NaN row with an `Instrument` column followed by `fields`.
///
/// Repeated field names are kept once, in first-seen order.
pub fn empty_data(rics: &[String], fields: &[String]) -> Result<DataFrame, EngineError> {
    if rics.is_empty() {
        return Err(EngineError::InvalidParameter("RIC list cannot be empty".into()));
    }
    if fields.is_empty() {
        return Err(EngineError::InvalidParameter("field list cannot be empty".into()));
    }

    let mut names: Vec<&str> = vec![INSTRUMENT_COLUMN];
    for field in fields {
        if !names.contains(&field.as_str()) {
            names.push(field.as_str());
        }
    }

    let columns = names
        .into_iter()
        .map(|name| Column::new(name.into(), [f64::NAN]))
        .collect();
    Ok(DataFrame::new(columns)?)
}

/// NaN series for `columns` on the given dates.
pub fn empty_on_dates(columns: &[String], dates: &[NaiveDate]) -> Result<DataFrame, EngineError> {
    if columns.is_empty() {
        return Err(EngineError::InvalidParameter(
            "placeholder needs at least one value column".into(),
        ));
    }
    let mut out = vec![date_column(DATE_COLUMN, dates)?];
    for name in columns {
        out.push(Column::new(name.as_str().into(), vec![f64::NAN; dates.len()]));
    }
    Ok(DataFrame::new(out)?)
}

/// NaN series for `columns` on every calendar day of `[start, end]`.
pub fn empty_window(
    columns: &[String],
    start: NaiveDate,
    end: NaiveDate,
) -> Result<DataFrame, EngineError> {
    if start > end {
        return Err(EngineError::InvalidParameter(format!(
            "window start {start} is after end {end}"
        )));
    }
    let dates: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= end).collect();
    empty_on_dates(columns, &dates)
}

/// Reduce an upstream payload to its table.
///
/// Accepts a bare table or a tuple whose first element is the table.
pub fn unpack(payload: Payload) -> Result<DataFrame, EngineError> {
    match payload {
        Payload::Table(table) => Ok(table),
        Payload::Tuple(items) => match items.into_iter().next() {
            None => Err(EngineError::InvalidParameter(
                "cannot unpack an empty tuple".into(),
            )),
            Some(Payload::Table(table)) => Ok(table),
            Some(other) => Err(EngineError::InvalidType(format!(
                "expected a table as first tuple element, got {}",
                describe(&other)
            ))),
        },
        other => Err(EngineError::InvalidType(format!(
            "expected a table or (table, metadata), got {}",
            describe(&other)
        ))),
    }
}

fn describe(payload: &Payload) -> &'static str {
    match payload {
        Payload::Table(_) => "table",
        Payload::Tuple(_) => "tuple",
        Payload::Value(serde_json::Value::Number(_)) => "number",
        Payload::Value(serde_json::Value::String(_)) => "string",
        Payload::Value(_) => "value",
    }
}
