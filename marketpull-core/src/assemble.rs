//! Window assembly: stitch per-window tables into one series.
//!
//! Windows arrive oldest first. Stacking keeps that order so that, when two
//! adjacent windows both return their shared boundary date, the earlier
//! window's row is the one that survives de-duplication.

use crate::error::EngineError;
use crate::frame::{value_columns, DATE_COLUMN};
use polars::prelude::*;

/// Stack windows in order, keep the first row per date, sort ascending.
///
/// Windows missing a column another window has get it filled with NaN.
pub fn merge_windows(frames: Vec<DataFrame>) -> Result<DataFrame, EngineError> {
    if frames.is_empty() {
        return Err(EngineError::InvalidParameter(
            "no windows to merge".into(),
        ));
    }
    let stacked = stack_aligned(frames)?;
    canonicalize(stacked.lazy())
        .collect()
        .map_err(EngineError::from)
}

/// Vertically stack tables whose column sets or column types differ.
///
/// Column order follows first appearance. A missing float column is filled
/// with NaN, any other missing column with nulls of its type. When frames
/// disagree on a column's type, frames where that column is entirely blank
/// do not vote; if the rest still disagree the column becomes text.
pub fn stack_aligned(frames: Vec<DataFrame>) -> Result<DataFrame, EngineError> {
    let schema = common_schema(&frames);

    let mut stacked: Option<DataFrame> = None;
    for frame in frames {
        let aligned = align_columns(frame, &schema)?;
        match stacked.as_mut() {
            None => stacked = Some(aligned),
            Some(acc) => {
                acc.vstack_mut(&aligned)?;
            }
        }
    }
    Ok(stacked.unwrap_or_default())
}

/// Sort by date and drop repeated dates, first occurrence wins.
///
/// De-duplication runs before the sort and is stable, so "first" means first
/// in stacking order.
pub fn canonicalize(df: LazyFrame) -> LazyFrame {
    df.unique_stable(Some(vec![DATE_COLUMN.into()]), UniqueKeepStrategy::First)
        .sort(
            [DATE_COLUMN],
            SortMultipleOptions::default().with_maintain_order(true),
        )
}

/// Outer-join `series` onto `accumulator` by date.
///
/// Every date from both sides is kept. Columns of `series` that already exist
/// in the accumulator replace the old ones.
pub fn join_onto(accumulator: DataFrame, series: DataFrame) -> Result<DataFrame, EngineError> {
    let incoming = value_columns(&series);
    let stale: Vec<String> = value_columns(&accumulator)
        .into_iter()
        .filter(|name| incoming.contains(name))
        .collect();

    let mut base = accumulator;
    for name in &stale {
        tracing::debug!("Replacing column {name} in accumulated table.");
        base = base.drop(name)?;
    }

    base.lazy()
        .join(
            series.lazy(),
            [col(DATE_COLUMN)],
            [col(DATE_COLUMN)],
            JoinArgs::new(JoinType::Full).with_coalesce(JoinCoalesce::CoalesceColumns),
        )
        .sort(
            [DATE_COLUMN],
            SortMultipleOptions::default().with_maintain_order(true),
        )
        .collect()
        .map_err(EngineError::from)
}

/// Distinct messages in order of first occurrence, joined with `"; "`.
pub fn join_errors<'a>(errors: impl IntoIterator<Item = &'a str>) -> String {
    let mut distinct: Vec<&str> = Vec::new();
    for error in errors {
        if !distinct.contains(&error) {
            distinct.push(error);
        }
    }
    distinct.join("; ")
}

/// One type per column name across all frames.
fn common_schema(frames: &[DataFrame]) -> Vec<(String, DataType)> {
    // (name, first type seen, types of non-blank occurrences)
    let mut seen: Vec<(String, DataType, Vec<DataType>)> = Vec::new();
    for frame in frames {
        for column in frame.get_columns() {
            let name = column.name().to_string();
            let at = match seen.iter().position(|(known, _, _)| *known == name) {
                Some(at) => at,
                None => {
                    seen.push((name, column.dtype().clone(), Vec::new()));
                    seen.len() - 1
                }
            };
            let filled = &mut seen[at].2;
            if !is_blank(column) && !filled.contains(column.dtype()) {
                filled.push(column.dtype().clone());
            }
        }
    }

    seen.into_iter()
        .map(|(name, first, filled)| {
            let dtype = match filled.as_slice() {
                [] => first,
                [only] => only.clone(),
                _ => DataType::String,
            };
            (name, dtype)
        })
        .collect()
}

/// Nothing but nulls, or nothing but NaN for a float column.
fn is_blank(column: &Column) -> bool {
    if column.null_count() == column.len() {
        return true;
    }
    match column.f64() {
        Ok(values) => values.into_iter().all(|v| v.map_or(true, f64::is_nan)),
        Err(_) => false,
    }
}

fn filler(name: &str, dtype: &DataType, height: usize) -> Column {
    match dtype {
        DataType::Float64 => Column::new(name.into(), vec![f64::NAN; height]),
        other => Column::full_null(name.into(), height, other),
    }
}

fn align_columns(
    mut frame: DataFrame,
    schema: &[(String, DataType)],
) -> Result<DataFrame, EngineError> {
    let height = frame.height();
    for (name, dtype) in schema {
        let replacement = match frame.column(name) {
            Err(_) => filler(name, dtype, height),
            Ok(column) if column.dtype() == dtype => continue,
            Ok(column) if is_blank(column) => filler(name, dtype, height),
            Ok(column) => column.cast(dtype)?,
        };
        frame.with_column(replacement)?;
    }
    Ok(frame.select(schema.iter().map(|(name, _)| name.as_str()))?)
}
