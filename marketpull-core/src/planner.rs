//! Date range planning.
//!
//! Turns `(end_date, horizon, frequency)` into the query boundaries the
//! downloader iterates over: period-end target dates for chain snapshots, or
//! decade-aligned `[start, end]` windows for long time series requests.
//! Pure functions, no I/O.

use crate::error::EngineError;
use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Smallest accepted horizon for target date generation, in years.
pub const MIN_YEARS: u32 = 1;
/// Largest accepted horizon for target date generation, in years.
pub const MAX_YEARS: u32 = 99;

/// Spacing of generated target dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Months,
    Quarters,
    Years,
}

impl Frequency {
    pub fn periods_per_year(self) -> u32 {
        match self {
            Frequency::Months => 12,
            Frequency::Quarters => 4,
            Frequency::Years => 1,
        }
    }

    fn step_months(self) -> i64 {
        12 / self.periods_per_year() as i64
    }
}

impl FromStr for Frequency {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "months" | "m" => Ok(Frequency::Months),
            "quarters" | "q" => Ok(Frequency::Quarters),
            "years" | "y" => Ok(Frequency::Years),
            other => Err(EngineError::InvalidParameter(format!(
                "unknown frequency '{other}': choose from months (m), quarters (q), years (y)"
            ))),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Frequency::Months => "months",
            Frequency::Quarters => "quarters",
            Frequency::Years => "years",
        };
        f.write_str(name)
    }
}

/// Period-end dates spaced by `frequency`, covering `num_years` years back
/// from `end_date`.
///
/// The frequency accepts full names or single-letter aliases (`m`, `q`, `y`).
/// See [`target_dates`] for the anchoring rules.
pub fn generate_target_dates(
    end_date: NaiveDate,
    num_years: u32,
    frequency: &str,
    reverse: bool,
) -> Result<Vec<NaiveDate>, EngineError> {
    let frequency: Frequency = frequency.parse()?;
    target_dates(end_date, num_years, frequency, reverse)
}

/// Typed form of [`generate_target_dates`].
///
/// Produces exactly `num_years * periods_per_year` month, quarter or year
/// ends. The latest one is `end_date` itself when it falls on a period end,
/// otherwise the closest period end before it. `reverse` yields the most
/// recent date first.
pub fn target_dates(
    end_date: NaiveDate,
    num_years: u32,
    frequency: Frequency,
    reverse: bool,
) -> Result<Vec<NaiveDate>, EngineError> {
    if !(MIN_YEARS..=MAX_YEARS).contains(&num_years) {
        return Err(EngineError::InvalidParameter(format!(
            "num_years must be in [{MIN_YEARS}, {MAX_YEARS}], got {num_years}"
        )));
    }

    let step = frequency.step_months();
    let periods = (num_years * frequency.periods_per_year()) as i64;

    // Latest month whose last day is not after end_date.
    let mut anchor = month_index(end_date);
    if month_end(anchor) != Some(end_date) {
        anchor -= 1;
    }
    while (anchor.rem_euclid(12) + 1) % step != 0 {
        anchor -= 1;
    }

    let mut dates = (0..periods)
        .rev()
        .map(|k| {
            month_end(anchor - k * step).ok_or_else(|| {
                EngineError::InvalidParameter(format!(
                    "target dates before {end_date} leave the supported calendar range"
                ))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if reverse {
        dates.reverse();
    }
    Ok(dates)
}

/// Aligned decade windows, oldest first.
///
/// `starts[i]..=ends[i]` is one window. Consecutive windows touch without
/// overlapping: `ends[i]` is the day before `starts[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecadeWindows {
    pub starts: Vec<NaiveDate>,
    pub ends: Vec<NaiveDate>,
}

impl DecadeWindows {
    pub fn windows(&self) -> impl Iterator<Item = (NaiveDate, NaiveDate)> + '_ {
        self.starts.iter().copied().zip(self.ends.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Start of the oldest window.
    pub fn first_start(&self) -> Option<NaiveDate> {
        self.starts.first().copied()
    }

    /// End of the newest window (always the requested end date).
    pub fn last_end(&self) -> Option<NaiveDate> {
        self.ends.last().copied()
    }
}

/// Split `[start, end_date]` into decade windows.
///
/// Exactly one of `num_years` and `start_date` establishes the range origin.
/// With `num_years` the range starts the day after `end_date` minus that many
/// years. Windows follow calendar decades that end in the year of
/// `end_date` (`[Y-9-01-01, Y-12-31]`) and are clipped to the range.
pub fn generate_decade_dates(
    end_date: NaiveDate,
    num_years: Option<u32>,
    start_date: Option<NaiveDate>,
) -> Result<DecadeWindows, EngineError> {
    let start = match (num_years, start_date) {
        (Some(_), Some(_)) => {
            return Err(EngineError::InvalidParameter(
                "provide either 'num_years' or 'start_date', not both".into(),
            ))
        }
        (None, None) => {
            return Err(EngineError::InvalidParameter(
                "either 'num_years' or 'start_date' must be provided".into(),
            ))
        }
        (None, Some(start)) => start,
        (Some(years), None) => end_date
            .checked_sub_months(Months::new(years.saturating_mul(12)))
            .and_then(|d| d.succ_opt())
            .ok_or_else(|| {
                EngineError::InvalidParameter(format!(
                    "{years} years before {end_date} is outside the supported calendar range"
                ))
            })?,
    };

    if start > end_date {
        return Err(EngineError::InvalidParameter(format!(
            "'start_date' {start} cannot be later than 'end_date' {end_date}"
        )));
    }

    let mut starts = Vec::new();
    let mut ends = Vec::new();
    let mut year = end_date.year();

    while year >= start.year() {
        let decade_start = NaiveDate::from_ymd_opt(year - 9, 1, 1).unwrap_or(start);
        let decade_end = NaiveDate::from_ymd_opt(year, 12, 31).unwrap_or(end_date);

        starts.push(decade_start.max(start));
        ends.push(decade_end.min(end_date));
        year -= 10;
    }

    starts.reverse();
    ends.reverse();
    Ok(DecadeWindows { starts, ends })
}

fn month_index(date: NaiveDate) -> i64 {
    date.year() as i64 * 12 + date.month0() as i64
}

/// Last calendar day of the month with the given index.
fn month_end(index: i64) -> Option<NaiveDate> {
    let year = i32::try_from(index.div_euclid(12)).ok()?;
    let month = index.rem_euclid(12) as u32 + 1;
    let (next_year, next_month) = if month == 12 {
        (year.checked_add(1)?, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?.pred_opt()
}
