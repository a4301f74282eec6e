//! Day-series reduction: turning one key's sparse net deltas into a
//! dense daily running count, forward-filled through the run's cutoff.
//!
//! Also home to [`DailyCount`], the flat `facet|metric|date|count` row
//! that crosses the stage boundary on disk.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use chrono::NaiveDate;
use thiserror::Error;

use crate::io::{ReadError, Record, WriteError};
use crate::MetricKey;

/// The running count for one metric key on one calendar day.
///
/// Doubles as the stage-boundary text row `facet|metric|date|count`
/// (ISO date). The metric segment may itself contain the separator; the
/// first and last two segments are unambiguous, so rows still parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailyCount {
    pub facet: String,
    pub metric: String,
    pub date: NaiveDate,
    pub count: i64,
}

impl DailyCount {
    pub fn new(
        facet: impl Into<String>,
        metric: impl Into<String>,
        date: NaiveDate,
        count: i64,
    ) -> Self {
        Self {
            facet: facet.into(),
            metric: metric.into(),
            date,
            count,
        }
    }
}

impl fmt::Display for DailyCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.facet, self.metric, self.date, self.count
        )
    }
}

impl FromStr for DailyCount {
    type Err = ParseRowError;

    fn from_str(row: &str) -> Result<Self, Self::Err> {
        let (facet, rest) = row
            .split_once('|')
            .ok_or_else(|| ParseRowError::MissingFields(row.to_string()))?;
        let (rest, count) = rest
            .rsplit_once('|')
            .ok_or_else(|| ParseRowError::MissingFields(row.to_string()))?;
        let (metric, date) = rest
            .rsplit_once('|')
            .ok_or_else(|| ParseRowError::MissingFields(row.to_string()))?;

        Ok(Self {
            facet: facet.to_string(),
            metric: metric.to_string(),
            date: date.parse()?,
            count: count.parse()?,
        })
    }
}

impl Record for DailyCount {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WriteError> {
        write!(buf, "{self}")?;
        Ok(())
    }

    fn decode(line: &str) -> Result<Self, ReadError> {
        Ok(line.parse()?)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ParseRowError {
    #[error("Row has too few fields: `{0}`")]
    MissingFields(String),

    #[error("Invalid date: {0}")]
    Date(#[from] chrono::ParseError),

    #[error("Invalid count: {0}")]
    Count(#[from] std::num::ParseIntError),
}

/// Reduces one key's net deltas to one row per day the count is positive.
///
/// Duplicate dates are summed first. The walk keeps a running count,
/// re-emits the unchanged count for quiet days between two delta dates,
/// and keeps emitting daily through `now` after the last delta. Days on
/// which the count is zero get no row at all, so output size is bounded
/// by days since the count first became positive. Counts are never
/// clamped; non-negative history is an assumption about the source, not
/// something enforced here.
pub fn day_series(
    key: &MetricKey,
    pairs: impl IntoIterator<Item = (NaiveDate, i64)>,
    now: NaiveDate,
) -> Vec<DailyCount> {
    let mut by_date: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    for (date, delta) in pairs {
        *by_date.entry(date).or_default() += delta;
    }

    let row = |date, count| DailyCount::new(key.facet.clone(), key.metric.clone(), date, count);

    let mut rows = Vec::new();
    let mut count = 0i64;
    let mut last_emitted: Option<NaiveDate> = None;

    for (date, delta) in by_date {
        if count > 0 {
            if let Some(prev) = last_emitted {
                for day in prev.iter_days().skip(1).take_while(|d| *d < date) {
                    rows.push(row(day, count));
                }
            }
        }
        count += delta;
        if count > 0 {
            rows.push(row(date, count));
            last_emitted = Some(date);
        }
    }

    if count > 0 {
        if let Some(prev) = last_emitted {
            for day in prev.iter_days().skip(1).take_while(|d| *d <= now) {
                rows.push(row(day, count));
            }
        }
    }

    rows
}
