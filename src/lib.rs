//! Batch reconstruction of daily historical metric counts from entity
//! change history.
//!
//! `retrotally` scans the full change history of tracked entities and
//! rebuilds, for every calendar day since data collection began, the count
//! of entities satisfying each configured metric condition, sliced by
//! facet (a grouping dimension such as an organization). Each run produces
//! a fresh, immutable result set that is published with a single atomic
//! cutover; readers of the previous result set are never disturbed.
//!
//! The pipeline is two chained fan-out/fan-in stages per entity kind:
//!
//! ```text
//! history ──extract──▶ deltas ──combine──▶ net deltas ──day series──▶ rows
//!                                                                      │
//!     buckets ◀──write── (facet, date) groups ◀──regroup── spill ◀─────┘
//! ```
//!
//! [`extract_deltas`] turns one entity's history into signed unit deltas,
//! [`combine_by_key`]/[`merge_combined`] pre-aggregate them,
//! [`day_series`] densifies each key into one row per calendar day
//! (forward-filled through "now"), [`regroup`] re-keys rows by
//! `(facet, date)` with a wildcard re-emission for cross-facet totals, and
//! [`MetricsStore`] persists one [`MetricsBucket`] per touched
//! `(facet, date)` under the run's [`VersionRecord`]. [`RunController`]
//! drives the whole run against a [`HistorySource`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub mod combine;
pub mod config;
pub mod extract;
pub mod io;
pub mod regroup;
pub mod run;
pub mod series;
pub mod store;

pub use combine::{combine, combine_by_key, merge_combined};
pub use config::{snapshot_field, ConfigError, Extractor, FieldDef, KindConfig, MetricsConfig};
pub use extract::extract_deltas;
pub use regroup::regroup;
pub use run::{
    HistorySource, PipelineError, RunController, RunOptions, RunReport, SourceError,
};
pub use series::{day_series, DailyCount, ParseRowError};
pub use store::{
    MetricsBucket, MetricsStore, StoreError, VersionId, VersionRecord, DATA_FORMAT_VERSION,
};

/// Reserved synthetic field carrying the per-facet row count.
///
/// The extractor seeds it to `"1"` on an entity's first record, so every
/// entity contributes one unit to its kind's total under its current
/// facet. Metric configurations may not define a field with this name.
pub const TOTAL_FIELD: &str = "TOTAL";

/// Regroup-time facet under which every row is re-emitted to produce
/// cross-facet ("all organizations") totals.
pub const WILDCARD_FACET: &str = "*";

/// At-rest facet id of the cross-facet total bucket.
pub const CROSS_FACET: &str = "";

/// One historical record of a tracked entity or a logically related child
/// record.
///
/// Snapshots are read-only inputs: the engine sorts them by timestamp and
/// derives state from them but never mutates or persists them.
/// `record_kind` is the record's own kind, which lets extractors tell a
/// child record (say, a consent event) apart from the entity itself and
/// update only the fields it knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub record_kind: String,
    pub timestamp: DateTime<Utc>,
    pub values: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn new(record_kind: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            record_kind: record_kind.into(),
            timestamp,
            values: BTreeMap::new(),
        }
    }

    /// Adds one raw field value, builder-style.
    pub fn with_value(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    /// Returns the raw value recorded for `field`, if any.
    pub fn value(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }
}

/// The composite key one delta stream is aggregated under.
///
/// `metric` is `kind.field.value` for a tracked field, or the bare entity
/// kind for the synthetic total. Rendered as `facet|metric`, which is also
/// the first two columns of the flat stage-boundary row. Neither part may
/// contain `|`; the engine does not check this (well-formed input is a
/// source-data assumption).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MetricKey {
    pub facet: String,
    pub metric: String,
}

impl MetricKey {
    /// Builds the key for `field = value` of `kind`, tallied under `facet`.
    ///
    /// [`TOTAL_FIELD`] collapses to the bare kind with no field/value
    /// suffix.
    pub fn new(facet: impl Into<String>, kind: &str, field: &str, value: &str) -> Self {
        let metric = if field == TOTAL_FIELD {
            kind.to_string()
        } else {
            format!("{kind}.{field}.{value}")
        };
        Self {
            facet: facet.into(),
            metric,
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.facet, self.metric)
    }
}

/// One signed unit change (+1/-1) to one metric key on one date.
///
/// Deltas only live between the extractor and the combiner; they are never
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub key: MetricKey,
    pub date: NaiveDate,
    pub value: i64,
}

impl Delta {
    pub fn increment(key: MetricKey, date: NaiveDate) -> Self {
        Self {
            key,
            date,
            value: 1,
        }
    }

    pub fn decrement(key: MetricKey, date: NaiveDate) -> Self {
        Self {
            key,
            date,
            value: -1,
        }
    }
}
