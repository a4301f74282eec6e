//! Local combining: summing same-date deltas before they cross a stage
//! boundary.
//!
//! Combining is associative and commutative and may run zero or more
//! times over arbitrary sub-partitions of one key's deltas without
//! changing the final sums. It only shrinks intermediate volume;
//! correctness never depends on it.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::{Delta, MetricKey};

/// Reduces one key's deltas to net per-date sums, date-ascending.
///
/// Dates whose deltas net to zero are kept; the day-series walk treats a
/// zero the same as its absence, and dropping them here would make the
/// output depend on how the input was partitioned.
pub fn combine(pairs: impl IntoIterator<Item = (NaiveDate, i64)>) -> Vec<(NaiveDate, i64)> {
    let mut by_date: BTreeMap<NaiveDate, i64> = BTreeMap::new();
    for (date, delta) in pairs {
        *by_date.entry(date).or_default() += delta;
    }
    by_date.into_iter().collect()
}

/// Map-side combine of one partition's delta stream.
pub fn combine_by_key(
    deltas: impl IntoIterator<Item = Delta>,
) -> HashMap<MetricKey, Vec<(NaiveDate, i64)>> {
    let mut grouped: HashMap<MetricKey, Vec<(NaiveDate, i64)>> = HashMap::new();
    for delta in deltas {
        grouped
            .entry(delta.key)
            .or_default()
            .push((delta.date, delta.value));
    }
    grouped
        .into_iter()
        .map(|(key, pairs)| (key, combine(pairs)))
        .collect()
}

/// Merges two already-combined partitions, re-combining colliding keys.
pub fn merge_combined(
    mut into: HashMap<MetricKey, Vec<(NaiveDate, i64)>>,
    from: HashMap<MetricKey, Vec<(NaiveDate, i64)>>,
) -> HashMap<MetricKey, Vec<(NaiveDate, i64)>> {
    for (key, pairs) in from {
        match into.entry(key) {
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                let merged = combine(existing.drain(..).chain(pairs));
                *existing = merged;
            }
            Entry::Vacant(slot) => {
                slot.insert(pairs);
            }
        }
    }
    into
}
