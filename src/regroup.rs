//! Bucket regrouping: re-keying dense per-day rows by `(facet, date)` so
//! every metric destined for one bucket arrives together.

use std::collections::BTreeMap;

use chrono::NaiveDate;

use crate::series::DailyCount;
use crate::WILDCARD_FACET;

/// Groups rows by `(facet, date)` and re-emits every row under the
/// wildcard facet, so the cross-facet ("all organizations") view flows
/// through the same writer path as any single facet.
///
/// Within a group, counts for the same metric are summed. A per-facet
/// group holds at most one row per metric per day, so the summing only
/// takes effect in the wildcard group, where it produces the cross-facet
/// totals. Re-emission doubles row volume; grouping order is
/// deterministic.
pub fn regroup(
    rows: impl IntoIterator<Item = DailyCount>,
) -> BTreeMap<(String, NaiveDate), Vec<(String, i64)>> {
    let mut groups: BTreeMap<(String, NaiveDate), BTreeMap<String, i64>> = BTreeMap::new();

    for row in rows {
        *groups
            .entry((WILDCARD_FACET.to_string(), row.date))
            .or_default()
            .entry(row.metric.clone())
            .or_default() += row.count;
        *groups
            .entry((row.facet, row.date))
            .or_default()
            .entry(row.metric)
            .or_default() += row.count;
    }

    groups
        .into_iter()
        .map(|(key, metrics)| (key, metrics.into_iter().collect()))
        .collect()
}
