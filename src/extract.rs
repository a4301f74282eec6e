//! Delta extraction: walking one entity's ordered history and emitting
//! signed unit deltas keyed by facet, metric and date.
//!
//! The walk rebuilds the entity's tracked state record by record and
//! emits a `+1` for every field value that becomes current and a `-1`
//! for the value it displaces. When the facet changes, every tracked
//! field is retracted under the old facet and re-asserted under the new
//! one on that date, including fields whose value did not change;
//! per-facet totals would drift otherwise.

use crate::config::KindConfig;
use crate::{Delta, MetricKey, Snapshot, TOTAL_FIELD};

/// Turns one entity's history into the deltas it contributes.
///
/// Records are stably sorted by timestamp before the walk; callers may
/// hand over history in any order. The first record seeds the kind's
/// initial state and the synthetic total field, so a single-record
/// history yields only `+1` emissions. Records that change nothing
/// observable emit nothing.
///
/// # Examples
///
/// ```
/// use retrotally::{extract_deltas, snapshot_field, KindConfig, Snapshot};
///
/// let kind = KindConfig::new("participant", "hpo")
///     .field("hpo", snapshot_field("hpo"))
///     .field("status", snapshot_field("status"));
///
/// let history = vec![Snapshot::new("participant", "2020-01-01T00:00:00Z".parse().unwrap())
///     .with_value("hpo", "org1")
///     .with_value("status", "ENROLLED")];
///
/// let deltas = extract_deltas(&kind, history);
/// // TOTAL, hpo and status each gain one unit under org1.
/// assert_eq!(deltas.len(), 3);
/// assert!(deltas.iter().all(|d| d.value == 1 && d.key.facet == "org1"));
/// ```
pub fn extract_deltas(cfg: &KindConfig, mut history: Vec<Snapshot>) -> Vec<Delta> {
    if history.is_empty() {
        return Vec::new();
    }
    history.sort_by_key(|snap| snap.timestamp);

    let mut deltas = Vec::new();
    let mut last_state = std::collections::BTreeMap::new();
    let mut last_facet: Option<String> = None;

    for snap in &history {
        let mut state = last_state.clone();
        if last_facet.is_none() {
            // First record seeds the baseline state.
            for (field, value) in &cfg.initial_state {
                state.insert(field.clone(), value.clone());
            }
            state.insert(TOTAL_FIELD.to_string(), "1".to_string());
        }
        for def in &cfg.fields {
            if let Some(value) = (def.extractor)(snap) {
                state.insert(def.name.clone(), value);
            }
        }
        if state == last_state {
            continue;
        }

        let facet = state.get(&cfg.facet_field).cloned().unwrap_or_default();
        let facet_changed = last_facet.as_deref() != Some(facet.as_str());
        let date = snap.timestamp.date_naive();

        for (field, value) in &state {
            if !facet_changed && last_state.get(field) == Some(value) {
                continue;
            }
            deltas.push(Delta::increment(
                MetricKey::new(facet.clone(), &cfg.kind, field, value),
                date,
            ));
            if let (Some(old), Some(old_facet)) = (last_state.get(field), last_facet.as_deref()) {
                deltas.push(Delta::decrement(
                    MetricKey::new(old_facet, &cfg.kind, field, old),
                    date,
                ));
            }
        }

        last_state = state;
        last_facet = Some(facet);
    }

    deltas
}
