//! Metric configuration: which entity kinds are tallied, which fields of
//! their state are tracked, and how each field's value is derived from a
//! history record.
//!
//! A configuration is built once, validated by the run controller before
//! any version is created, and shared immutably across workers for the
//! rest of the run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use thiserror::Error;

use crate::{Snapshot, TOTAL_FIELD};

/// Derives one tracked field's new value from one history record.
///
/// Returning `None` leaves the field untouched, which is how a child
/// record (a different `record_kind`) updates only the fields it knows
/// about.
pub type Extractor = Arc<dyn Fn(&Snapshot) -> Option<String> + Send + Sync>;

/// Ready-made extractor that copies a raw snapshot value through.
pub fn snapshot_field(name: impl Into<String>) -> Extractor {
    let name = name.into();
    Arc::new(move |snap: &Snapshot| snap.value(&name).map(str::to_string))
}

/// One tracked field of an entity kind.
#[derive(Clone)]
pub struct FieldDef {
    pub name: String,
    pub extractor: Extractor,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, extractor: Extractor) -> Self {
        Self {
            name: name.into(),
            extractor,
        }
    }
}

/// Tally configuration for one entity kind.
///
/// `facet_field` names the state field whose value groups this kind's
/// counts; it must be covered by `initial_state` or `fields`. Fields may
/// appear in both: the initial value seeds the state before the first
/// record's extractors run.
#[derive(Clone)]
pub struct KindConfig {
    pub kind: String,
    pub facet_field: String,
    pub initial_state: BTreeMap<String, String>,
    pub fields: Vec<FieldDef>,
}

impl KindConfig {
    pub fn new(kind: impl Into<String>, facet_field: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            facet_field: facet_field.into(),
            initial_state: BTreeMap::new(),
            fields: Vec::new(),
        }
    }

    /// Seeds `field` with `value` on an entity's first record.
    pub fn initial(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.initial_state.insert(field.into(), value.into());
        self
    }

    /// Tracks `name`, deriving its value with `extractor` on every record.
    pub fn field(mut self, name: impl Into<String>, extractor: Extractor) -> Self {
        self.fields.push(FieldDef::new(name, extractor));
        self
    }

    /// All field names this kind's state can hold.
    pub(crate) fn tracked_fields(&self) -> BTreeSet<&str> {
        self.initial_state
            .keys()
            .map(String::as_str)
            .chain(self.fields.iter().map(|f| f.name.as_str()))
            .collect()
    }
}

/// The full tally table for a run.
#[derive(Clone, Default)]
pub struct MetricsConfig {
    pub kinds: Vec<KindConfig>,
}

impl MetricsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: KindConfig) -> Self {
        self.kinds.push(kind);
        self
    }

    /// Checks the whole table before a run touches the store.
    ///
    /// Kind names must be unique, field names must be unique across all
    /// kinds (published metric names share one flat namespace), the
    /// synthetic total field name is reserved, and every kind's facet
    /// field must be initialized or extracted.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut kinds_seen: BTreeSet<&str> = BTreeSet::new();
        let mut field_owners: BTreeMap<&str, &str> = BTreeMap::new();

        for kind in &self.kinds {
            if !kinds_seen.insert(&kind.kind) {
                return Err(ConfigError::DuplicateKind(kind.kind.clone()));
            }

            let mut own_fields: BTreeSet<&str> = BTreeSet::new();
            for def in &kind.fields {
                if !own_fields.insert(&def.name) {
                    return Err(ConfigError::DuplicateField {
                        field: def.name.clone(),
                        kind: kind.kind.clone(),
                        other: kind.kind.clone(),
                    });
                }
            }

            let tracked = kind.tracked_fields();
            if tracked.contains(TOTAL_FIELD) {
                return Err(ConfigError::ReservedField {
                    kind: kind.kind.clone(),
                });
            }
            if !tracked.contains(kind.facet_field.as_str()) {
                return Err(ConfigError::FacetNotTracked {
                    facet_field: kind.facet_field.clone(),
                    kind: kind.kind.clone(),
                });
            }

            for name in tracked {
                if let Some(owner) = field_owners.insert(name, &kind.kind) {
                    return Err(ConfigError::DuplicateField {
                        field: name.to_string(),
                        kind: kind.kind.clone(),
                        other: owner.to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Entity kind `{0}` is configured twice")]
    DuplicateKind(String),

    #[error("Field `{field}` is tracked by both `{kind}` and `{other}`")]
    DuplicateField {
        field: String,
        kind: String,
        other: String,
    },

    #[error("Kind `{kind}` tracks the reserved total field")]
    ReservedField { kind: String },

    #[error("Facet field `{facet_field}` of kind `{kind}` is neither initialized nor extracted")]
    FacetNotTracked { facet_field: String, kind: String },
}
