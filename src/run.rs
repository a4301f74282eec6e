//! Run orchestration: validating the configuration, creating the run's
//! version, driving both stages for every kind, and publishing the
//! atomic cutover.
//!
//! Kinds are independent and run concurrently; within a kind, stage one
//! fans out over entities, merges the partial aggregates, reduces each
//! key to its dense day series and spills the flat rows, then stage two
//! reads the spill back, regroups by `(facet, date)` and writes buckets.
//! A failure anywhere leaves the version unpublished and the serving
//! pointer untouched.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::combine::{combine_by_key, merge_combined};
use crate::config::{ConfigError, KindConfig, MetricsConfig};
use crate::extract::extract_deltas;
use crate::io::{LineReader, LineWriter, ReadError, WriteError};
use crate::regroup::regroup;
use crate::series::{day_series, DailyCount};
use crate::store::{MetricsStore, StoreError, VersionId};
use crate::{MetricKey, Snapshot, CROSS_FACET, WILDCARD_FACET};

/// Failure reported by a history source; opaque to the pipeline.
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// Supplies entity histories to a run.
///
/// Implementations are shared by reference across worker threads; loads
/// for different entities may run concurrently and in any order.
pub trait HistorySource: Sync {
    /// Keys of every entity of `kind` that should be tallied.
    fn entity_keys(&self, kind: &str) -> Result<Vec<String>, SourceError>;

    /// Full history of one entity and its tracked children. May be
    /// empty; the extractor sorts, so order does not matter.
    fn load_history(&self, kind: &str, entity: &str) -> Result<Vec<Snapshot>, SourceError>;
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Dedicated worker-pool size; `None` shares the global pool.
    pub workers: Option<usize>,
    /// Extra attempts for a failing history load before the run aborts.
    pub load_retries: u32,
    /// Run stamp and forward-fill cutoff; `None` uses the wall clock.
    pub now: Option<DateTime<Utc>>,
    /// Stage spill directory; `None` keeps it under the store root.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: None,
            load_retries: 2,
            now: None,
            scratch_dir: None,
        }
    }
}

/// Totals from one published run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub version: VersionId,
    pub entities: u64,
    pub series_rows: u64,
    pub buckets: u64,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Configuration rejected: {0}")]
    Config(#[from] ConfigError),

    #[error("History source failed while {context}: {source}")]
    Source {
        context: String,
        source: SourceError,
    },

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Stage spill write failed: {0}")]
    SpillWrite(#[from] WriteError),

    #[error("Stage spill read failed: {0}")]
    SpillRead(#[from] ReadError),
}

/// Drives complete metric runs against a [`HistorySource`] and a
/// [`MetricsStore`].
///
/// ```rust
/// use retrotally::{MetricsConfig, MetricsStore, RunController, RunOptions};
///
/// # fn example(
/// #     config: MetricsConfig,
/// #     source: &dyn retrotally::HistorySource,
/// # ) -> Result<(), Box<dyn std::error::Error>> {
/// let store = MetricsStore::open("metrics")?;
/// let controller = RunController::new(config, RunOptions::default());
///
/// let report = controller.run(source, &store)?;
/// println!("published version {}", report.version);
/// # Ok(())
/// # }
/// ```
pub struct RunController {
    config: MetricsConfig,
    options: RunOptions,
}

impl RunController {
    pub fn new(config: MetricsConfig, options: RunOptions) -> Self {
        Self { config, options }
    }

    /// Execute one full run and publish it.
    ///
    /// The configuration is validated before any side effect; a rejected
    /// table aborts with no version created. After the run's version is
    /// created, any failure abandons it unpublished and surfaces the
    /// error; the previous serving version keeps serving either way.
    pub fn run(
        &self,
        source: &dyn HistorySource,
        store: &MetricsStore,
    ) -> Result<RunReport, PipelineError> {
        self.config.validate()?;

        let started = self.options.now.unwrap_or_else(Utc::now);
        let version = store.begin_version(started)?;
        info!(
            version = %version.id,
            kinds = self.config.kinds.len(),
            "metrics run started"
        );

        match self.execute(source, store, version.id, started.date_naive()) {
            Ok(report) => Ok(report),
            Err(err) => {
                store.abandon_run();
                warn!(
                    version = %version.id,
                    error = %err,
                    "run abandoned; version stays unpublished"
                );
                Err(err)
            }
        }
    }

    fn execute(
        &self,
        source: &dyn HistorySource,
        store: &MetricsStore,
        version: VersionId,
        today: NaiveDate,
    ) -> Result<RunReport, PipelineError> {
        let scratch = self
            .options
            .scratch_dir
            .clone()
            .unwrap_or_else(|| store.root().join("stage"));
        let run_dir = scratch.join(version.to_string());
        std::fs::create_dir_all(&run_dir).map_err(WriteError::from)?;

        let (entities, series_rows, buckets) = match self.options.workers {
            Some(workers) => {
                match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
                    Ok(pool) => {
                        pool.install(|| self.run_kinds(source, store, version, &run_dir, today))
                    }
                    Err(err) => {
                        warn!(error = %err, "dedicated worker pool unavailable, sharing the global pool");
                        self.run_kinds(source, store, version, &run_dir, today)
                    }
                }
            }
            None => self.run_kinds(source, store, version, &run_dir, today),
        }?;

        let completed = self.options.now.unwrap_or_else(Utc::now);
        let published = store.publish(completed)?;
        info!(
            version = %published.id,
            entities,
            series_rows,
            buckets,
            "metrics version published"
        );

        // The spill has served its purpose; a failed run keeps its
        // scratch around for inspection instead.
        if let Err(err) = std::fs::remove_dir_all(&run_dir) {
            debug!(error = %err, "run scratch not removed");
        }

        Ok(RunReport {
            version: published.id,
            entities,
            series_rows,
            buckets,
        })
    }

    fn run_kinds(
        &self,
        source: &dyn HistorySource,
        store: &MetricsStore,
        version: VersionId,
        run_dir: &Path,
        today: NaiveDate,
    ) -> Result<(u64, u64, u64), PipelineError> {
        self.config
            .kinds
            .par_iter()
            .map(|cfg| self.run_kind(cfg, source, store, version, run_dir, today))
            .try_reduce(
                || (0, 0, 0),
                |left, right| Ok((left.0 + right.0, left.1 + right.1, left.2 + right.2)),
            )
    }

    fn run_kind(
        &self,
        cfg: &KindConfig,
        source: &dyn HistorySource,
        store: &MetricsStore,
        version: VersionId,
        run_dir: &Path,
        today: NaiveDate,
    ) -> Result<(u64, u64, u64), PipelineError> {
        let spill = run_dir.join(format!("{}.rows", cfg.kind));

        let (entities, rows) = self.stage_one(cfg, source, &spill, today)?;
        let buckets = self.stage_two(cfg, store, version, &spill)?;

        info!(kind = %cfg.kind, entities, rows, buckets, "kind finished");
        Ok((entities, rows, buckets))
    }

    /// Extract, combine and reduce one kind, spilling flat day rows.
    fn stage_one(
        &self,
        cfg: &KindConfig,
        source: &dyn HistorySource,
        spill: &Path,
        today: NaiveDate,
    ) -> Result<(u64, u64), PipelineError> {
        let keys = source
            .entity_keys(&cfg.kind)
            .map_err(|source| PipelineError::Source {
                context: format!("listing entities of kind `{}`", cfg.kind),
                source,
            })?;
        let entities = keys.len() as u64;

        type Combined = HashMap<MetricKey, Vec<(NaiveDate, i64)>>;
        let combined = keys
            .par_iter()
            .map(|entity| -> Result<Combined, PipelineError> {
                let history = self.load_with_retry(source, cfg, entity)?;
                Ok(combine_by_key(extract_deltas(cfg, history)))
            })
            .try_reduce(HashMap::new, |left, right| Ok(merge_combined(left, right)))?;

        let mut rows = Vec::new();
        for (key, pairs) in combined {
            rows.extend(day_series(&key, pairs, today));
        }

        let mut writer = LineWriter::open(spill)?;
        writer.write_batch(&rows)?;
        debug!(path = %spill.display(), rows = rows.len(), "stage one spilled");

        Ok((entities, rows.len() as u64))
    }

    /// Read one kind's spill back, regroup and write its buckets.
    fn stage_two(
        &self,
        cfg: &KindConfig,
        store: &MetricsStore,
        version: VersionId,
        spill: &Path,
    ) -> Result<u64, PipelineError> {
        let mut rows = Vec::new();
        for row in LineReader::<DailyCount>::open(spill)? {
            rows.push(row?);
        }
        debug!(kind = %cfg.kind, rows = rows.len(), "stage two read the spill back");

        let groups = regroup(rows);
        let buckets = groups.len() as u64;

        for ((facet, date), metrics) in groups {
            let at_rest = if facet == WILDCARD_FACET {
                CROSS_FACET
            } else {
                facet.as_str()
            };
            store.put_bucket(version, at_rest, date, metrics)?;
        }

        Ok(buckets)
    }

    fn load_with_retry(
        &self,
        source: &dyn HistorySource,
        cfg: &KindConfig,
        entity: &str,
    ) -> Result<Vec<Snapshot>, PipelineError> {
        let mut attempt = 0;
        loop {
            match source.load_history(&cfg.kind, entity) {
                Ok(history) => return Ok(history),
                Err(err) if attempt < self.options.load_retries => {
                    attempt += 1;
                    warn!(
                        kind = %cfg.kind,
                        entity,
                        attempt,
                        error = %err,
                        "history load failed, retrying"
                    );
                }
                Err(source) => {
                    return Err(PipelineError::Source {
                        context: format!("loading entity `{entity}` of kind `{}`", cfg.kind),
                        source,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;
    use tempfile::tempdir;

    use super::*;
    use crate::config::snapshot_field;
    use crate::store::MetricsBucket;

    fn ts(raw: &str) -> DateTime<Utc> {
        raw.parse().unwrap()
    }

    fn day(raw: &str) -> NaiveDate {
        raw.parse().unwrap()
    }

    fn participant_config() -> MetricsConfig {
        MetricsConfig::new().kind(
            KindConfig::new("participant", "hpo")
                .field("hpo", snapshot_field("hpo"))
                .field("status", snapshot_field("status")),
        )
    }

    fn options_at(now: &str) -> RunOptions {
        RunOptions {
            now: Some(ts(now)),
            ..RunOptions::default()
        }
    }

    #[derive(Default)]
    struct MemorySource {
        histories: BTreeMap<(String, String), Vec<Snapshot>>,
    }

    impl MemorySource {
        fn insert(&mut self, kind: &str, entity: &str, history: Vec<Snapshot>) {
            self.histories
                .insert((kind.to_string(), entity.to_string()), history);
        }
    }

    impl HistorySource for MemorySource {
        fn entity_keys(&self, kind: &str) -> Result<Vec<String>, SourceError> {
            Ok(self
                .histories
                .keys()
                .filter(|(k, _)| k == kind)
                .map(|(_, entity)| entity.clone())
                .collect())
        }

        fn load_history(&self, kind: &str, entity: &str) -> Result<Vec<Snapshot>, SourceError> {
            Ok(self
                .histories
                .get(&(kind.to_string(), entity.to_string()))
                .cloned()
                .unwrap_or_default())
        }
    }

    /// Fails the first `failures` loads, then behaves.
    struct FlakySource {
        inner: MemorySource,
        failures: Mutex<u32>,
    }

    impl HistorySource for FlakySource {
        fn entity_keys(&self, kind: &str) -> Result<Vec<String>, SourceError> {
            self.inner.entity_keys(kind)
        }

        fn load_history(&self, kind: &str, entity: &str) -> Result<Vec<Snapshot>, SourceError> {
            let mut left = self.failures.lock();
            if *left > 0 {
                *left -= 1;
                return Err("transient load failure".into());
            }
            self.inner.load_history(kind, entity)
        }
    }

    fn migrating_participant() -> Vec<Snapshot> {
        vec![
            Snapshot::new("participant", ts("2020-01-01T00:00:00Z"))
                .with_value("hpo", "org1")
                .with_value("status", "A"),
            Snapshot::new("participant", ts("2020-01-05T00:00:00Z")).with_value("status", "B"),
            Snapshot::new("participant", ts("2020-01-05T06:00:00Z")).with_value("hpo", "org2"),
        ]
    }

    fn bucket_shape(bucket: MetricsBucket) -> (String, NaiveDate, BTreeMap<String, i64>) {
        (bucket.facet, bucket.date, bucket.metrics)
    }

    #[test]
    fn run_publishes_the_expected_buckets() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let mut source = MemorySource::default();
        source.insert("participant", "P1", migrating_participant());

        let controller =
            RunController::new(participant_config(), options_at("2020-01-07T12:00:00Z"));
        let report = controller.run(&source, &store).unwrap();

        assert_eq!(report.entities, 1);
        assert_eq!(store.serving_version().unwrap().id, report.version);

        // Counts live under org1 through January 4.
        let early = store
            .bucket(report.version, "org1", day("2020-01-03"))
            .unwrap()
            .unwrap();
        assert_eq!(early.metrics["participant"], 1);
        assert_eq!(early.metrics["participant.status.A"], 1);
        assert_eq!(early.metrics["participant.hpo.org1"], 1);

        // The migration date has no org1 bucket at all.
        assert!(store
            .bucket(report.version, "org1", day("2020-01-05"))
            .unwrap()
            .is_none());

        // From January 5 the entity counts under org2 with status B.
        let late = store
            .bucket(report.version, "org2", day("2020-01-06"))
            .unwrap()
            .unwrap();
        assert_eq!(late.metrics["participant"], 1);
        assert_eq!(late.metrics["participant.status.B"], 1);
        assert!(!late.metrics.contains_key("participant.status.A"));

        // The cross-facet total follows the entity across the migration.
        for date in ["2020-01-02", "2020-01-05", "2020-01-07"] {
            let cross = store
                .bucket(report.version, CROSS_FACET, day(date))
                .unwrap()
                .unwrap();
            assert_eq!(cross.metrics["participant"], 1);
        }
        let cross_late = store
            .bucket(report.version, CROSS_FACET, day("2020-01-05"))
            .unwrap()
            .unwrap();
        assert!(!cross_late.metrics.contains_key("participant.status.A"));
    }

    #[test]
    fn rerun_produces_identical_buckets_under_a_new_version() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let mut source = MemorySource::default();
        source.insert("participant", "P1", migrating_participant());
        source.insert(
            "participant",
            "P2",
            vec![Snapshot::new("participant", ts("2020-01-03T00:00:00Z"))
                .with_value("hpo", "org1")
                .with_value("status", "A")],
        );

        let controller =
            RunController::new(participant_config(), options_at("2020-01-07T12:00:00Z"));
        let first = controller.run(&source, &store).unwrap();
        let second = controller.run(&source, &store).unwrap();

        assert_ne!(first.version, second.version);

        let first_buckets: Vec<_> = store
            .buckets(first.version)
            .unwrap()
            .into_iter()
            .map(bucket_shape)
            .collect();
        let second_buckets: Vec<_> = store
            .buckets(second.version)
            .unwrap()
            .into_iter()
            .map(bucket_shape)
            .collect();

        assert_eq!(first_buckets, second_buckets);
        assert_eq!(store.serving_version().unwrap().id, second.version);
    }

    #[test]
    fn wildcard_bucket_sums_the_per_facet_counts() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let mut source = MemorySource::default();
        for (entity, org) in [("P1", "org1"), ("P2", "org2")] {
            source.insert(
                "participant",
                entity,
                vec![Snapshot::new("participant", ts("2020-01-01T00:00:00Z"))
                    .with_value("hpo", org)
                    .with_value("status", "ENROLLED")],
            );
        }

        let controller =
            RunController::new(participant_config(), options_at("2020-01-03T12:00:00Z"));
        let report = controller.run(&source, &store).unwrap();

        let org1 = store
            .bucket(report.version, "org1", day("2020-01-02"))
            .unwrap()
            .unwrap();
        let org2 = store
            .bucket(report.version, "org2", day("2020-01-02"))
            .unwrap()
            .unwrap();
        let cross = store
            .bucket(report.version, CROSS_FACET, day("2020-01-02"))
            .unwrap()
            .unwrap();

        assert_eq!(
            cross.metrics["participant"],
            org1.metrics["participant"] + org2.metrics["participant"]
        );
        assert_eq!(cross.metrics["participant.status.ENROLLED"], 2);
    }

    #[test]
    fn invalid_config_aborts_before_any_version_exists() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let config = MetricsConfig::new()
            .kind(
                KindConfig::new("participant", "hpo")
                    .field("hpo", snapshot_field("hpo"))
                    .field("status", snapshot_field("status")),
            )
            .kind(
                KindConfig::new("site", "region")
                    .field("region", snapshot_field("region"))
                    .field("status", snapshot_field("status")),
            );

        let controller = RunController::new(config, options_at("2020-01-07T12:00:00Z"));
        let result = controller.run(&MemorySource::default(), &store);

        assert!(matches!(result, Err(PipelineError::Config(_))));
        assert!(store.versions().is_empty());
    }

    #[test]
    fn transient_load_failures_are_retried() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let mut inner = MemorySource::default();
        inner.insert("participant", "P1", migrating_participant());
        let source = FlakySource {
            inner,
            failures: Mutex::new(2),
        };

        let controller =
            RunController::new(participant_config(), options_at("2020-01-07T12:00:00Z"));
        let report = controller.run(&source, &store).unwrap();

        assert_eq!(report.entities, 1);
        assert!(store.serving_version().is_some());
    }

    #[test]
    fn exhausted_retries_abandon_the_run_and_the_next_one_recovers() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let mut inner = MemorySource::default();
        inner.insert("participant", "P1", migrating_participant());
        let flaky = FlakySource {
            inner,
            failures: Mutex::new(u32::MAX),
        };

        let options = RunOptions {
            load_retries: 1,
            ..options_at("2020-01-07T12:00:00Z")
        };
        let controller = RunController::new(participant_config(), options);

        let result = controller.run(&flaky, &store);
        assert!(matches!(result, Err(PipelineError::Source { .. })));
        assert!(store.serving_version().is_none());

        let abandoned = store.versions()[0].clone();
        assert!(abandoned.in_progress && !abandoned.complete);

        // Failed runs keep their scratch for inspection.
        assert!(store.root().join("stage").join("1").exists());

        // The next run demotes the abandoned version and publishes.
        let mut source = MemorySource::default();
        source.insert("participant", "P1", migrating_participant());
        let report = controller.run(&source, &store).unwrap();

        assert_eq!(store.serving_version().unwrap().id, report.version);
        let demoted = store.version(abandoned.id).unwrap();
        assert!(!demoted.in_progress && !demoted.complete);
    }

    #[test]
    fn concurrent_kinds_share_cross_facet_tail_buckets() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let config = MetricsConfig::new()
            .kind(
                KindConfig::new("participant", "hpo")
                    .field("hpo", snapshot_field("hpo"))
                    .field("status", snapshot_field("status")),
            )
            .kind(
                KindConfig::new("site", "region")
                    .field("region", snapshot_field("region"))
                    .field("site_status", snapshot_field("site_status")),
            );

        let mut source = MemorySource::default();
        source.insert(
            "participant",
            "P1",
            vec![Snapshot::new("participant", ts("2020-01-01T00:00:00Z"))
                .with_value("hpo", "org1")
                .with_value("status", "A")],
        );
        source.insert(
            "site",
            "S1",
            vec![Snapshot::new("site", ts("2020-01-02T00:00:00Z"))
                .with_value("region", "west")
                .with_value("site_status", "ACTIVE")],
        );

        let options = RunOptions {
            workers: Some(2),
            ..options_at("2020-01-04T12:00:00Z")
        };
        let controller = RunController::new(config, options);
        let report = controller.run(&source, &store).unwrap();

        assert_eq!(report.entities, 2);

        // Both kinds forward-fill to now, so the tail date's cross-facet
        // bucket holds metrics from each of them.
        let cross = store
            .bucket(report.version, CROSS_FACET, day("2020-01-04"))
            .unwrap()
            .unwrap();
        assert_eq!(cross.metrics["participant"], 1);
        assert_eq!(cross.metrics["site"], 1);

        let west = store
            .bucket(report.version, "west", day("2020-01-03"))
            .unwrap()
            .unwrap();
        assert_eq!(west.metrics["site.site_status.ACTIVE"], 1);
    }

    #[test]
    fn entities_with_empty_histories_publish_an_empty_version() {
        let dir = tempdir().unwrap();
        let store = MetricsStore::open(dir.path()).unwrap();

        let mut source = MemorySource::default();
        source.insert("participant", "P1", Vec::new());

        let controller =
            RunController::new(participant_config(), options_at("2020-01-07T12:00:00Z"));
        let report = controller.run(&source, &store).unwrap();

        assert_eq!(report.entities, 1);
        assert_eq!(report.series_rows, 0);
        assert_eq!(report.buckets, 0);
        assert!(store.serving_version().is_some());
        assert!(store.buckets(report.version).unwrap().is_empty());
    }
}
