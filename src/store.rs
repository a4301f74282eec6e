use crate::io::{LineReader, LineWriter, ReadError, Record, WriteError};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Format number stamped on a version at publish. Readers only serve
/// versions whose stamp matches; bump it when the bucket shape changes
/// incompatibly.
pub const DATA_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Read error: {0}")]
    Read(#[from] ReadError),

    #[error("Publish requested but no version is in progress")]
    PublishNotRunning,

    #[error("A run is already in progress under version {0}")]
    RunAlreadyInProgress(VersionId),

    #[error("Version {0} is not the in-progress version")]
    VersionNotInProgress(VersionId),
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct VersionId(pub u64);

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One run's identity and status in the version registry.
///
/// `data_version` stays 0 until publish stamps [`DATA_FORMAT_VERSION`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub id: VersionId,
    pub in_progress: bool,
    pub complete: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub data_version: u32,
}

/// All metric counts for one facet on one date, owned by one version.
///
/// The empty facet is the cross-facet total. Buckets exist only for
/// `(facet, date)` pairs touched during their run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsBucket {
    pub version: VersionId,
    pub facet: String,
    pub date: NaiveDate,
    pub metrics: BTreeMap<String, i64>,
}

impl MetricsBucket {
    pub fn new(
        version: VersionId,
        facet: impl Into<String>,
        date: NaiveDate,
        metrics: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            version,
            facet: facet.into(),
            date,
            metrics,
        }
    }
}

impl Record for VersionRecord {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WriteError> {
        serde_json::to_writer(&mut *buf, self)?;
        Ok(())
    }

    fn decode(line: &str) -> Result<Self, ReadError> {
        Ok(serde_json::from_str(line)?)
    }
}

impl Record for MetricsBucket {
    fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WriteError> {
        serde_json::to_writer(&mut *buf, self)?;
        Ok(())
    }

    fn decode(line: &str) -> Result<Self, ReadError> {
        Ok(serde_json::from_str(line)?)
    }
}

/// The bucket workspace of the run this handle currently has in flight.
struct CurrentRun {
    version: VersionId,
    buckets: HashMap<(String, NaiveDate), BTreeMap<String, i64>>,
}

struct StoreState {
    versions: BTreeMap<VersionId, VersionRecord>,
    serving: Option<VersionId>,
    current: Option<CurrentRun>,
}

/// A thread-safe store of versioned metric buckets.
///
/// The store provides:
/// - An append-only version registry with a cached serving pointer
/// - One append-only bucket file per version, replayed last-row-wins
/// - A single-write atomic publish that flips the serving pointer
///
/// On disk it keeps `versions.jsonl` plus one `buckets/<id>.jsonl` per
/// version, all newline-delimited JSON. The last row per key wins on
/// replay, so retried writes are harmless.
///
/// # Examples
///
/// ```rust
/// use retrotally::store::MetricsStore;
/// use chrono::Utc;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = MetricsStore::open("metrics")?;
/// let version = store.begin_version(Utc::now())?;
///
/// store.put_bucket(
///     version.id,
///     "org1",
///     "2020-01-01".parse()?,
///     [("participant".to_string(), 12)],
/// )?;
///
/// let published = store.publish(Utc::now())?;
/// assert!(published.complete);
/// # Ok(())
/// # }
/// ```
pub struct MetricsStore {
    root: PathBuf,
    state: RwLock<StoreState>,
}

impl MetricsStore {
    /// Open a store rooted at `root`, creating the layout if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(root.join("buckets"))?;

        let versions = Self::load_versions(&root.join("versions.jsonl"))?;
        let serving = Self::compute_serving(&versions);

        Ok(Self {
            root,
            state: RwLock::new(StoreState {
                versions,
                serving,
                current: None,
            }),
        })
    }

    /// Start a new run's version.
    ///
    /// Any version still flagged in-progress was left behind by a dead
    /// run; it is demoted here (flag cleared, never completed, so it can
    /// never serve) before the fresh `in_progress` record is appended.
    /// Fails if this handle already has a run in flight.
    pub fn begin_version(&self, started_at: DateTime<Utc>) -> Result<VersionRecord, StoreError> {
        let mut state = self.state.write();

        if let Some(current) = &state.current {
            return Err(StoreError::RunAlreadyInProgress(current.version));
        }

        let mut batch = Vec::new();
        for stale in state.versions.values() {
            if stale.in_progress {
                warn!(version = %stale.id, "demoting stale in-progress version");
                let mut demoted = stale.clone();
                demoted.in_progress = false;
                batch.push(demoted);
            }
        }

        let id = VersionId(state.versions.keys().last().map_or(1, |last| last.0 + 1));
        let record = VersionRecord {
            id,
            in_progress: true,
            complete: false,
            started_at,
            completed_at: None,
            data_version: 0,
        };
        batch.push(record.clone());

        self.append_versions(&batch)?;
        for updated in batch {
            state.versions.insert(updated.id, updated);
        }
        state.current = Some(CurrentRun {
            version: id,
            buckets: HashMap::new(),
        });

        Ok(record)
    }

    /// Merge metric pairs into the run's `(facet, date)` bucket and
    /// persist the updated row.
    ///
    /// Repeated keys are last-write-wins, so retried sub-tasks and
    /// concurrently running kinds can share a bucket; configured field
    /// names are unique across kinds, which keeps the shared namespace
    /// collision-free. The merge happens under the store's write lock so
    /// two kinds cannot interleave a read-modify-write on the same
    /// bucket.
    pub fn put_bucket(
        &self,
        version: VersionId,
        facet: &str,
        date: NaiveDate,
        metrics: impl IntoIterator<Item = (String, i64)>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write();

        let current = match &mut state.current {
            Some(current) if current.version == version => current,
            _ => return Err(StoreError::VersionNotInProgress(version)),
        };

        let bucket = current
            .buckets
            .entry((facet.to_string(), date))
            .or_default();
        for (metric, count) in metrics {
            bucket.insert(metric, count);
        }
        let row = MetricsBucket::new(version, facet, date, bucket.clone());

        let mut writer = LineWriter::open(self.bucket_path(version))?;
        writer.write_batch(&[row])?;

        Ok(())
    }

    /// Finalize the in-progress version.
    ///
    /// Flips the flags, stamps the data-format version and appends that
    /// one record; the single locked, fsync'd write is the cutover, and
    /// until it lands readers keep seeing the previous serving version.
    /// With no version in progress this is an ordering bug in the caller:
    /// it fails fast and touches nothing.
    pub fn publish(&self, completed_at: DateTime<Utc>) -> Result<VersionRecord, StoreError> {
        let mut state = self.state.write();

        let id = state
            .versions
            .values()
            .find(|record| record.in_progress)
            .map(|record| record.id)
            .ok_or(StoreError::PublishNotRunning)?;

        let mut record = state.versions[&id].clone();
        record.in_progress = false;
        record.complete = true;
        record.completed_at = Some(completed_at);
        record.data_version = DATA_FORMAT_VERSION;

        self.append_versions(std::slice::from_ref(&record))?;
        state.versions.insert(id, record.clone());
        state.serving = Self::compute_serving(&state.versions);
        state.current = None;

        Ok(record)
    }

    /// Drop the handle's in-flight bucket workspace after a failed run.
    ///
    /// The version record keeps its on-disk `in_progress` flag; the next
    /// `begin_version` demotes it. Readers never saw the version, so
    /// there is nothing else to undo.
    pub fn abandon_run(&self) {
        let mut state = self.state.write();
        if let Some(current) = state.current.take() {
            warn!(version = %current.version, "abandoning in-flight run");
        }
    }

    /// The version read traffic should be served from, if any.
    pub fn serving_version(&self) -> Option<VersionRecord> {
        let state = self.state.read();
        state
            .serving
            .and_then(|id| state.versions.get(&id).cloned())
    }

    pub fn version(&self, id: VersionId) -> Option<VersionRecord> {
        self.state.read().versions.get(&id).cloned()
    }

    /// All known versions, oldest first.
    pub fn versions(&self) -> Vec<VersionRecord> {
        self.state.read().versions.values().cloned().collect()
    }

    /// All buckets of one version, replayed last-row-wins, ordered by
    /// `(facet, date)`.
    pub fn buckets(&self, version: VersionId) -> Result<Vec<MetricsBucket>, StoreError> {
        let path = self.bucket_path(version);
        let mut latest: BTreeMap<(String, NaiveDate), MetricsBucket> = BTreeMap::new();

        if path.exists() {
            for bucket in LineReader::<MetricsBucket>::open(&path)? {
                let bucket = bucket?;
                latest.insert((bucket.facet.clone(), bucket.date), bucket);
            }
        }

        Ok(latest.into_values().collect())
    }

    pub fn bucket(
        &self,
        version: VersionId,
        facet: &str,
        date: NaiveDate,
    ) -> Result<Option<MetricsBucket>, StoreError> {
        Ok(self
            .buckets(version)?
            .into_iter()
            .find(|bucket| bucket.facet == facet && bucket.date == date))
    }

    /// Root directory of the store's on-disk layout.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn load_versions(path: &Path) -> Result<BTreeMap<VersionId, VersionRecord>, StoreError> {
        let mut versions = BTreeMap::new();

        if path.exists() {
            for record in LineReader::<VersionRecord>::open(path)? {
                let record = record?;
                versions.insert(record.id, record);
            }
        }

        Ok(versions)
    }

    fn compute_serving(versions: &BTreeMap<VersionId, VersionRecord>) -> Option<VersionId> {
        versions
            .values()
            .filter(|record| record.complete && record.data_version == DATA_FORMAT_VERSION)
            .map(|record| record.id)
            .max()
    }

    fn append_versions(&self, records: &[VersionRecord]) -> Result<(), StoreError> {
        let mut writer = LineWriter::open(self.root.join("versions.jsonl"))?;
        writer.write_batch(records)?;
        Ok(())
    }

    fn bucket_path(&self, version: VersionId) -> PathBuf {
        self.root.join("buckets").join(format!("{version}.jsonl"))
    }
}
