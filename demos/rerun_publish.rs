//! Rerunning the pipeline: every run rebuilds from scratch under a fresh
//! version, and the serving pointer only moves on publish.
//!
//! Run with: cargo run --example rerun_publish

use retrotally::{
    snapshot_field, HistorySource, KindConfig, MetricsConfig, MetricsStore, RunController,
    RunOptions, Snapshot, SourceError,
};
use tracing_subscriber::{fmt, EnvFilter};

/// One participant that changes status and then migrates organizations.
struct DemoSource;

impl HistorySource for DemoSource {
    fn entity_keys(&self, _kind: &str) -> Result<Vec<String>, SourceError> {
        Ok(vec!["P1".to_string()])
    }

    fn load_history(&self, _kind: &str, _entity: &str) -> Result<Vec<Snapshot>, SourceError> {
        Ok(vec![
            Snapshot::new("participant", "2024-01-01T09:00:00Z".parse()?)
                .with_value("hpo", "org1")
                .with_value("status", "REGISTERED"),
            Snapshot::new("participant", "2024-01-10T14:30:00Z".parse()?)
                .with_value("status", "ENROLLED"),
            Snapshot::new("participant", "2024-01-15T08:00:00Z".parse()?)
                .with_value("hpo", "org2"),
        ])
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = MetricsConfig::new().kind(
        KindConfig::new("participant", "hpo")
            .field("hpo", snapshot_field("hpo"))
            .field("status", snapshot_field("status")),
    );

    let store = MetricsStore::open("demo_metrics_rerun")?;
    let options = RunOptions {
        now: Some("2024-02-01T00:00:00Z".parse()?),
        ..RunOptions::default()
    };
    let controller = RunController::new(config, options);

    let first = controller.run(&DemoSource, &store)?;
    println!("first run published version {}", first.version);

    let second = controller.run(&DemoSource, &store)?;
    println!("second run published version {}", second.version);

    // Identical input rebuilds identical buckets under the new version.
    let a = store.buckets(first.version)?;
    let b = store.buckets(second.version)?;
    let identical = a.len() == b.len()
        && a.iter()
            .zip(&b)
            .all(|(x, y)| x.facet == y.facet && x.date == y.date && x.metrics == y.metrics);
    println!("bucket sets identical across runs: {identical}");

    println!("\nVersion registry:");
    for version in store.versions() {
        println!(
            "  {} in_progress={} complete={} data_version={}",
            version.id, version.in_progress, version.complete, version.data_version
        );
    }
    if let Some(serving) = store.serving_version() {
        println!("serving: {}", serving.id);
    }

    Ok(())
}
