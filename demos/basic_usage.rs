//! Basic usage: configure one kind, run the pipeline, read buckets back.
//!
//! Run with: cargo run --example basic_usage

use retrotally::{
    snapshot_field, HistorySource, KindConfig, MetricsConfig, MetricsStore, RunController,
    RunOptions, Snapshot, SourceError,
};
use tracing_subscriber::{fmt, EnvFilter};

/// Two hand-written participant histories standing in for a real backend.
struct DemoSource;

impl HistorySource for DemoSource {
    fn entity_keys(&self, _kind: &str) -> Result<Vec<String>, SourceError> {
        Ok(vec!["P1".to_string(), "P2".to_string()])
    }

    fn load_history(&self, _kind: &str, entity: &str) -> Result<Vec<Snapshot>, SourceError> {
        let history = match entity {
            "P1" => vec![
                Snapshot::new("participant", "2024-01-01T09:00:00Z".parse()?)
                    .with_value("hpo", "org1")
                    .with_value("status", "REGISTERED"),
                Snapshot::new("participant", "2024-01-10T14:30:00Z".parse()?)
                    .with_value("status", "ENROLLED"),
            ],
            _ => vec![Snapshot::new("participant", "2024-01-05T11:00:00Z".parse()?)
                .with_value("hpo", "org2")
                .with_value("status", "REGISTERED")],
        };
        Ok(history)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // One tracked kind: participants, faceted by their organization.
    let config = MetricsConfig::new().kind(
        KindConfig::new("participant", "hpo")
            .field("hpo", snapshot_field("hpo"))
            .field("status", snapshot_field("status")),
    );

    let store = MetricsStore::open("demo_metrics")?;

    // Pin "now" so the forward fill stops at a fixed date.
    let options = RunOptions {
        now: Some("2024-01-20T00:00:00Z".parse()?),
        ..RunOptions::default()
    };
    let controller = RunController::new(config, options);

    let report = controller.run(&DemoSource, &store)?;
    println!(
        "published version {} ({} entities, {} day rows, {} buckets)",
        report.version, report.entities, report.series_rows, report.buckets
    );

    // The empty facet holds the cross-facet totals.
    println!("\nCross-facet totals by day:");
    for bucket in store.buckets(report.version)? {
        if bucket.facet.is_empty() {
            println!("  {}: {:?}", bucket.date, bucket.metrics);
        }
    }

    Ok(())
}
