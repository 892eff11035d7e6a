use async_trait::async_trait;
use factstore::chrono::NaiveDate;
use factstore::{DateSpan, DimensionRegistry, Extraction, FactStore, Stager, Storage, StoreError};
use pipeline::api::Extractor;
use pipeline::geo::ManifestResolver;
use pipeline::launcher::{self, Job, JobOutcome};
use pipeline::settings::{AppConfig, MetricSettings};
use pipeline::PipelineError;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
}

fn temp_dir() -> PathBuf {
    env::temp_dir().join("pipeline").join(format!("run_{}", rand::random::<u64>()))
}

/// Bundled settings pointed at a fresh database and snapshot location.
fn config() -> AppConfig {
    let dir = temp_dir();
    let mut config = AppConfig::new("config/settings").unwrap();
    config.store.db_path = dir.join("market.redb").display().to_string();
    config.snapshot.path = dir.join("public.redb").display().to_string();
    config
}

fn read(config: &AppConfig, geo: &str, metric: &str) -> Vec<(NaiveDate, Option<f64>)> {
    launcher::read(config, geo, metric, None, None).unwrap()
}

fn assert_close(actual: &[(NaiveDate, Option<f64>)], expected: &[(NaiveDate, f64)]) {
    assert_eq!(actual.len(), expected.len(), "{actual:?}");
    for ((date, value), (want_date, want)) in actual.iter().zip(expected) {
        assert_eq!(date, want_date);
        assert!((value.unwrap() - want).abs() < 1e-9, "{date}: {value:?} != {want}");
    }
}

struct FailingExtractor;

#[async_trait]
impl Extractor for FailingExtractor {
    fn name(&self) -> String {
        "unreachable api".into()
    }

    async fn extract(&self) -> Result<Extraction, StoreError> {
        Err(StoreError::ExtractionFailed("connection reset".into()))
    }
}

#[tokio::test]
async fn bundled_jobs_load_and_derive_spreads() {
    let config = config();
    let jobs = launcher::jobs_from_settings(&config, Path::new(".")).unwrap();
    let report = launcher::run_jobs(&config, jobs).await.unwrap();
    assert_eq!(report.loaded(), 4);
    assert!(report.recompute.failed.is_empty());

    assert_close(&read(&config, "us_national", "spread_10y_2y"), &[
        (d(2024, 1, 1), 4.06 - 4.36),
        (d(2024, 2, 1), 4.21 - 4.58),
        (d(2024, 3, 1), 4.21 - 4.59),
    ]);
    let mortgage = read(&config, "us_national", "fred_mortgage_30y_avg");
    assert_eq!(mortgage.len(), 3);
    assert!((mortgage[0].1.unwrap() - (6.62 + 6.66 + 6.60 + 6.69) / 4.0).abs() < 1e-9);
    assert_eq!(read(&config, "us_national", "spread_mortgage_10y").len(), 3);

    let (_, redfin) = report.jobs.iter().find(|(label, _)| label == "redfin:median_sale_price").unwrap();
    match redfin {
        JobOutcome::Loaded { stage, inserted, .. } => {
            assert_eq!(stage.dropped_unknown_geo, 1);
            assert_eq!(*inserted, 6);
        }
        other => panic!("redfin job did not load: {other:?}"),
    }
    assert_eq!(read(&config, "dc_state", "median_sale_price"), vec![(d(2024, 1, 1), Some(598000.0)), (d(2024, 2, 1), None)]);
}

#[tokio::test]
async fn rerunning_the_same_jobs_changes_nothing() {
    let config = config();
    let first = launcher::run_jobs(&config, launcher::jobs_from_settings(&config, Path::new(".")).unwrap()).await.unwrap();
    let second = launcher::run_jobs(&config, launcher::jobs_from_settings(&config, Path::new(".")).unwrap()).await.unwrap();
    assert!(second.recompute.recomputed.is_empty());
    assert!(second.recompute.invalidated.is_empty());
    assert_eq!(first.summary, second.summary);
}

#[tokio::test]
async fn failed_extraction_skips_only_its_job() {
    let config = config();
    let mut jobs = launcher::jobs_from_settings(&config, Path::new(".")).unwrap();
    jobs.retain(|job| job.label == "fred:fred_gs10");
    jobs.push(Job {
        label: "fred:fred_gs2".into(),
        stager: Stager::new("fred", "fred_gs2"),
        resolver: ManifestResolver::for_source(&config.markets, "fred"),
        extractor: Box::new(FailingExtractor),
    });
    let report = launcher::run_jobs(&config, jobs).await.unwrap();
    assert_eq!(report.loaded(), 1);
    assert!(matches!(report.jobs[1].1, JobOutcome::ExtractionFailed(StoreError::ExtractionFailed(_))));
    assert_eq!(read(&config, "us_national", "fred_gs10").len(), 4);
    // gs2 is absent so the spread joins to nothing
    assert!(read(&config, "us_national", "spread_10y_2y").is_empty());
}

#[tokio::test]
async fn configuration_errors_stop_the_run_before_storage() {
    let mut config = config();
    config.metrics.push(MetricSettings {
        metric_id: "spread_bogus".into(),
        name: "bogus".into(),
        frequency: factstore::Frequency::Monthly,
        unit: "pp".into(),
        category: "spreads".into(),
        inputs: vec!["fred_gs10".into(), "not_registered".into()],
        combine: Some("difference".into()),
    });
    let err = launcher::run_jobs(&config, Vec::new()).await.unwrap_err();
    assert!(err.is_fatal_configuration(), "{err}");
    assert!(!Path::new(&config.store.db_path).exists());
}

#[tokio::test]
async fn late_registered_derived_metric_is_materialized_by_recompute() {
    let mut config = config();
    let spread = config.metrics.iter().position(|m| m.metric_id == "spread_mortgage_10y").unwrap();
    let late = config.metrics.remove(spread);
    launcher::run_jobs(&config, launcher::jobs_from_settings(&config, Path::new(".")).unwrap()).await.unwrap();

    config.metrics.push(late);
    assert!(read(&config, "us_national", "spread_mortgage_10y").is_empty());
    let report = launcher::recompute(&config, false).unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(read(&config, "us_national", "spread_mortgage_10y").len(), 3);
    let forced = launcher::recompute(&config, true).unwrap();
    assert_eq!(forced.recomputed.len(), 2);
    assert!(forced.invalidated.is_empty());
}

#[tokio::test]
async fn snapshot_copies_recent_facts_and_enforces_size() {
    let mut config = config();
    config.snapshot.min_date = Some(d(2024, 2, 1));
    launcher::run_jobs(&config, launcher::jobs_from_settings(&config, Path::new(".")).unwrap()).await.unwrap();
    let report = launcher::publish(&config).unwrap();
    assert!(report.path.exists());
    assert_eq!(report.markets, config.markets.len());

    let snapshot = Arc::new(Storage::open(&config.snapshot.path, 4).unwrap());
    let facts = FactStore::new(Arc::clone(&snapshot));
    let registry = DimensionRegistry::new(Arc::clone(&snapshot));
    assert!(registry.metric("spread_10y_2y").unwrap().unwrap().is_derived());
    assert_eq!(facts.count().unwrap() as usize, report.observations);
    let gs10 = facts.read("us_national", "fred_gs10", DateSpan::full()).unwrap();
    assert_eq!(gs10.first().map(|(date, _)| *date), Some(d(2024, 2, 1)));
    assert!(facts.pending().unwrap().is_empty());
    drop((facts, registry, snapshot));

    // republishing replaces the file, a zero limit rejects it and leaves it for inspection
    config.snapshot.max_mb = 0;
    let err = launcher::publish(&config).unwrap_err();
    assert!(matches!(err, PipelineError::SnapshotTooLarge { max_mb: 0, .. }), "{err}");
    assert!(Path::new(&config.snapshot.path).exists());
}
