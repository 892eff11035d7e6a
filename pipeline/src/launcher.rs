use crate::api::{Extractor, JsonFileExtractor};
use crate::catalog::Catalog;
use crate::err::PipelineError;
use crate::geo::ManifestResolver;
use crate::settings::AppConfig;
use crate::snapshot::{self, SnapshotReport};
use factstore::chrono::NaiveDate;
use factstore::{
    error, info, warn, DateSpan, DerivedMetricEngine, DimensionRegistry, FactStore, InvalidationSet, RecomputeReport, SeriesKey, SeriesSummary, StageReport,
    Stager, Storage, StoreError,
};
use std::path::Path;
use std::sync::Arc;

/// One extraction job: where rows come from and how they are staged.
pub struct Job {
    pub label: String,
    pub stager: Stager,
    pub resolver: ManifestResolver,
    pub extractor: Box<dyn Extractor>,
}

#[derive(Debug)]
pub enum JobOutcome {
    Loaded { stage: StageReport, deleted: usize, inserted: usize },
    ExtractionFailed(StoreError),
    UpsertFailed(StoreError),
}

#[derive(Debug)]
pub struct RunReport {
    pub jobs: Vec<(String, JobOutcome)>,
    pub recompute: RecomputeReport,
    pub summary: Vec<SeriesSummary>,
}

impl RunReport {
    pub fn loaded(&self) -> usize {
        self.jobs.iter().filter(|(_, o)| matches!(o, JobOutcome::Loaded { .. })).count()
    }
}

/// Store components sharing one storage handle; the file is released when this is dropped.
pub struct Components {
    pub storage: Arc<Storage>,
    pub registry: DimensionRegistry,
    pub facts: FactStore,
    pub engine: DerivedMetricEngine,
}

/// Validates the catalog, opens the store and seeds dimensions. Configuration errors surface
/// before the database file is touched.
pub fn open(config: &AppConfig) -> Result<Components, PipelineError> {
    let catalog = Catalog::from_settings(config)?;
    let storage = Arc::new(Storage::open(&config.store.db_path, config.store.cache_size_mb)?);
    let registry = DimensionRegistry::new(Arc::clone(&storage));
    catalog.seed(&registry)?;
    let facts = FactStore::new(Arc::clone(&storage));
    let engine = DerivedMetricEngine::new(registry.clone(), facts.clone(), &config.store.derived_source_id);
    Ok(Components { storage, registry, facts, engine })
}

/// Jobs declared in settings, each reading its JSON file relative to `base_dir`.
pub fn jobs_from_settings(config: &AppConfig, base_dir: &Path) -> Result<Vec<Job>, PipelineError> {
    let mut jobs = Vec::with_capacity(config.jobs.len());
    for settings in &config.jobs {
        let mut stager = Stager::new(&settings.source_id, &settings.metric_id)
            .with_alignment(settings.alignment)
            .with_aggregation(settings.aggregation);
        if let Some(geo) = settings.default_geo.as_ref().or(config.default_geo.as_ref()) {
            stager = stager.with_default_geo(geo);
        }
        jobs.push(Job {
            label: settings.label(),
            stager,
            resolver: ManifestResolver::for_source(&config.markets, &settings.source_id),
            extractor: Box::new(JsonFileExtractor::new(base_dir.join(&settings.file), settings.window()?)),
        });
    }
    Ok(jobs)
}

/// Runs every job (extract, stage, upsert), then one recompute pass seeded with everything the jobs changed.
/// A failed job is reported and skipped; only configuration and storage-open errors abort the run.
pub async fn run_jobs(config: &AppConfig, jobs: Vec<Job>) -> Result<RunReport, PipelineError> {
    let components = open(config)?;
    let mut outcomes = Vec::with_capacity(jobs.len());
    let mut invalidated = InvalidationSet::default();

    for job in jobs {
        let (outcome, changed) = run_job(&components.facts, job.extractor.as_ref(), &job.stager, &job.resolver, &job.label).await?;
        if let Some(changed) = changed {
            invalidated.merge(&changed);
        }
        outcomes.push((job.label, outcome));
    }

    let engine = components.engine;
    let recompute = tokio::task::spawn_blocking(move || engine.recompute(&invalidated, false)).await??;
    let summary = log_summary(&components.facts)?;
    Ok(RunReport { jobs: outcomes, recompute, summary })
}

async fn run_job(
    facts: &FactStore,
    extractor: &dyn Extractor,
    stager: &Stager,
    resolver: &ManifestResolver,
    label: &str,
) -> Result<(JobOutcome, Option<InvalidationSet>), PipelineError> {
    info!("Job {} extracting from {}", label, extractor.name());
    let extraction = match extractor.extract().await {
        Ok(extraction) => extraction,
        Err(e) => {
            warn!("Job {} skipped: {}", label, e);
            return Ok((JobOutcome::ExtractionFailed(e), None));
        }
    };
    let staged = stager.stage(extraction, resolver);
    let report = staged.report;
    let batch = staged.batch;
    let store = facts.clone();
    match tokio::task::spawn_blocking(move || store.upsert(&batch)).await? {
        Ok(upserted) => {
            info!(
                "Job {} loaded {} rows (replaced {}, dropped {} unmapped, {} undated, {} duplicates)",
                label, upserted.inserted, upserted.deleted, report.dropped_unknown_geo, report.dropped_bad_date, report.duplicates
            );
            let outcome = JobOutcome::Loaded { stage: report, deleted: upserted.deleted, inserted: upserted.inserted };
            Ok((outcome, Some(upserted.invalidated)))
        }
        Err(e) => {
            error!("Job {} failed, store left unchanged: {}", label, e);
            Ok((JobOutcome::UpsertFailed(e), None))
        }
    }
}

pub fn log_summary(facts: &FactStore) -> Result<Vec<SeriesSummary>, PipelineError> {
    let summary = facts.summary()?;
    for s in &summary {
        info!("{:<24} {:<16} {} .. {} {:>6} rows", s.key.metric_id, s.key.geo_id, s.first, s.last, s.rows);
    }
    Ok(summary)
}

/// Recomputes every derived metric with `all`. Otherwise recomputes what earlier runs left pending
/// plus the derived metrics that hold no series yet (typically registered after their inputs were loaded).
pub fn recompute(config: &AppConfig, all: bool) -> Result<RecomputeReport, PipelineError> {
    let components = open(config)?;
    let seed = if all { InvalidationSet::default() } else { unmaterialized(&components)? };
    Ok(components.engine.recompute(&seed, all)?)
}

/// Invalidates the first input of each derived metric without stored series, over all its geographies.
fn unmaterialized(components: &Components) -> Result<InvalidationSet, PipelineError> {
    let graph = components.registry.dependency_graph()?;
    let mut seed = InvalidationSet::default();
    for metric_id in graph.order() {
        if !components.facts.geos_for(metric_id)?.is_empty() {
            continue;
        }
        let Some(first) = graph.definition(metric_id).and_then(|d| d.inputs.first()) else { continue };
        for geo_id in components.facts.geos_for(first)? {
            seed.insert(SeriesKey::new(&geo_id, first), DateSpan::full());
        }
    }
    if seed.is_empty() {
        info!("Every derived metric is materialized, only pending changes are recomputed");
    }
    Ok(seed)
}

pub fn summary(config: &AppConfig) -> Result<Vec<SeriesSummary>, PipelineError> {
    let components = open(config)?;
    log_summary(&components.facts)
}

pub fn read(config: &AppConfig, geo_id: &str, metric_id: &str, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Result<Vec<(NaiveDate, Option<f64>)>, PipelineError> {
    let components = open(config)?;
    if components.registry.metric(metric_id)?.is_none() {
        return Err(StoreError::UnknownMetric(metric_id.to_string()).into());
    }
    let full = DateSpan::full();
    let span = DateSpan::new(from.unwrap_or(full.start), to.unwrap_or(full.end))?;
    Ok(components.facts.read(geo_id, metric_id, span)?)
}

pub fn publish(config: &AppConfig) -> Result<SnapshotReport, PipelineError> {
    let components = open(config)?;
    snapshot::publish(&components.facts, &config.snapshot)
}

/// Loads settings from `config_path` and runs the configured jobs, resolving their files against
/// the current directory.
pub async fn launch(config_path: &str) -> Result<RunReport, PipelineError> {
    let config = AppConfig::new(config_path)?;
    let jobs = jobs_from_settings(&config, Path::new("."))?;
    info!("Launching {} jobs against {}", jobs.len(), config.store.db_path);
    let report = run_jobs(&config, jobs).await?;
    info!(
        "Run finished: {}/{} jobs loaded, {} derived series recomputed",
        report.loaded(), report.jobs.len(), report.recompute.recomputed.len()
    );
    Ok(report)
}
