//! Publishes a compacted, read-only copy of the store for downstream consumers.

use crate::err::PipelineError;
use crate::settings::SnapshotSettings;
use factstore::{info, warn, Batch, BatchOrigin, DimensionRegistry, FactStore, StoreContents, Storage};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SnapshotReport {
    pub path: PathBuf,
    pub markets: usize,
    pub sources: usize,
    pub metrics: usize,
    pub observations: usize,
    pub size_mb: f64,
}

/// Replaces the snapshot file with a copy of every dimension and of the facts dated on or after
/// `min_date`, compacts it and enforces the size limit. An oversized snapshot is left in place
/// for inspection and reported as an error. Everything copied comes from one read transaction.
pub fn publish(facts: &FactStore, settings: &SnapshotSettings) -> Result<SnapshotReport, PipelineError> {
    let path = PathBuf::from(&settings.path);
    if path.exists() {
        info!("Removing previous snapshot {:?}", path);
        fs::remove_file(&path)?;
    }

    let StoreContents { markets, sources, metrics, observations } = facts.contents(settings.min_date)?;

    let storage = Arc::new(Storage::open(&path, 64)?);
    {
        let snapshot_registry = DimensionRegistry::new(Arc::clone(&storage));
        for market in &markets {
            snapshot_registry.ensure_market(market)?;
        }
        for source in &sources {
            snapshot_registry.ensure_source(source)?;
        }
        snapshot_registry.ensure_metrics(&metrics)?;

        let derived: BTreeSet<&str> = metrics.iter().filter(|m| m.is_derived()).map(|m| m.metric_id.as_str()).collect();
        let mut base_batch = Batch::new(BatchOrigin::Extraction);
        let mut derived_batch = Batch::new(BatchOrigin::Derivation);
        for obs in &observations {
            if derived.contains(obs.metric_id.as_str()) {
                derived_batch.push(obs.clone());
            } else {
                base_batch.push(obs.clone());
            }
        }
        let snapshot_facts = FactStore::new(Arc::clone(&storage));
        snapshot_facts.upsert(&base_batch)?;
        snapshot_facts.upsert(&derived_batch)?;
        // copied derived rows are already current
        snapshot_facts.clear_pending(&snapshot_facts.pending()?)?;
    }

    let mut storage = Arc::try_unwrap(storage).map_err(|_| PipelineError::new("snapshot store is still shared"))?;
    storage.compact()?;
    drop(storage);

    let size_mb = file_size_mb(&path)?;
    let report = SnapshotReport {
        path: path.clone(),
        markets: markets.len(),
        sources: sources.len(),
        metrics: metrics.len(),
        observations: observations.len(),
        size_mb,
    };
    check_size(size_mb, settings)?;
    info!(
        "Published snapshot {:?}: {} markets, {} sources, {} metrics, {} observations, {:.2} MB",
        report.path, report.markets, report.sources, report.metrics, report.observations, report.size_mb
    );
    Ok(report)
}

fn file_size_mb(path: &Path) -> Result<f64, PipelineError> {
    Ok(fs::metadata(path)?.len() as f64 / (1024.0 * 1024.0))
}

fn check_size(size_mb: f64, settings: &SnapshotSettings) -> Result<(), PipelineError> {
    let max_mb = settings.max_mb as f64;
    if size_mb > max_mb {
        return Err(PipelineError::SnapshotTooLarge { size_mb, max_mb: settings.max_mb });
    }
    if size_mb > max_mb * settings.warn_ratio {
        warn!("Snapshot is {:.1} MB, above {:.0}% of the {} MB limit", size_mb, settings.warn_ratio * 100.0, settings.max_mb);
    }
    Ok(())
}
