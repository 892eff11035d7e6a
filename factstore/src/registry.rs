//! Idempotent seeding of the reference dimensions: markets, sources and metric definitions.

use crate::derived::DependencyGraph;
use crate::model::{Market, Metric, Source};
use crate::storage::{Storage, MARKETS, METRICS, SOURCES};
use crate::{info, StoreError};
use redb::ReadableTable;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistrationReport {
    pub inserted: Vec<String>,
    pub existing: Vec<String>,
}

#[derive(Clone)]
pub struct DimensionRegistry {
    storage: Arc<Storage>,
}

impl DimensionRegistry {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Inserts the market unless one with the same `geo_id` exists, returns whether it was inserted.
    pub fn ensure_market(&self, market: &Market) -> Result<bool, StoreError> {
        require_id("market geo_id", &market.geo_id)?;
        let tx = self.storage.begin_write()?;
        let inserted = {
            let mut table = tx.open_table(MARKETS)?;
            let exists = table.get(market.geo_id.as_str())?.is_some();
            if !exists {
                table.insert(market.geo_id.as_str(), market)?;
            }
            !exists
        };
        tx.commit()?;
        Ok(inserted)
    }

    /// Inserts the source unless one with the same `source_id` exists, returns whether it was inserted.
    pub fn ensure_source(&self, source: &Source) -> Result<bool, StoreError> {
        require_id("source_id", &source.source_id)?;
        let tx = self.storage.begin_write()?;
        let inserted = {
            let mut table = tx.open_table(SOURCES)?;
            let exists = table.get(source.source_id.as_str())?.is_some();
            if !exists {
                table.insert(source.source_id.as_str(), source)?;
            }
            !exists
        };
        tx.commit()?;
        Ok(inserted)
    }

    pub fn ensure_metric(&self, metric: &Metric) -> Result<bool, StoreError> {
        let report = self.ensure_metrics(std::slice::from_ref(metric))?;
        Ok(!report.inserted.is_empty())
    }

    /// Registers metrics as one unit: either every new metric is inserted or, on any
    /// `ConfigurationError` (kind conflict, changed definition, unknown input, cycle), none is.
    pub fn ensure_metrics(&self, metrics: &[Metric]) -> Result<RegistrationReport, StoreError> {
        let mut candidates: BTreeMap<&str, &Metric> = BTreeMap::new();
        for metric in metrics {
            require_id("metric_id", &metric.metric_id)?;
            if let Some(previous) = candidates.insert(metric.metric_id.as_str(), metric) {
                if previous.kind != metric.kind {
                    return Err(StoreError::config(format!("metric {} declared twice with different definitions", metric.metric_id)));
                }
            }
        }

        let tx = self.storage.begin_write()?;
        let report = {
            let mut table = tx.open_table(METRICS)?;
            let mut registered: BTreeMap<String, Metric> = BTreeMap::new();
            for entry in table.iter()? {
                let (k, v) = entry?;
                registered.insert(k.value().to_string(), v.value());
            }

            let mut report = RegistrationReport::default();
            for (id, candidate) in &candidates {
                match registered.get(*id) {
                    Some(existing) if existing.kind.label() != candidate.kind.label() => {
                        return Err(StoreError::config(format!(
                            "metric {} is registered as {} and cannot be re-registered as {}",
                            id, existing.kind.label(), candidate.kind.label()
                        )));
                    }
                    Some(existing) if existing.kind != candidate.kind => {
                        return Err(StoreError::config(format!("metric {} is registered with a different derived definition", id)));
                    }
                    Some(_) => report.existing.push(id.to_string()),
                    None => report.inserted.push(id.to_string()),
                }
            }
            for id in &report.inserted {
                registered.insert(id.clone(), candidates[id.as_str()].clone());
            }

            let all: Vec<Metric> = registered.into_values().collect();
            DependencyGraph::build(&all)?;

            for id in &report.inserted {
                table.insert(id.as_str(), candidates[id.as_str()])?;
            }
            report
        };
        tx.commit()?;
        if !report.inserted.is_empty() {
            info!("Registered metrics: {}", report.inserted.join(", "));
        }
        Ok(report)
    }

    pub fn market(&self, geo_id: &str) -> Result<Option<Market>, StoreError> {
        let tx = self.storage.begin_read()?;
        let table = tx.open_table(MARKETS)?;
        let found = table.get(geo_id)?.map(|g| g.value());
        Ok(found)
    }

    pub fn source(&self, source_id: &str) -> Result<Option<Source>, StoreError> {
        let tx = self.storage.begin_read()?;
        let table = tx.open_table(SOURCES)?;
        let found = table.get(source_id)?.map(|g| g.value());
        Ok(found)
    }

    pub fn metric(&self, metric_id: &str) -> Result<Option<Metric>, StoreError> {
        let tx = self.storage.begin_read()?;
        let table = tx.open_table(METRICS)?;
        let found = table.get(metric_id)?.map(|g| g.value());
        Ok(found)
    }

    pub fn markets(&self) -> Result<Vec<Market>, StoreError> {
        let tx = self.storage.begin_read()?;
        let table = tx.open_table(MARKETS)?;
        let rows = table.iter()?.map(|e| -> Result<Market, StoreError> { Ok(e?.1.value()) }).collect();
        rows
    }

    pub fn sources(&self) -> Result<Vec<Source>, StoreError> {
        let tx = self.storage.begin_read()?;
        let table = tx.open_table(SOURCES)?;
        let rows = table.iter()?.map(|e| -> Result<Source, StoreError> { Ok(e?.1.value()) }).collect();
        rows
    }

    pub fn metrics(&self) -> Result<Vec<Metric>, StoreError> {
        let tx = self.storage.begin_read()?;
        let table = tx.open_table(METRICS)?;
        let rows = table.iter()?.map(|e| -> Result<Metric, StoreError> { Ok(e?.1.value()) }).collect();
        rows
    }

    pub fn dependency_graph(&self) -> Result<DependencyGraph, StoreError> {
        DependencyGraph::build(&self.metrics()?)
    }
}

fn require_id(what: &str, id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() || id.trim() != id {
        Err(StoreError::config(format!("{what} `{id}` must be non-empty without surrounding whitespace")))
    } else {
        Ok(())
    }
}
