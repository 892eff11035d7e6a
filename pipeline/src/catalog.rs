//! Static dimension catalog: the configured markets, sources and metric definitions, validated
//! before any storage is opened.

use crate::settings::{AppConfig, MetricSettings};
use factstore::{Combinator, DependencyGraph, DimensionRegistry, Market, Metric, Source, StoreError};
use std::collections::BTreeSet;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct Catalog {
    pub markets: Vec<Market>,
    pub sources: Vec<Source>,
    pub metrics: Vec<Metric>,
}

impl Catalog {
    pub fn from_settings(config: &AppConfig) -> Result<Self, StoreError> {
        let markets: Vec<Market> = config
            .markets
            .iter()
            .map(|m| Market::new(&m.geo_id, &m.name, m.market_type, m.fips.as_deref()))
            .collect();
        unique("geo_id", markets.iter().map(|m| m.geo_id.as_str()))?;

        let mut sources = config.sources.clone();
        let derived_source = &config.store.derived_source_id;
        if !sources.iter().any(|s| &s.source_id == derived_source) {
            sources.push(Source::new(derived_source, "Derived metrics", "", "on load", "internal"));
        }
        unique("source_id", sources.iter().map(|s| s.source_id.as_str()))?;

        let metrics = config.metrics.iter().map(metric_of).collect::<Result<Vec<_>, _>>()?;
        unique("metric_id", metrics.iter().map(|m| m.metric_id.as_str()))?;
        DependencyGraph::build(&metrics)?;

        let defaults = config.default_geo.iter().chain(config.jobs.iter().filter_map(|j| j.default_geo.as_ref()));
        for default_geo in defaults {
            if !markets.iter().any(|m| &m.geo_id == default_geo) {
                return Err(StoreError::config(format!("default_geo {default_geo} is not a configured market")));
            }
        }
        for job in &config.jobs {
            if !sources.iter().any(|s| s.source_id == job.source_id) {
                return Err(StoreError::config(format!("job {} refers to unknown source", job.label())));
            }
            match metrics.iter().find(|m| m.metric_id == job.metric_id) {
                Some(m) if m.is_derived() => return Err(StoreError::config(format!("job {} loads derived metric", job.label()))),
                Some(_) => {}
                None => return Err(StoreError::config(format!("job {} refers to unknown metric", job.label()))),
            }
            job.window()?;
        }
        Ok(Self { markets, sources, metrics })
    }

    /// Idempotent; safe on every start.
    pub fn seed(&self, registry: &DimensionRegistry) -> Result<(), StoreError> {
        let mut new_markets = 0;
        for market in &self.markets {
            new_markets += registry.ensure_market(market)? as usize;
        }
        let mut new_sources = 0;
        for source in &self.sources {
            new_sources += registry.ensure_source(source)? as usize;
        }
        let report = registry.ensure_metrics(&self.metrics)?;
        log::debug!(
            "seeded {} new markets, {} new sources, {} new metrics ({} already registered)",
            new_markets, new_sources, report.inserted.len(), report.existing.len()
        );
        Ok(())
    }
}

fn metric_of(settings: &MetricSettings) -> Result<Metric, StoreError> {
    match &settings.combine {
        None if settings.inputs.is_empty() => Ok(Metric::base(&settings.metric_id, &settings.name, settings.frequency, &settings.unit, &settings.category)),
        None => Err(StoreError::config(format!("metric {} lists inputs without a combining function", settings.metric_id))),
        Some(name) => {
            let combinator = Combinator::from_str(name)?;
            let inputs: Vec<&str> = settings.inputs.iter().map(String::as_str).collect();
            Ok(Metric::derived(&settings.metric_id, &settings.name, settings.frequency, &settings.unit, &settings.category, &inputs, combinator))
        }
    }
}

fn unique<'a>(what: &str, ids: impl Iterator<Item = &'a str>) -> Result<(), StoreError> {
    let mut seen = BTreeSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(StoreError::config(format!("duplicate {what} {id}")));
        }
    }
    Ok(())
}
