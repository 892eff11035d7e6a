use crate::derived::DependencyGraph;
use crate::fact_store::{Batch, BatchOrigin, FactStore, InvalidationSet};
use crate::model::{DateSpan, DerivedDefinition, Observation, SeriesKey};
use crate::registry::DimensionRegistry;
use crate::{error, info, StoreError};
use chrono::NaiveDate;
use log::debug;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// No date is present in every input.
    EmptyJoin,
}

#[derive(Debug, Default)]
pub struct RecomputeReport {
    pub recomputed: Vec<SeriesKey>,
    pub skipped: Vec<(SeriesKey, SkipReason)>,
    pub failed: Vec<(SeriesKey, StoreError)>,
    /// Derived keys whose rows changed in this pass.
    pub invalidated: InvalidationSet,
}

/// Materializes derived metrics from their inputs, in dependency order.
pub struct DerivedMetricEngine {
    registry: DimensionRegistry,
    facts: FactStore,
    source_id: String,
}

impl DerivedMetricEngine {
    /// `source_id` is the provenance stamped on every derived observation and must be a registered source.
    pub fn new(registry: DimensionRegistry, facts: FactStore, source_id: &str) -> Self {
        Self { registry, facts, source_id: source_id.to_string() }
    }

    /// Recomputes every derived metric reachable from the invalidated keys and from the keys still
    /// pending in the store, or all of them when `force_all`. Each `(geo, metric)` is replaced over its
    /// whole history in its own transaction; changes are fed forward so metrics deriving from derived
    /// metrics see the new values in the same pass. Pending keys are cleared at the end, except the
    /// inputs of series that failed.
    pub fn recompute(&self, invalidated: &InvalidationSet, force_all: bool) -> Result<RecomputeReport, StoreError> {
        let graph = self.registry.dependency_graph()?;
        let mut report = RecomputeReport::default();
        let mut pending = self.facts.pending()?;
        if !pending.is_empty() {
            debug!("{} keys pending from earlier upserts", pending.len());
        }
        pending.merge(invalidated);
        if graph.is_empty() {
            self.facts.clear_pending(&pending)?;
            return Ok(report);
        }
        let targets: Vec<String> = if force_all { graph.order().to_vec() } else { graph.downstream_of(&pending.metrics()) };

        for metric_id in targets {
            let Some(definition) = graph.definition(&metric_id) else { continue };
            let geos = self.geos_to_recompute(definition, &pending, force_all)?;
            for geo_id in geos {
                let key = SeriesKey::new(&geo_id, &metric_id);
                match self.recompute_series(&key, definition) {
                    Ok(None) => {
                        info!("Skipping {key}: inputs {} share no dates", definition.inputs.join(", "));
                        report.skipped.push((key, SkipReason::EmptyJoin));
                    }
                    Ok(Some(changed)) => {
                        pending.merge(&changed);
                        report.invalidated.merge(&changed);
                        report.recomputed.push(key);
                    }
                    Err(e) => {
                        error!("Recompute of {key} failed: {e}");
                        report.failed.push((key, e));
                    }
                }
            }
        }
        let cleared = self.facts.clear_pending(&settled(&pending, &report.failed, &graph))?;
        info!(
            "Recompute pass: {} series recomputed, {} skipped, {} failed, {} pending keys settled",
            report.recomputed.len(), report.skipped.len(), report.failed.len(), cleared
        );
        Ok(report)
    }

    fn geos_to_recompute(&self, definition: &DerivedDefinition, pending: &InvalidationSet, force_all: bool) -> Result<BTreeSet<String>, StoreError> {
        if force_all {
            // inner join: a geography missing the first input yields nothing
            let first = definition.inputs.first().map(String::as_str).unwrap_or_default();
            Ok(self.facts.geos_for(first)?.into_iter().collect())
        } else {
            Ok(pending.geos_for(&definition.inputs))
        }
    }

    /// `Ok(None)` when the join is empty, otherwise the invalidations of the derived upsert.
    fn recompute_series(&self, key: &SeriesKey, definition: &DerivedDefinition) -> Result<Option<InvalidationSet>, StoreError> {
        let rows = self.join(&key.geo_id, definition)?;
        if rows.is_empty() {
            return Ok(None);
        }
        let mut batch = Batch::new(BatchOrigin::Derivation);
        batch.declare_span(key.clone(), DateSpan::full());
        for (date, value) in rows {
            batch.push(Observation::new(&key.geo_id, &key.metric_id, date, Some(value), &self.source_id));
        }
        let upserted = self.facts.upsert(&batch)?;
        debug!("{key}: {} rows replaced by {}", upserted.deleted, upserted.inserted);
        Ok(Some(upserted.invalidated))
    }

    /// Inner join of the inputs on date followed by the combinator. Dates where any input is absent
    /// or missing, or where the combinator has no finite result, produce no row.
    fn join(&self, geo_id: &str, definition: &DerivedDefinition) -> Result<Vec<(NaiveDate, f64)>, StoreError> {
        let mut columns: Vec<BTreeMap<NaiveDate, f64>> = Vec::with_capacity(definition.inputs.len());
        for input in &definition.inputs {
            let column: BTreeMap<NaiveDate, f64> = self
                .facts
                .read(geo_id, input, DateSpan::full())?
                .into_iter()
                .filter_map(|(date, value)| value.map(|v| (date, v)))
                .collect();
            if column.is_empty() {
                return Ok(Vec::new());
            }
            columns.push(column);
        }
        let Some((first, rest)) = columns.split_first() else {
            return Ok(Vec::new());
        };
        let mut rows = Vec::new();
        let mut values = Vec::with_capacity(columns.len());
        for (date, v) in first {
            values.clear();
            values.push(*v);
            for column in rest {
                match column.get(date) {
                    Some(v) => values.push(*v),
                    None => break,
                }
            }
            if values.len() == columns.len() {
                if let Some(out) = definition.combinator.apply(&values) {
                    rows.push((*date, out));
                }
            }
        }
        Ok(rows)
    }
}

/// Pending keys minus the inputs of failed series, which must be retried by a later pass.
fn settled(pending: &InvalidationSet, failed: &[(SeriesKey, StoreError)], graph: &DependencyGraph) -> InvalidationSet {
    let mut retry: BTreeSet<SeriesKey> = BTreeSet::new();
    for (key, _) in failed {
        for input in graph.definition(&key.metric_id).map(|d| d.inputs.as_slice()).unwrap_or_default() {
            retry.insert(SeriesKey::new(&key.geo_id, input));
        }
    }
    let mut out = InvalidationSet::default();
    for (key, span) in pending.iter().filter(|(key, _)| !retry.contains(*key)) {
        out.insert(key.clone(), *span);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derived::Combinator;
    use crate::model::{Frequency, Market, MarketType, Metric, Source};
    use crate::storage::Storage;
    use std::sync::Arc;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    fn setup(metrics: &[Metric]) -> (DerivedMetricEngine, FactStore) {
        let storage = Storage::temp("engine").unwrap();
        let registry = DimensionRegistry::new(Arc::clone(&storage));
        registry.ensure_market(&Market::new("us_national", "United States", MarketType::National, None)).unwrap();
        registry.ensure_source(&Source::new("fred", "FRED", "https://fred.stlouisfed.org/", "monthly", "public")).unwrap();
        registry.ensure_source(&Source::new("derived", "Derived", "", "on load", "internal")).unwrap();
        registry.ensure_metrics(metrics).unwrap();
        let facts = FactStore::new(storage);
        (DerivedMetricEngine::new(registry, facts.clone(), "derived"), facts)
    }

    fn load(facts: &FactStore, metric_id: &str, rows: &[(NaiveDate, f64)]) -> InvalidationSet {
        let mut batch = Batch::new(BatchOrigin::Extraction);
        for (date, value) in rows {
            batch.push(Observation::new("us_national", metric_id, *date, Some(*value), "fred"));
        }
        facts.upsert(&batch).unwrap().invalidated
    }

    fn base(id: &str) -> Metric {
        Metric::base(id, id, Frequency::Monthly, "percent", "yields")
    }

    fn spread_metrics() -> Vec<Metric> {
        vec![
            base("fred_gs10"),
            base("fred_gs2"),
            Metric::derived("spread_10y_2y", "10Y-2Y", Frequency::Monthly, "pp", "spreads", &["fred_gs10", "fred_gs2"], Combinator::Difference),
        ]
    }

    fn values(facts: &FactStore, metric_id: &str) -> Vec<(NaiveDate, f64)> {
        facts.read("us_national", metric_id, DateSpan::full()).unwrap().into_iter().map(|(d, v)| (d, v.unwrap())).collect()
    }

    #[test]
    fn spread_of_ten_and_two_year_yields() {
        let (engine, facts) = setup(&spread_metrics());
        let mut inv = load(&facts, "fred_gs10", &[(d(2024, 1, 1), 4.0), (d(2024, 2, 1), 4.2)]);
        inv.merge(&load(&facts, "fred_gs2", &[(d(2024, 1, 1), 4.5), (d(2024, 2, 1), 4.6)]));

        let report = engine.recompute(&inv, false).unwrap();
        assert_eq!(report.recomputed, vec![SeriesKey::new("us_national", "spread_10y_2y")]);
        let spread = values(&facts, "spread_10y_2y");
        assert_eq!(spread.len(), 2);
        assert_eq!(spread[0].0, d(2024, 1, 1));
        assert!((spread[0].1 - -0.5).abs() < 1e-9);
        assert_eq!(spread[1].0, d(2024, 2, 1));
        assert!((spread[1].1 - -0.4).abs() < 1e-9);
    }

    #[test]
    fn dates_missing_from_one_input_produce_no_row() {
        let (engine, facts) = setup(&spread_metrics());
        let mut inv = load(&facts, "fred_gs10", &[(d(2024, 1, 1), 4.5), (d(2024, 2, 1), 4.2)]);
        inv.merge(&load(&facts, "fred_gs2", &[(d(2024, 2, 1), 4.6)]));
        engine.recompute(&inv, false).unwrap();
        let spread = values(&facts, "spread_10y_2y");
        assert_eq!(spread.iter().map(|(d, _)| *d).collect::<Vec<_>>(), vec![d(2024, 2, 1)]);
    }

    #[test]
    fn empty_join_is_skipped_not_failed() {
        let (engine, facts) = setup(&spread_metrics());
        let inv = load(&facts, "fred_gs10", &[(d(2024, 1, 1), 4.0)]);
        let report = engine.recompute(&inv, false).unwrap();
        assert_eq!(report.skipped, vec![(SeriesKey::new("us_national", "spread_10y_2y"), SkipReason::EmptyJoin)]);
        assert!(report.failed.is_empty());
        assert!(facts.read("us_national", "spread_10y_2y", DateSpan::full()).unwrap().is_empty());
    }

    #[test]
    fn chained_metrics_recompute_in_dependency_order() {
        // c = b + z, b = a - z: c must see the b written in the same pass
        let metrics = vec![
            base("a"),
            base("z"),
            Metric::derived("c", "c", Frequency::Monthly, "pp", "test", &["b", "z"], Combinator::Sum),
            Metric::derived("b", "b", Frequency::Monthly, "pp", "test", &["a", "z"], Combinator::Difference),
        ];
        let (engine, facts) = setup(&metrics);
        let mut inv = load(&facts, "a", &[(d(2024, 1, 1), 10.0)]);
        inv.merge(&load(&facts, "z", &[(d(2024, 1, 1), 1.0)]));
        engine.recompute(&inv, false).unwrap();
        assert_eq!(values(&facts, "b"), vec![(d(2024, 1, 1), 9.0)]);
        assert_eq!(values(&facts, "c"), vec![(d(2024, 1, 1), 10.0)]);

        // only `a` changes; c still follows through b
        let inv = load(&facts, "a", &[(d(2024, 1, 1), 20.0)]);
        let report = engine.recompute(&inv, false).unwrap();
        assert_eq!(report.recomputed.len(), 2);
        assert_eq!(values(&facts, "b"), vec![(d(2024, 1, 1), 19.0)]);
        assert_eq!(values(&facts, "c"), vec![(d(2024, 1, 1), 20.0)]);
    }

    #[test]
    fn unchanged_inputs_recompute_without_invalidating() {
        let (engine, facts) = setup(&spread_metrics());
        let mut inv = load(&facts, "fred_gs10", &[(d(2024, 1, 1), 4.0)]);
        inv.merge(&load(&facts, "fred_gs2", &[(d(2024, 1, 1), 4.5)]));
        assert!(!engine.recompute(&inv, false).unwrap().invalidated.is_empty());
        let again = engine.recompute(&inv, false).unwrap();
        assert!(again.invalidated.is_empty());
        assert_eq!(facts.read("us_national", "spread_10y_2y", DateSpan::full()).unwrap().len(), 1);
    }

    #[test]
    fn force_all_recomputes_settled_series() {
        let (engine, facts) = setup(&spread_metrics());
        load(&facts, "fred_gs10", &[(d(2024, 1, 1), 4.0)]);
        load(&facts, "fred_gs2", &[(d(2024, 1, 1), 4.5)]);
        let nothing = InvalidationSet::default();
        // the loads are still pending in the store
        assert_eq!(engine.recompute(&nothing, false).unwrap().recomputed.len(), 1);
        assert!(engine.recompute(&nothing, false).unwrap().recomputed.is_empty());
        assert_eq!(engine.recompute(&nothing, true).unwrap().recomputed.len(), 1);
    }

    #[test]
    fn revision_left_by_an_interrupted_run_is_recomputed_later() {
        let (engine, facts) = setup(&spread_metrics());
        let mut inv = load(&facts, "fred_gs10", &[(d(2024, 1, 1), 4.0)]);
        inv.merge(&load(&facts, "fred_gs2", &[(d(2024, 1, 1), 4.5)]));
        engine.recompute(&inv, false).unwrap();
        assert_eq!(values(&facts, "spread_10y_2y"), vec![(d(2024, 1, 1), -0.5)]);

        // revised input committed, then the process stops before recomputing
        load(&facts, "fred_gs2", &[(d(2024, 1, 1), 3.0)]);
        let rerun = load(&facts, "fred_gs2", &[(d(2024, 1, 1), 3.0)]);
        assert!(rerun.is_empty());

        let report = engine.recompute(&rerun, false).unwrap();
        assert_eq!(report.recomputed, vec![SeriesKey::new("us_national", "spread_10y_2y")]);
        assert_eq!(values(&facts, "spread_10y_2y"), vec![(d(2024, 1, 1), 1.0)]);
        assert!(facts.pending().unwrap().is_empty());
    }

    #[test]
    fn failed_series_keep_their_inputs_pending() {
        let (engine, facts) = setup(&spread_metrics());
        let unstamped = DerivedMetricEngine::new(engine.registry.clone(), facts.clone(), "unregistered");
        let mut inv = load(&facts, "fred_gs10", &[(d(2024, 1, 1), 4.0)]);
        inv.merge(&load(&facts, "fred_gs2", &[(d(2024, 1, 1), 4.5)]));

        let report = unstamped.recompute(&inv, false).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(facts.pending().unwrap().contains("us_national", "fred_gs2"));

        engine.recompute(&InvalidationSet::default(), false).unwrap();
        assert_eq!(values(&facts, "spread_10y_2y"), vec![(d(2024, 1, 1), -0.5)]);
        assert!(facts.pending().unwrap().is_empty());
    }

    #[test]
    fn ratio_by_zero_yields_no_row() {
        let metrics = vec![
            base("a"),
            base("b"),
            Metric::derived("r", "r", Frequency::Monthly, "ratio", "test", &["a", "b"], Combinator::Ratio),
        ];
        let (engine, facts) = setup(&metrics);
        let mut inv = load(&facts, "a", &[(d(2024, 1, 1), 1.0), (d(2024, 2, 1), 3.0)]);
        inv.merge(&load(&facts, "b", &[(d(2024, 1, 1), 0.0), (d(2024, 2, 1), 2.0)]));
        engine.recompute(&inv, false).unwrap();
        assert_eq!(values(&facts, "r"), vec![(d(2024, 2, 1), 1.5)]);
    }
}
