//! The single time-series fact table and its span-replacing upsert.
//!
//! An upsert is one redb write transaction: for every `(geo_id, metric_id)` key of a batch it
//! deletes the stored observations inside the key's span, inserts the batch rows and commits.
//! Any failure aborts the transaction so readers only ever see the pre-batch or post-batch state.
//! Keys whose rows changed are also recorded in the pending table by that same transaction and stay
//! there until a recompute pass settles them, so a crash between upsert and recompute loses nothing.

use crate::codec::{date_of, day_of};
use crate::model::{DateSpan, Market, Metric, MetricKind, Observation, SeriesKey, Source};
use crate::storage::{FactRow, Storage, FACTS, MARKETS, METRICS, PENDING, SERIES_BY_METRIC, SOURCES};
use crate::{error, StoreError};
use chrono::NaiveDate;
use log::debug;
use redb::{ReadTransaction, ReadableMultimapTable, ReadableTable, WriteTransaction};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Who produced a batch; base metrics accept only extracted batches, derived metrics only derived ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOrigin {
    Extraction,
    Derivation,
}

impl BatchOrigin {
    fn label(&self) -> &'static str {
        match self {
            BatchOrigin::Extraction => "extraction",
            BatchOrigin::Derivation => "derivation",
        }
    }

    fn accepts(&self, kind: &MetricKind) -> bool {
        matches!((self, kind), (BatchOrigin::Extraction, MetricKind::Base) | (BatchOrigin::Derivation, MetricKind::Derived(_)))
    }
}

/// Normalized observations submitted together, with the span each key claims.
#[derive(Debug, Clone)]
pub struct Batch {
    origin: BatchOrigin,
    observations: Vec<Observation>,
    declared: BTreeMap<SeriesKey, DateSpan>,
}

impl Batch {
    pub fn new(origin: BatchOrigin) -> Self {
        Self { origin, observations: Vec::new(), declared: BTreeMap::new() }
    }

    pub fn origin(&self) -> BatchOrigin {
        self.origin
    }

    pub fn push(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    /// Claims `span` for `key` even where the batch carries no rows, so the upsert deletes
    /// whatever is stored there. Repeated declarations widen the span.
    pub fn declare_span(&mut self, key: SeriesKey, span: DateSpan) {
        self.declared
            .entry(key)
            .and_modify(|s| *s = s.union(&span))
            .or_insert(span);
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty() && self.declared.is_empty()
    }

    /// Effective span per key: the declared span widened to cover every row of the key.
    pub fn spans(&self) -> BTreeMap<SeriesKey, DateSpan> {
        let mut spans = self.declared.clone();
        for obs in &self.observations {
            spans
                .entry(obs.key())
                .and_modify(|s| *s = s.union(&DateSpan::day(obs.date)))
                .or_insert(DateSpan::day(obs.date));
        }
        spans
    }
}

/// Keys whose stored rows changed, with the date span touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationSet {
    entries: BTreeMap<SeriesKey, DateSpan>,
}

impl InvalidationSet {
    pub fn insert(&mut self, key: SeriesKey, span: DateSpan) {
        self.entries
            .entry(key)
            .and_modify(|s| *s = s.union(&span))
            .or_insert(span);
    }

    pub fn merge(&mut self, other: &InvalidationSet) {
        for (key, span) in &other.entries {
            self.insert(key.clone(), *span);
        }
    }

    pub fn contains(&self, geo_id: &str, metric_id: &str) -> bool {
        self.entries.contains_key(&SeriesKey::new(geo_id, metric_id))
    }

    pub fn span(&self, key: &SeriesKey) -> Option<DateSpan> {
        self.entries.get(key).copied()
    }

    pub fn metrics(&self) -> BTreeSet<String> {
        self.entries.keys().map(|k| k.metric_id.clone()).collect()
    }

    /// Geographies with an invalidated series of any of the given metrics.
    pub fn geos_for<'a, I: IntoIterator<Item = &'a String>>(&self, metric_ids: I) -> BTreeSet<String> {
        let wanted: BTreeSet<&String> = metric_ids.into_iter().collect();
        self.entries.keys().filter(|k| wanted.contains(&k.metric_id)).map(|k| k.geo_id.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SeriesKey, &DateSpan)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct UpsertReport {
    pub deleted: usize,
    pub inserted: usize,
    pub invalidated: InvalidationSet,
}

/// First date, last date and row count of one stored series.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesSummary {
    pub key: SeriesKey,
    pub first: NaiveDate,
    pub last: NaiveDate,
    pub rows: usize,
}

/// Dimensions and facts read from one transaction, so they describe a single committed state.
#[derive(Debug, Clone, Default)]
pub struct StoreContents {
    pub markets: Vec<Market>,
    pub sources: Vec<Source>,
    pub metrics: Vec<Metric>,
    pub observations: Vec<Observation>,
}

#[derive(Clone)]
pub struct FactStore {
    storage: Arc<Storage>,
}

impl FactStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Applies the batch atomically. Any failure inside the transaction is reported as
    /// `UpsertTransaction` and leaves the store in its pre-batch state.
    pub fn upsert(&self, batch: &Batch) -> Result<UpsertReport, StoreError> {
        if batch.is_empty() {
            return Ok(UpsertReport::default());
        }
        let tx = self.storage.begin_write().map_err(|e| StoreError::UpsertTransaction(Box::new(e)))?;
        match Self::apply(&tx, batch) {
            Ok(report) => {
                tx.commit().map_err(|e| StoreError::UpsertTransaction(Box::new(e.into())))?;
                debug!("upsert committed: {} deleted, {} inserted, {} keys invalidated", report.deleted, report.inserted, report.invalidated.len());
                Ok(report)
            }
            Err(e) => {
                error!("Upsert of {} rows ({}) rolled back: {}", batch.len(), batch.origin().label(), e);
                if let Err(abort_err) = tx.abort() {
                    error!("Abort failed: {}", abort_err);
                }
                Err(StoreError::UpsertTransaction(Box::new(e)))
            }
        }
    }

    fn apply(tx: &WriteTransaction, batch: &Batch) -> Result<UpsertReport, StoreError> {
        let markets = tx.open_table(MARKETS)?;
        let sources = tx.open_table(SOURCES)?;
        let metrics = tx.open_table(METRICS)?;
        let mut facts = tx.open_table(FACTS)?;
        let mut series_index = tx.open_multimap_table(SERIES_BY_METRIC)?;
        let mut pending = tx.open_table(PENDING)?;

        let mut rows_by_key: BTreeMap<SeriesKey, BTreeMap<i32, FactRow>> = BTreeMap::new();
        let mut known_sources: BTreeSet<&str> = BTreeSet::new();
        for obs in batch.observations() {
            if !known_sources.contains(obs.source_id.as_str()) {
                if sources.get(obs.source_id.as_str())?.is_none() {
                    return Err(StoreError::UnknownSource(obs.source_id.clone()));
                }
                known_sources.insert(obs.source_id.as_str());
            }
            // later rows of the same cell win
            rows_by_key
                .entry(obs.key())
                .or_default()
                .insert(day_of(obs.date), FactRow { value: obs.value.filter(|v| v.is_finite()), source_id: obs.source_id.clone() });
        }

        let mut report = UpsertReport::default();
        for (key, span) in batch.spans() {
            let metric = metrics
                .get(key.metric_id.as_str())?
                .map(|g| g.value())
                .ok_or_else(|| StoreError::UnknownMetric(key.metric_id.clone()))?;
            if !batch.origin().accepts(&metric.kind) {
                return Err(StoreError::KindMismatch { metric_id: key.metric_id.clone(), kind: metric.kind.label(), origin: batch.origin().label() });
            }
            if markets.get(key.geo_id.as_str())?.is_none() {
                return Err(StoreError::UnknownGeography(key.geo_id.clone()));
            }

            let (geo, metric_id) = (key.geo_id.as_str(), key.metric_id.as_str());
            let lo = (geo, metric_id, day_of(span.start));
            let hi = (geo, metric_id, day_of(span.end));
            let mut previous: BTreeMap<i32, FactRow> = BTreeMap::new();
            for entry in facts.range(lo..=hi)? {
                let (k, v) = entry?;
                previous.insert(k.value().2, v.value());
            }
            for day in previous.keys() {
                facts.remove((geo, metric_id, *day))?;
            }

            let incoming = rows_by_key.remove(&key).unwrap_or_default();
            for (day, row) in &incoming {
                facts.insert((geo, metric_id, *day), row)?;
            }

            let still_present = !incoming.is_empty() || facts.range((geo, metric_id, i32::MIN)..=(geo, metric_id, i32::MAX))?.next().transpose()?.is_some();
            if still_present {
                series_index.insert(metric_id, geo)?;
            } else {
                series_index.remove(metric_id, geo)?;
            }

            debug!("{key} span {span}: replaced {} rows with {}", previous.len(), incoming.len());
            report.deleted += previous.len();
            report.inserted += incoming.len();
            if previous != incoming {
                let (first, last) = (day_of(span.start), day_of(span.end));
                let widened = match pending.get((geo, metric_id))?.map(|g| g.value()) {
                    Some((p_first, p_last)) => (p_first.min(first), p_last.max(last)),
                    None => (first, last),
                };
                pending.insert((geo, metric_id), widened)?;
                report.invalidated.insert(key, span);
            }
        }
        Ok(report)
    }

    /// Observations of one series inside `span`, ascending by date, without gap filling.
    pub fn read(&self, geo_id: &str, metric_id: &str, span: DateSpan) -> Result<Vec<(NaiveDate, Option<f64>)>, StoreError> {
        let tx = self.storage.begin_read()?;
        let facts = tx.open_table(FACTS)?;
        let mut out = Vec::new();
        for entry in facts.range((geo_id, metric_id, day_of(span.start))..=(geo_id, metric_id, day_of(span.end)))? {
            let (k, v) = entry?;
            out.push((date_of(k.value().2)?, v.value().value));
        }
        Ok(out)
    }

    pub fn read_observations(&self, geo_id: &str, metric_id: &str, span: DateSpan) -> Result<Vec<Observation>, StoreError> {
        let tx = self.storage.begin_read()?;
        let facts = tx.open_table(FACTS)?;
        let mut out = Vec::new();
        for entry in facts.range((geo_id, metric_id, day_of(span.start))..=(geo_id, metric_id, day_of(span.end)))? {
            let (k, v) = entry?;
            let row = v.value();
            out.push(Observation::new(geo_id, metric_id, date_of(k.value().2)?, row.value, &row.source_id));
        }
        Ok(out)
    }

    /// Keys changed by committed upserts that no recompute pass has settled yet.
    pub fn pending(&self) -> Result<InvalidationSet, StoreError> {
        let tx = self.storage.begin_read()?;
        let table = tx.open_table(PENDING)?;
        let mut out = InvalidationSet::default();
        for entry in table.iter()? {
            let (k, v) = entry?;
            let (geo, metric) = k.value();
            let (first, last) = v.value();
            out.insert(SeriesKey::new(geo, metric), DateSpan::new(date_of(first)?, date_of(last)?)?);
        }
        Ok(out)
    }

    /// Removes pending keys whose stored span lies within the settled span. A key widened by an
    /// upsert after `settled` was read stays pending. Returns how many keys were removed.
    pub fn clear_pending(&self, settled: &InvalidationSet) -> Result<usize, StoreError> {
        if settled.is_empty() {
            return Ok(0);
        }
        let tx = self.storage.begin_write()?;
        let mut cleared = 0;
        {
            let mut table = tx.open_table(PENDING)?;
            for (key, span) in settled.iter() {
                let k = (key.geo_id.as_str(), key.metric_id.as_str());
                let stored = table.get(k)?.map(|g| g.value());
                if stored.is_some_and(|(first, last)| day_of(span.start) <= first && last <= day_of(span.end)) {
                    table.remove(k)?;
                    cleared += 1;
                }
            }
        }
        tx.commit()?;
        Ok(cleared)
    }

    /// Geographies holding a non-empty series of the metric.
    pub fn geos_for(&self, metric_id: &str) -> Result<Vec<String>, StoreError> {
        let tx = self.storage.begin_read()?;
        let index = tx.open_multimap_table(SERIES_BY_METRIC)?;
        let mut out = Vec::new();
        for geo in index.get(metric_id)? {
            out.push(geo?.value().to_string());
        }
        Ok(out)
    }

    /// Full-table read in key order, optionally only dates on or after `since`.
    /// This is the boundary the snapshot publisher copies from.
    pub fn scan(&self, since: Option<NaiveDate>) -> Result<Vec<Observation>, StoreError> {
        let tx = self.storage.begin_read()?;
        Self::scan_in(&tx, since)
    }

    /// Every dimension plus the facts dated on or after `since`, all from one read transaction.
    pub fn contents(&self, since: Option<NaiveDate>) -> Result<StoreContents, StoreError> {
        let tx = self.storage.begin_read()?;
        let markets = tx.open_table(MARKETS)?.iter()?.map(|e| -> Result<Market, StoreError> { Ok(e?.1.value()) }).collect::<Result<Vec<_>, _>>()?;
        let sources = tx.open_table(SOURCES)?.iter()?.map(|e| -> Result<Source, StoreError> { Ok(e?.1.value()) }).collect::<Result<Vec<_>, _>>()?;
        let metrics = tx.open_table(METRICS)?.iter()?.map(|e| -> Result<Metric, StoreError> { Ok(e?.1.value()) }).collect::<Result<Vec<_>, _>>()?;
        let observations = Self::scan_in(&tx, since)?;
        Ok(StoreContents { markets, sources, metrics, observations })
    }

    fn scan_in(tx: &ReadTransaction, since: Option<NaiveDate>) -> Result<Vec<Observation>, StoreError> {
        let facts = tx.open_table(FACTS)?;
        let min_day = since.map(day_of);
        let mut out = Vec::new();
        for entry in facts.iter()? {
            let (k, v) = entry?;
            let (geo, metric, day) = k.value();
            if min_day.is_some_and(|m| day < m) {
                continue;
            }
            let row = v.value();
            out.push(Observation::new(geo, metric, date_of(day)?, row.value, &row.source_id));
        }
        Ok(out)
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        use redb::ReadableTableMetadata;
        let tx = self.storage.begin_read()?;
        let facts = tx.open_table(FACTS)?;
        let n = facts.len()?;
        Ok(n)
    }

    pub fn summary(&self) -> Result<Vec<SeriesSummary>, StoreError> {
        let tx = self.storage.begin_read()?;
        let facts = tx.open_table(FACTS)?;
        let mut out: Vec<SeriesSummary> = Vec::new();
        for entry in facts.iter()? {
            let (k, _) = entry?;
            let (geo, metric, day) = k.value();
            let date = date_of(day)?;
            match out.last_mut() {
                Some(s) if s.key.geo_id == geo && s.key.metric_id == metric => {
                    s.last = date;
                    s.rows += 1;
                }
                _ => out.push(SeriesSummary { key: SeriesKey::new(geo, metric), first: date, last: date, rows: 1 }),
            }
        }
        Ok(out)
    }
}
