//! Normalizes raw extracted rows into a [`Batch`] of registered geographies and calendar dates.

use crate::fact_store::{Batch, BatchOrigin};
use crate::model::{DateSpan, Observation, SeriesKey};
use crate::resample::{aggregate_monthly, Aggregation, DateAlignment};
use crate::warn;
use chrono::{DateTime, NaiveDate};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%Y%m%d"];
const MISSING_MARKERS: [&str; 7] = ["", ".", "na", "nan", "null", "n/a", "-"];

/// Maps a source's own geography key (region name, series code, FIPS) to a registered `geo_id`.
pub trait GeoResolver {
    fn resolve(&self, geo_key: &str) -> Option<String>;
}

impl GeoResolver for HashMap<String, String> {
    fn resolve(&self, geo_key: &str) -> Option<String> {
        self.get(geo_key).cloned()
    }
}

/// A cell as the source delivered it, either a number or text that may be a missing marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl RawValue {
    /// `None` for missing markers, unparsable text and non-finite numbers.
    pub fn normalize(&self) -> Option<f64> {
        let v = match self {
            RawValue::Number(n) => *n,
            RawValue::Text(t) => {
                let t = t.trim();
                if MISSING_MARKERS.contains(&t.to_ascii_lowercase().as_str()) {
                    return None;
                }
                t.replace(',', "").parse::<f64>().ok()?
            }
        };
        v.is_finite().then_some(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub date: String,
    pub geo_key: String,
    #[serde(default)]
    pub value: Option<RawValue>,
}

impl RawObservation {
    pub fn new(date: &str, geo_key: &str, value: Option<RawValue>) -> Self {
        Self { date: date.to_string(), geo_key: geo_key.to_string(), value }
    }
}

/// Rows handed over by an extractor, optionally with the window it was asked to cover.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub rows: Vec<RawObservation>,
    pub window: Option<DateSpan>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageReport {
    pub accepted: usize,
    pub dropped_unknown_geo: usize,
    pub dropped_bad_date: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone)]
pub struct Staged {
    pub batch: Batch,
    pub report: StageReport,
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }
    // year-month only, as monthly series are often published
    if let Ok(date) = NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d") {
        return Some(date);
    }
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive())
}

/// Staging settings for one `(source, metric)` extraction job.
#[derive(Debug, Clone)]
pub struct Stager {
    source_id: String,
    metric_id: String,
    default_geo: Option<String>,
    alignment: DateAlignment,
    aggregation: Aggregation,
}

impl Stager {
    pub fn new(source_id: &str, metric_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            metric_id: metric_id.to_string(),
            default_geo: None,
            alignment: DateAlignment::AsIs,
            aggregation: Aggregation::AsIs,
        }
    }

    /// Rows whose geo key does not resolve land on this geography, e.g. national-only series.
    pub fn with_default_geo(mut self, geo_id: &str) -> Self {
        self.default_geo = Some(geo_id.to_string());
        self
    }

    pub fn with_alignment(mut self, alignment: DateAlignment) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    /// Resolves geographies, parses dates and values, collapses duplicates (last row wins) and
    /// declares the span of every key. Rows that cannot be placed are dropped with a warning.
    pub fn stage(&self, extraction: Extraction, resolver: &dyn GeoResolver) -> Staged {
        let mut report = StageReport::default();
        let mut series: BTreeMap<String, Vec<(NaiveDate, Option<f64>)>> = BTreeMap::new();
        let mut unknown_keys: BTreeMap<String, usize> = BTreeMap::new();

        for raw in extraction.rows {
            let geo_id = resolver.resolve(raw.geo_key.trim()).or_else(|| self.default_geo.clone());
            let Some(geo_id) = geo_id else {
                *unknown_keys.entry(raw.geo_key.clone()).or_default() += 1;
                report.dropped_unknown_geo += 1;
                continue;
            };
            let Some(date) = parse_date(&raw.date) else {
                warn!("{}: dropping row with unparsable date `{}` for {}", self.metric_id, raw.date, raw.geo_key);
                report.dropped_bad_date += 1;
                continue;
            };
            let value = raw.value.as_ref().and_then(RawValue::normalize);
            series.entry(geo_id).or_default().push((date, value));
        }
        for (key, rows) in &unknown_keys {
            warn!("{}: dropped {} rows with unmapped geography `{}`", self.metric_id, rows, key);
        }

        let mut batch = Batch::new(BatchOrigin::Extraction);
        for (geo_id, rows) in series {
            let shaped = aggregate_monthly(&rows, self.aggregation, self.alignment);
            let mut cells: BTreeMap<NaiveDate, Option<f64>> = BTreeMap::new();
            for (date, value) in shaped {
                if cells.insert(date, value).is_some() {
                    report.duplicates += 1;
                }
            }
            let key = SeriesKey::new(&geo_id, &self.metric_id);
            if let Some(window) = extraction.window {
                batch.declare_span(key.clone(), window);
            }
            report.accepted += cells.len();
            for (date, value) in cells {
                batch.push(Observation::new(&geo_id, &self.metric_id, date, value, &self.source_id));
            }
            debug!("staged {key}");
        }
        Staged { batch, report }
    }
}
