use crate::derived::Combinator;
use crate::StoreError;
use bincode::{Decode, Encode};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    National,
    State,
    County,
    City,
    Metro,
}

impl FromStr for MarketType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "national" => Ok(MarketType::National),
            "state" => Ok(MarketType::State),
            "county" => Ok(MarketType::County),
            "city" => Ok(MarketType::City),
            "metro" => Ok(MarketType::Metro),
            other => Err(StoreError::config(format!("invalid market type `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
}

impl FromStr for Frequency {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "daily" => Ok(Frequency::Daily),
            "weekly" => Ok(Frequency::Weekly),
            "monthly" => Ok(Frequency::Monthly),
            "quarterly" => Ok(Frequency::Quarterly),
            other => Err(StoreError::config(format!("invalid frequency `{other}`"))),
        }
    }
}

/// A geography observations are reported for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Market {
    pub geo_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub market_type: MarketType,
    pub fips: Option<String>,
}

impl Market {
    pub fn new(geo_id: &str, name: &str, market_type: MarketType, fips: Option<&str>) -> Self {
        Self { geo_id: geo_id.to_string(), name: name.to_string(), market_type, fips: fips.map(str::to_string) }
    }
}

/// Provenance of observations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Source {
    pub source_id: String,
    pub name: String,
    pub url: String,
    pub cadence: String,
    pub license: String,
}

impl Source {
    pub fn new(source_id: &str, name: &str, url: &str, cadence: &str, license: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            cadence: cadence.to_string(),
            license: license.to_string(),
        }
    }
}

/// Ordered inputs of a derived metric and the function combining them row-wise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct DerivedDefinition {
    pub inputs: Vec<String>,
    pub combinator: Combinator,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MetricKind {
    Base,
    Derived(DerivedDefinition),
}

impl MetricKind {
    pub fn label(&self) -> &'static str {
        match self {
            MetricKind::Base => "base",
            MetricKind::Derived(_) => "derived",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
pub struct Metric {
    pub metric_id: String,
    pub name: String,
    pub frequency: Frequency,
    pub unit: String,
    pub category: String,
    pub kind: MetricKind,
}

impl Metric {
    pub fn base(metric_id: &str, name: &str, frequency: Frequency, unit: &str, category: &str) -> Self {
        Self {
            metric_id: metric_id.to_string(),
            name: name.to_string(),
            frequency,
            unit: unit.to_string(),
            category: category.to_string(),
            kind: MetricKind::Base,
        }
    }

    pub fn derived(metric_id: &str, name: &str, frequency: Frequency, unit: &str, category: &str, inputs: &[&str], combinator: Combinator) -> Self {
        Self {
            kind: MetricKind::Derived(DerivedDefinition { inputs: inputs.iter().map(|i| i.to_string()).collect(), combinator }),
            ..Self::base(metric_id, name, frequency, unit, category)
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, MetricKind::Derived(_))
    }

    pub fn definition(&self) -> Option<&DerivedDefinition> {
        match &self.kind {
            MetricKind::Derived(def) => Some(def),
            MetricKind::Base => None,
        }
    }

    pub fn inputs(&self) -> &[String] {
        self.definition().map(|d| d.inputs.as_slice()).unwrap_or(&[])
    }
}

/// Identity of one time series: `(geo_id, metric_id)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub geo_id: String,
    pub metric_id: String,
}

impl SeriesKey {
    pub fn new(geo_id: &str, metric_id: &str) -> Self {
        Self { geo_id: geo_id.to_string(), metric_id: metric_id.to_string() }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.geo_id, self.metric_id)
    }
}

/// One cell of the fact table. A `None` value is an explicit missing observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub geo_id: String,
    pub metric_id: String,
    pub date: NaiveDate,
    pub value: Option<f64>,
    pub source_id: String,
}

impl Observation {
    pub fn new(geo_id: &str, metric_id: &str, date: NaiveDate, value: Option<f64>, source_id: &str) -> Self {
        Self { geo_id: geo_id.to_string(), metric_id: metric_id.to_string(), date, value, source_id: source_id.to_string() }
    }

    pub fn key(&self) -> SeriesKey {
        SeriesKey::new(&self.geo_id, &self.metric_id)
    }
}

/// Inclusive date range a batch claims authority over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, StoreError> {
        if start > end {
            return Err(StoreError::config(format!("span start {start} is after end {end}")));
        }
        Ok(Self { start, end })
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }

    /// Every representable date.
    pub fn full() -> Self {
        Self { start: NaiveDate::MIN, end: NaiveDate::MAX }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn union(&self, other: &DateSpan) -> DateSpan {
        DateSpan { start: self.start.min(other.start), end: self.end.max(other.end) }
    }

    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Smallest span covering all dates, `None` when there are none.
    pub fn covering<I: IntoIterator<Item = NaiveDate>>(dates: I) -> Option<DateSpan> {
        dates.into_iter().fold(None, |acc: Option<DateSpan>, d| {
            Some(acc.map_or(DateSpan::day(d), |s| s.union(&DateSpan::day(d))))
        })
    }
}

impl fmt::Display for DateSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn span_covering_takes_extremes() {
        let span = DateSpan::covering(vec![d(2024, 3, 1), d(2024, 1, 1), d(2024, 2, 1)]).unwrap();
        assert_eq!(span, DateSpan::new(d(2024, 1, 1), d(2024, 3, 1)).unwrap());
        assert!(DateSpan::covering(Vec::<NaiveDate>::new()).is_none());
    }

    #[test]
    fn inverted_span_is_rejected() {
        assert!(DateSpan::new(d(2024, 2, 1), d(2024, 1, 1)).is_err());
    }

    #[test]
    fn span_bounds_are_inclusive() {
        let span = DateSpan::new(d(2024, 1, 1), d(2024, 1, 31)).unwrap();
        assert!(span.contains(d(2024, 1, 1)));
        assert!(span.contains(d(2024, 1, 31)));
        assert!(!span.contains(d(2024, 2, 1)));
        assert!(span.overlaps(&DateSpan::day(d(2024, 1, 31))));
        assert!(!span.overlaps(&DateSpan::day(d(2023, 12, 31))));
    }

    #[test]
    fn metric_kind_is_visible_from_the_dimension() {
        let gs10 = Metric::base("fred_gs10", "10Y", Frequency::Monthly, "percent", "yields");
        let spread = Metric::derived("spread_10y_2y", "10Y-2Y", Frequency::Monthly, "pp", "spreads", &["fred_gs10", "fred_gs2"], Combinator::Difference);
        assert!(!gs10.is_derived());
        assert!(gs10.inputs().is_empty());
        assert!(spread.is_derived());
        assert_eq!(spread.inputs(), &["fred_gs10".to_string(), "fred_gs2".to_string()]);
        assert_eq!(spread.kind.label(), "derived");
    }

    #[test]
    fn enums_parse_case_insensitively() {
        assert_eq!("Metro".parse::<MarketType>().unwrap(), MarketType::Metro);
        assert_eq!(" weekly ".parse::<Frequency>().unwrap(), Frequency::Weekly);
        assert!("hourly".parse::<Frequency>().unwrap_err().is_fatal_configuration());
    }
}
