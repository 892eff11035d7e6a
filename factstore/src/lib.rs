//! Time-series fact store for housing market indicators.
//!
//! Reference dimensions (markets, sources, metrics) are seeded idempotently by the
//! [`DimensionRegistry`], raw extracted rows are normalized into a [`Batch`] by the [`Stager`],
//! the [`FactStore`] replaces each `(geo_id, metric_id)` span atomically and reports what changed,
//! and the [`DerivedMetricEngine`] re-materializes dependent metrics in topological order.

pub mod codec;
pub mod derived;
pub mod error;
pub mod fact_store;
pub mod logger;
pub mod model;
pub mod registry;
pub mod resample;
pub mod staging;
pub mod storage;

pub use chrono;
pub use derived::{Combinator, DependencyGraph, DerivedMetricEngine, RecomputeReport, SkipReason};
pub use error::StoreError;
pub use fact_store::{Batch, BatchOrigin, FactStore, InvalidationSet, SeriesSummary, StoreContents, UpsertReport};
pub use model::{DateSpan, DerivedDefinition, Frequency, Market, MarketType, Metric, MetricKind, Observation, SeriesKey, Source};
pub use registry::{DimensionRegistry, RegistrationReport};
pub use resample::{Aggregation, DateAlignment};
pub use staging::{Extraction, GeoResolver, RawObservation, RawValue, StageReport, Staged, Stager};
pub use storage::Storage;
