//! Derived metrics: typed combinators, the dependency DAG and the recompute engine.

pub mod combinator;
pub mod engine;
pub mod graph;

pub use combinator::Combinator;
pub use engine::{DerivedMetricEngine, RecomputeReport, SkipReason};
pub use graph::DependencyGraph;
