use std::sync::PoisonError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("redb compaction error: {0}")]
    RedbCompaction(#[from] redb::CompactionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown geography: {0}")]
    UnknownGeography(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Metric {metric_id} is {kind} and cannot be written by {origin}")]
    KindMismatch { metric_id: String, kind: &'static str, origin: &'static str },

    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("Upsert transaction rolled back: {0}")]
    UpsertTransaction(#[source] Box<StoreError>),

    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl StoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        StoreError::Configuration(msg.into())
    }

    /// Configuration errors halt a run before storage is touched, everything else is scoped to a batch or metric.
    pub fn is_fatal_configuration(&self) -> bool {
        matches!(self, StoreError::Configuration(_))
    }
}

impl<T> From<PoisonError<T>> for StoreError
{
    fn from(e: PoisonError<T>) -> Self {
        StoreError::Custom(format!("Poison error: {:?}", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_error_keeps_its_cause() {
        let err = StoreError::UpsertTransaction(Box::new(StoreError::UnknownMetric("fred_gs10".into())));
        assert_eq!(err.to_string(), "Upsert transaction rolled back: Unknown metric: fred_gs10");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn only_configuration_errors_are_fatal() {
        assert!(StoreError::config("cycle").is_fatal_configuration());
        assert!(!StoreError::UnknownGeography("dc".into()).is_fatal_configuration());
        assert!(!StoreError::ExtractionFailed("timeout".into()).is_fatal_configuration());
    }
}
