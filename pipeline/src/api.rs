use async_trait::async_trait;
use factstore::{DateSpan, Extraction, RawObservation, StoreError};
use std::path::PathBuf;

/// Fetches raw rows for one `(source, metric)` job. Implementations wrap remote APIs or files;
/// any failure is reported as `StoreError::ExtractionFailed` so the launcher can skip the job.
#[async_trait]
pub trait Extractor: Send + Sync {
    fn name(&self) -> String;
    async fn extract(&self) -> Result<Extraction, StoreError>;
}

/// Reads a JSON array of `{ "date": .., "geo_key": .., "value": .. }` rows.
pub struct JsonFileExtractor {
    path: PathBuf,
    window: Option<DateSpan>,
}

impl JsonFileExtractor {
    pub fn new(path: impl Into<PathBuf>, window: Option<DateSpan>) -> Self {
        Self { path: path.into(), window }
    }
}

#[async_trait]
impl Extractor for JsonFileExtractor {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    async fn extract(&self) -> Result<Extraction, StoreError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::ExtractionFailed(format!("{}: {}", self.path.display(), e)))?;
        let rows: Vec<RawObservation> = serde_json::from_str(&text)
            .map_err(|e| StoreError::ExtractionFailed(format!("{}: {}", self.path.display(), e)))?;
        Ok(Extraction { rows, window: self.window })
    }
}
