use config::{Config, ConfigError, Environment, File};
use factstore::chrono::NaiveDate;
use factstore::{info, warn, Aggregation, DateAlignment, DateSpan, Frequency, MarketType, Source, StoreError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Once;

pub const ENV_PREFIX: &str = "FACTSTORE";

static DOTENV: Once = Once::new();

/// Exports `.env` from the working directory or an ancestor, once per process.
fn load_dotenv() {
    DOTENV.call_once(|| match dotenv::dotenv() {
        Ok(path) => info!("Environment overrides read from {}", path.display()),
        Err(e) if e.not_found() => log::debug!("no .env file"),
        Err(e) => warn!("Ignoring unreadable .env file: {}", e),
    });
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub store: StoreSettings,
    pub snapshot: SnapshotSettings,
    /// Geography for rows whose key the manifest cannot resolve.
    #[serde(default)]
    pub default_geo: Option<String>,
    #[serde(default)]
    pub markets: Vec<MarketSettings>,
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub metrics: Vec<MetricSettings>,
    #[serde(default)]
    pub jobs: Vec<JobSettings>,
}

impl AppConfig {
    /// Layers, later ones winning: `path` (extension optional), an optional `{path}.local` next to
    /// it for machine-specific tweaks, then `FACTSTORE__SECTION__KEY` environment variables.
    pub fn new(path: &str) -> Result<Self, ConfigError> {
        load_dotenv();
        let config: AppConfig = Config::builder()
            .add_source(File::with_name(path))
            .add_source(File::with_name(&format!("{path}.local")).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__").try_parsing(true))
            .build()?
            .try_deserialize()?;
        log::debug!(
            "{}: {} markets, {} sources, {} metrics, {} jobs, store at {}",
            path, config.markets.len(), config.sources.len(), config.metrics.len(), config.jobs.len(), config.store.db_path
        );
        Ok(config)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    pub db_path: String,
    pub cache_size_mb: usize,
    /// Provenance stamped on derived observations.
    pub derived_source_id: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotSettings {
    pub path: String,
    #[serde(default)]
    pub min_date: Option<NaiveDate>,
    pub max_mb: u64,
    pub warn_ratio: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketSettings {
    pub geo_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub market_type: MarketType,
    #[serde(default)]
    pub fips: Option<String>,
    /// source_id -> the key that source uses for this market
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MetricSettings {
    pub metric_id: String,
    pub name: String,
    pub frequency: Frequency,
    pub unit: String,
    pub category: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Combining function name, present only for derived metrics.
    #[serde(default)]
    pub combine: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobSettings {
    pub source_id: String,
    pub metric_id: String,
    pub file: String,
    /// Overrides the top-level `default_geo` for this job.
    #[serde(default)]
    pub default_geo: Option<String>,
    #[serde(default)]
    pub window_start: Option<NaiveDate>,
    #[serde(default)]
    pub window_end: Option<NaiveDate>,
    #[serde(default)]
    pub alignment: DateAlignment,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl JobSettings {
    pub fn window(&self) -> Result<Option<DateSpan>, StoreError> {
        match (self.window_start, self.window_end) {
            (Some(start), Some(end)) => Ok(Some(DateSpan::new(start, end)?)),
            (None, None) => Ok(None),
            _ => Err(StoreError::config(format!(
                "job {}/{} must set both window_start and window_end or neither",
                self.source_id, self.metric_id
            ))),
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}", self.source_id, self.metric_id)
    }
}
