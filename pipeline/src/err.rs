use config::ConfigError;
use factstore::StoreError;
use tokio::task::JoinError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Join error: {0}")]
    JoinError(#[from] JoinError),

    #[error("Snapshot is {size_mb:.1} MB, over the {max_mb} MB limit")]
    SnapshotTooLarge { size_mb: f64, max_mb: u64 },

    #[error("{0}")]
    Custom(String),
}

impl PipelineError {
    pub fn new(msg: impl Into<String>) -> Self {
        PipelineError::Custom(msg.into())
    }

    /// Operator mistakes that must stop a run before any job executes.
    pub fn is_fatal_configuration(&self) -> bool {
        match self {
            PipelineError::ConfigError(_) => true,
            PipelineError::Store(e) => e.is_fatal_configuration(),
            _ => false,
        }
    }
}
