use crate::model::{Market, Metric, Source};
use crate::{impl_redb_value_bincode, info, StoreError};
use bincode::{Decode, Encode};
use redb::{Database, MultimapTableDefinition, ReadTransaction, TableDefinition, WriteTransaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{env, fs};

impl_redb_value_bincode!(Market);
impl_redb_value_bincode!(Source);
impl_redb_value_bincode!(Metric);
impl_redb_value_bincode!(FactRow);

pub(crate) const MARKETS: TableDefinition<&str, Market> = TableDefinition::new("dim_market");
pub(crate) const SOURCES: TableDefinition<&str, Source> = TableDefinition::new("dim_source");
pub(crate) const METRICS: TableDefinition<&str, Metric> = TableDefinition::new("dim_metric");
/// `(geo_id, metric_id, day)` -> value and provenance
pub(crate) const FACTS: TableDefinition<(&str, &str, i32), FactRow> = TableDefinition::new("fact_observation");
/// metric_id -> geo_ids holding a non-empty series of it
pub(crate) const SERIES_BY_METRIC: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("series_by_metric");
/// `(geo_id, metric_id)` -> `(first_day, last_day)` changed since the last recompute pass
pub(crate) const PENDING: TableDefinition<(&str, &str), (i32, i32)> = TableDefinition::new("pending_recompute");

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct FactRow {
    pub value: Option<f64>,
    pub source_id: String,
}

/// Handle over the single database file of a pipeline run. Components share it through `Arc`,
/// the file is released when the last clone is dropped.
pub struct Storage {
    db: Database,
    path: PathBuf,
}

impl Storage {
    pub fn open(path: impl AsRef<Path>, cache_size_mb: usize) -> Result<Storage, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }
        if path.exists() {
            info!("Opening existing store at {:?}, it might take a while in case previous process was killed", path);
        } else {
            info!("Creating store at {:?} with cache size {} MB", path, cache_size_mb);
        }
        let db = Database::builder()
            .set_cache_size(cache_size_mb * 1024 * 1024)
            .create(&path)?;
        let storage = Storage { db, path };
        storage.init_tables()?;
        Ok(storage)
    }

    /// Fresh store under the system temp dir, used by tests and throwaway runs.
    pub fn temp(name: &str) -> Result<Arc<Storage>, StoreError> {
        let path = env::temp_dir()
            .join("factstore")
            .join(format!("{}_{}.redb", name, rand::random::<u64>()));
        Ok(Arc::new(Storage::open(path, 16)?))
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        let tx = self.db.begin_write()?;
        {
            tx.open_table(MARKETS)?;
            tx.open_table(SOURCES)?;
            tx.open_table(METRICS)?;
            tx.open_table(FACTS)?;
            tx.open_multimap_table(SERIES_BY_METRIC)?;
            tx.open_table(PENDING)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, StoreError> {
        Ok(self.db.begin_write()?)
    }

    pub fn begin_read(&self) -> Result<ReadTransaction, StoreError> {
        Ok(self.db.begin_read()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reclaims free pages; requires exclusive access to the handle.
    pub fn compact(&mut self) -> Result<bool, StoreError> {
        Ok(self.db.compact()?)
    }
}
