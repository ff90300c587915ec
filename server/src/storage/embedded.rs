//! Embedded key-value storage backend (redb)
//!
//! One table keyed by record id with JSON values. Ids are ULIDs, so key order
//! is creation order and "most recent" is a reverse walk from the last key.
//! redb serializes writers and lets readers proceed in parallel; all calls
//! run on the blocking pool.

use super::{IdStamper, StoreError, TelemetryStore, RECENT_LIMIT};
use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use speedtest_shared::TelemetryRecord;
use std::path::Path;
use std::sync::Arc;

/// Records keyed by id.
const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("speedtest");

pub struct EmbeddedStore {
    db: Arc<Database>,
    stamper: IdStamper,
}

impl EmbeddedStore {
    /// Open or create the database file and make sure the table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let db = Database::create(path)
            .map_err(|e| StoreError::storage(format!("cannot open {}: {}", path.display(), e)))?;

        let txn = db.begin_write().map_err(StoreError::storage)?;
        txn.open_table(RECORDS).map_err(StoreError::storage)?;
        txn.commit().map_err(StoreError::storage)?;

        tracing::info!("Opened embedded telemetry store at {}", path.display());
        Ok(Self {
            db: Arc::new(db),
            stamper: IdStamper::new(),
        })
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, redb::Error> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| StoreError::storage(format!("blocking task failed: {}", e)))?
            .map_err(StoreError::storage)
    }
}

fn decode(bytes: &[u8]) -> Result<TelemetryRecord, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::storage(format!("corrupt record: {}", e)))
}

#[async_trait]
impl TelemetryStore for EmbeddedStore {
    async fn insert(&self, mut record: TelemetryRecord) -> Result<String, StoreError> {
        let id = self.stamper.stamp(&mut record)?;
        let value = serde_json::to_vec(&record).map_err(StoreError::storage)?;
        let key = id.clone();

        self.run_blocking(move |db| {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(RECORDS)?;
                table.insert(key.as_str(), value.as_slice())?;
            }
            txn.commit()?;
            Ok(())
        })
        .await?;
        Ok(id)
    }

    async fn fetch_by_id(&self, id: &str) -> Result<TelemetryRecord, StoreError> {
        let key = id.to_string();
        let value = self
            .run_blocking(move |db| {
                let txn = db.begin_read()?;
                let table = txn.open_table(RECORDS)?;
                let value = table.get(key.as_str())?.map(|v| v.value().to_vec());
                Ok(value)
            })
            .await?;

        match value {
            Some(bytes) => decode(&bytes),
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<TelemetryRecord>, StoreError> {
        let limit = limit.min(RECENT_LIMIT);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let values = self
            .run_blocking(move |db| {
                let txn = db.begin_read()?;
                let table = txn.open_table(RECORDS)?;
                let mut out = Vec::with_capacity(limit);
                for entry in table.iter()?.rev() {
                    let (_, value) = entry?;
                    out.push(value.value().to_vec());
                    if out.len() >= limit {
                        break;
                    }
                }
                Ok(out)
            })
            .await?;

        values.iter().map(|bytes| decode(bytes)).collect()
    }

    fn backend(&self) -> &'static str {
        "redb"
    }
}
