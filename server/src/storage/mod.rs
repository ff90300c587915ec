//! Telemetry storage backends
//!
//! Every backend implements [`TelemetryStore`] with the same observable
//! contract: `insert` assigns the id and timestamp, `fetch_by_id` tells a
//! missing record apart from a failing backend, and `fetch_recent` returns at
//! most [`RECENT_LIMIT`] records, newest first.

pub mod embedded;
pub mod memory;
pub mod null;
pub mod sql;

use crate::config::StorageConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use speedtest_shared::TelemetryRecord;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use ulid::Generator;

/// Most records any `fetch_recent` call returns.
pub const RECENT_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        StoreError::Storage(err.to_string())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Stamp `record` with a fresh id and timestamp, persist it, and return the id.
    async fn insert(&self, record: TelemetryRecord) -> Result<String, StoreError>;

    async fn fetch_by_id(&self, id: &str) -> Result<TelemetryRecord, StoreError>;

    /// Up to `limit` (capped at [`RECENT_LIMIT`]) records, newest first.
    async fn fetch_recent(&self, limit: usize) -> Result<Vec<TelemetryRecord>, StoreError>;

    /// Short backend name for logs and audit events.
    fn backend(&self) -> &'static str;

    /// Whether inserted records can be read back at all.
    fn retains_records(&self) -> bool {
        true
    }
}

/// Assigns monotonic ULIDs and matching timestamps.
///
/// The timestamp is the ULID's own millisecond time, so ids sort by creation
/// and timestamps never go backwards within one store.
pub struct IdStamper {
    generator: Mutex<Generator>,
}

impl Default for IdStamper {
    fn default() -> Self {
        Self::new()
    }
}

impl IdStamper {
    pub fn new() -> Self {
        Self {
            generator: Mutex::new(Generator::new()),
        }
    }

    pub fn stamp(&self, record: &mut TelemetryRecord) -> Result<String, StoreError> {
        let ulid = self
            .generator
            .lock()
            .map_err(|e| StoreError::storage(format!("id generator poisoned: {}", e)))?
            .generate()
            .map_err(|e| StoreError::storage(format!("id generation failed: {}", e)))?;

        record.id = ulid.to_string();
        record.timestamp = DateTime::<Utc>::from(ulid.datetime());
        Ok(record.id.clone())
    }
}

/// Open the configured backend. Failures here are fatal at startup.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn TelemetryStore>, StoreError> {
    let store: Arc<dyn TelemetryStore> = match config {
        StorageConfig::Postgres(settings) => {
            Arc::new(sql::SqlStore::connect_postgres(settings).await?)
        }
        StorageConfig::MySql(settings) => Arc::new(sql::SqlStore::connect_mysql(settings).await?),
        StorageConfig::Sqlite { path } => Arc::new(sql::SqlStore::open_sqlite(path).await?),
        StorageConfig::Embedded { path } => Arc::new(embedded::EmbeddedStore::open(path)?),
        StorageConfig::Memory => Arc::new(memory::MemoryStore::new()),
        StorageConfig::None => Arc::new(null::NullStore::new()),
    };
    tracing::info!("Telemetry storage backend: {}", store.backend());
    Ok(store)
}
