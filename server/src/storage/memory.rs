//! In-memory ring buffer of recent telemetry

use super::{IdStamper, StoreError, TelemetryStore, RECENT_LIMIT};
use async_trait::async_trait;
use speedtest_shared::TelemetryRecord;
use std::collections::VecDeque;
use std::sync::RwLock;

/// Keeps the last `max_records` records; the oldest is dropped on overflow.
/// Nothing survives a restart.
pub struct MemoryStore {
    max_records: usize,
    records: RwLock<VecDeque<TelemetryRecord>>,
    stamper: IdStamper,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Buffer sized to exactly what a recent-results view needs.
    pub fn new() -> Self {
        Self::with_capacity(RECENT_LIMIT)
    }

    pub fn with_capacity(max_records: usize) -> Self {
        Self {
            max_records,
            records: RwLock::new(VecDeque::with_capacity(max_records.min(4096))),
            stamper: IdStamper::new(),
        }
    }

    /// Current number of records in the buffer.
    pub fn len(&self) -> Result<usize, StoreError> {
        let records = self.records.read().map_err(StoreError::storage)?;
        Ok(records.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert(&self, mut record: TelemetryRecord) -> Result<String, StoreError> {
        let mut records = self.records.write().map_err(StoreError::storage)?;
        // Stamped under the lock so storage order matches id order.
        let id = self.stamper.stamp(&mut record)?;
        records.push_back(record);

        let mut drops = 0u64;
        while records.len() > self.max_records {
            records.pop_front();
            drops += 1;
        }

        crate::metrics::MEMORY_STORE_RECORDS.set(records.len() as f64);
        if drops > 0 {
            crate::metrics::MEMORY_STORE_EVICTIONS.inc_by(drops as f64);
        }
        Ok(id)
    }

    async fn fetch_by_id(&self, id: &str) -> Result<TelemetryRecord, StoreError> {
        let records = self.records.read().map_err(StoreError::storage)?;
        records
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn fetch_recent(&self, limit: usize) -> Result<Vec<TelemetryRecord>, StoreError> {
        let records = self.records.read().map_err(StoreError::storage)?;
        let limit = limit.min(RECENT_LIMIT);
        Ok(records.iter().rev().take(limit).cloned().collect())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
