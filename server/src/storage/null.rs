//! Storage backend that keeps nothing

use super::{IdStamper, StoreError, TelemetryStore};
use async_trait::async_trait;
use speedtest_shared::TelemetryRecord;

/// Accepts every insert and discards it. Ids are still issued so clients see
/// the same response shape as with a real backend.
#[derive(Default)]
pub struct NullStore {
    stamper: IdStamper,
}

impl NullStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryStore for NullStore {
    async fn insert(&self, mut record: TelemetryRecord) -> Result<String, StoreError> {
        self.stamper.stamp(&mut record)
    }

    async fn fetch_by_id(&self, id: &str) -> Result<TelemetryRecord, StoreError> {
        Err(StoreError::NotFound(id.to_string()))
    }

    async fn fetch_recent(&self, _limit: usize) -> Result<Vec<TelemetryRecord>, StoreError> {
        Ok(Vec::new())
    }

    fn backend(&self) -> &'static str {
        "none"
    }

    fn retains_records(&self) -> bool {
        false
    }
}
