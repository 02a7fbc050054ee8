pub mod clickhouse;

use anyhow::Result;

use crate::packet::BatchRecord;

pub use self::clickhouse::ClickHouseStore;

/// Durable destination for capture records.
pub trait RecordStore: Send + Sync + 'static {
    /// Returns the store's name for logging.
    fn name(&self) -> &str;

    /// Persists every record in one bulk operation, in slice order.
    fn bulk_insert(
        &self,
        records: &[BatchRecord],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
