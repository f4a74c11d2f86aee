use super::table::FieldSchema;
use crate::core::{Result, SessionKey, StoredRow, StoredValue, TableId};
use async_trait::async_trait;

/// Transactional key/value capability the sync protocol runs against.
///
/// Keys and values are always passed as data. Implementations must report
/// a duplicate key as `KeyConflict` and a full store as `CapacityExceeded`
/// so callers can tell the recoverable cases apart.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the table if it is absent. Never fails because it exists.
    async fn ensure_table(&self, schema: FieldSchema) -> Result<()>;

    /// Insert a new row. An existing row for `key` is a `KeyConflict`,
    /// never an overwrite.
    async fn insert(&self, table: TableId, key: &SessionKey, value: StoredValue) -> Result<()>;

    /// Replace the value of an existing row; `NotFound` if there is none.
    async fn update(&self, table: TableId, key: &SessionKey, value: StoredValue) -> Result<()>;

    /// Idempotent.
    async fn delete_by_key(&self, table: TableId, key: &SessionKey) -> Result<()>;

    /// Idempotent.
    async fn delete_all(&self, table: TableId) -> Result<()>;

    /// Irreversible. Dropping an absent table is not an error.
    async fn drop_table(&self, table: TableId) -> Result<()>;

    async fn get(&self, table: TableId, key: &SessionKey) -> Result<Option<StoredRow>>;

    async fn row_count(&self, table: TableId) -> Result<usize>;

    async fn table_exists(&self, table: TableId) -> bool;

    /// Bytes currently charged against the ceiling.
    async fn used_bytes(&self) -> u64;

    fn capacity_bytes(&self) -> u64;
}
