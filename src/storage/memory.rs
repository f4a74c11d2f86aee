use super::engine::RecordStore;
use super::persistence::{DurabilityMode, PersistenceManager, WalEntry};
use super::table::{FieldSchema, FieldTable};
use crate::config::HotCloseConfig;
use crate::core::{HotCloseError, Result, SessionKey, StoredRow, StoredValue, TableId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use tracing::{Level, event};

type TableHandle = Arc<RwLock<FieldTable>>;

/// Bounded table store held in memory, optionally backed by a WAL.
///
/// Reads only take the lock of the table they touch. Mutations are
/// serialized by `write_gate` so the capacity check and the write it guards
/// happen as one step.
pub struct InMemoryRecordStore {
    tables: RwLock<HashMap<TableId, TableHandle>>,
    write_gate: tokio::sync::Mutex<()>,
    used_bytes: AtomicU64,
    capacity_bytes: u64,
    persistence: Option<Mutex<PersistenceManager>>,
}

impl InMemoryRecordStore {
    /// Volatile store with the given byte ceiling.
    pub fn new(capacity_bytes: u64) -> Self {
        Self::from_tables(HashMap::new(), capacity_bytes, None)
    }

    /// Open the store described by `config`, recovering previous contents
    /// when a data directory is configured.
    pub fn open(config: &HotCloseConfig) -> Result<Self> {
        let Some(data_dir) = config.data_dir.as_ref() else {
            return Ok(Self::new(config.capacity_bytes));
        };
        if config.durability == DurabilityMode::None {
            return Ok(Self::new(config.capacity_bytes));
        }

        let mut persistence = PersistenceManager::open(data_dir, config.durability, config.checkpoint_threshold)?;
        let tables = persistence.recover()?;
        event!(
            Level::DEBUG,
            data_dir = %data_dir.display(),
            tables = tables.len(),
            "record store recovered"
        );
        Ok(Self::from_tables(tables, config.capacity_bytes, Some(persistence)))
    }

    fn from_tables(
        tables: HashMap<TableId, FieldTable>,
        capacity_bytes: u64,
        persistence: Option<PersistenceManager>,
    ) -> Self {
        let used: u64 = tables.values().map(FieldTable::byte_len).sum();
        Self {
            tables: RwLock::new(
                tables
                    .into_iter()
                    .map(|(id, table)| (id, Arc::new(RwLock::new(table))))
                    .collect(),
            ),
            write_gate: tokio::sync::Mutex::new(()),
            used_bytes: AtomicU64::new(used),
            capacity_bytes,
            persistence: persistence.map(Mutex::new),
        }
    }

    async fn get_table(&self, table: TableId) -> Result<TableHandle> {
        self.tables
            .read()
            .await
            .get(&table)
            .cloned()
            .ok_or_else(|| HotCloseError::TableNotFound(table.name().to_string()))
    }

    fn log(&self, entry: &WalEntry) -> Result<()> {
        match &self.persistence {
            Some(persistence) => persistence.lock()?.log(entry),
            None => Ok(()),
        }
    }

    fn check_capacity(&self, table: TableId, cost: u64) -> Result<()> {
        let used = self.used_bytes.load(Ordering::SeqCst);
        if used.saturating_add(cost) > self.capacity_bytes {
            return Err(HotCloseError::CapacityExceeded {
                table: table.name().to_string(),
                requested: cost,
                ceiling: self.capacity_bytes,
            });
        }
        Ok(())
    }

    fn recount(&self, before: u64, after: u64) {
        if after >= before {
            self.used_bytes.fetch_add(after - before, Ordering::SeqCst);
        } else {
            self.used_bytes.fetch_sub(before - after, Ordering::SeqCst);
        }
    }

    /// Compact the WAL into a snapshot once it has grown past the threshold.
    /// Must be called with the write gate held.
    async fn maybe_checkpoint(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let due = match persistence.lock() {
            Ok(guard) => guard.needs_checkpoint(),
            Err(_) => false,
        };
        if !due {
            return;
        }

        let handles: Vec<TableHandle> = self.tables.read().await.values().cloned().collect();
        let mut tables = Vec::with_capacity(handles.len());
        for handle in handles {
            tables.push(handle.read().await.clone());
        }

        let result = persistence
            .lock()
            .map_err(HotCloseError::from)
            .and_then(|mut guard| guard.checkpoint(tables));
        if let Err(err) = result {
            // WAL still holds every record.
            event!(Level::WARN, error = %err, "record store checkpoint failed");
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn ensure_table(&self, schema: FieldSchema) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let mut tables = self.tables.write().await;
        if tables.contains_key(&schema.table()) {
            return Ok(());
        }
        self.log(&WalEntry::CreateTable { schema: schema.clone() })?;
        tables.insert(schema.table(), Arc::new(RwLock::new(FieldTable::new(schema))));
        drop(tables);
        self.maybe_checkpoint().await;
        Ok(())
    }

    async fn insert(&self, table: TableId, key: &SessionKey, value: StoredValue) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let handle = self.get_table(table).await?;
        {
            let mut tbl = handle.write().await;
            tbl.schema().validate(&value)?;
            if tbl.contains(key) {
                return Err(HotCloseError::KeyConflict {
                    table: table.name().to_string(),
                    key: key.to_string(),
                });
            }
            self.check_capacity(table, tbl.write_cost(key, &value))?;

            self.log(&WalEntry::Insert {
                table,
                key: key.clone(),
                value: value.clone(),
            })?;
            let before = tbl.byte_len();
            tbl.insert(key, value)?;
            self.recount(before, tbl.byte_len());
        }
        self.maybe_checkpoint().await;
        Ok(())
    }

    async fn update(&self, table: TableId, key: &SessionKey, value: StoredValue) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let handle = self.get_table(table).await?;
        {
            let mut tbl = handle.write().await;
            tbl.schema().validate(&value)?;
            if !tbl.contains(key) {
                return Err(HotCloseError::NotFound {
                    table: table.name().to_string(),
                    key: key.to_string(),
                });
            }
            self.check_capacity(table, tbl.write_cost(key, &value))?;

            self.log(&WalEntry::Update {
                table,
                key: key.clone(),
                value: value.clone(),
            })?;
            let before = tbl.byte_len();
            tbl.update(key, value)?;
            self.recount(before, tbl.byte_len());
        }
        self.maybe_checkpoint().await;
        Ok(())
    }

    async fn delete_by_key(&self, table: TableId, key: &SessionKey) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let handle = match self.get_table(table).await {
            Ok(handle) => handle,
            Err(HotCloseError::TableNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        {
            let mut tbl = handle.write().await;
            if !tbl.contains(key) {
                return Ok(());
            }
            self.log(&WalEntry::Delete { table, key: key.clone() })?;
            let before = tbl.byte_len();
            tbl.delete_by_key(key);
            self.recount(before, tbl.byte_len());
        }
        self.maybe_checkpoint().await;
        Ok(())
    }

    async fn delete_all(&self, table: TableId) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let handle = match self.get_table(table).await {
            Ok(handle) => handle,
            Err(HotCloseError::TableNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        {
            let mut tbl = handle.write().await;
            if tbl.row_count() == 0 {
                return Ok(());
            }
            self.log(&WalEntry::DeleteAll { table })?;
            let before = tbl.byte_len();
            tbl.clear();
            self.recount(before, 0);
        }
        self.maybe_checkpoint().await;
        Ok(())
    }

    async fn drop_table(&self, table: TableId) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let mut tables = self.tables.write().await;
        let Some(handle) = tables.get(&table).cloned() else {
            return Ok(());
        };
        self.log(&WalEntry::DropTable { table })?;
        tables.remove(&table);
        drop(tables);

        let freed = handle.read().await.byte_len();
        self.recount(freed, 0);
        self.maybe_checkpoint().await;
        Ok(())
    }

    async fn get(&self, table: TableId, key: &SessionKey) -> Result<Option<StoredRow>> {
        let handle = self.get_table(table).await?;
        let tbl = handle.read().await;
        Ok(tbl.get(key).cloned())
    }

    async fn row_count(&self, table: TableId) -> Result<usize> {
        let handle = self.get_table(table).await?;
        let tbl = handle.read().await;
        Ok(tbl.row_count())
    }

    async fn table_exists(&self, table: TableId) -> bool {
        self.tables.read().await.contains_key(&table)
    }

    async fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::SeqCst)
    }

    fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_tables(capacity: u64) -> InMemoryRecordStore {
        let store = InMemoryRecordStore::new(capacity);
        for table in TableId::ALL {
            store.ensure_table(FieldSchema::for_table(table)).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_ensure_table_is_idempotent() {
        let store = store_with_tables(1024).await;
        store
            .insert(TableId::Cursor, &SessionKey::new("/a"), StoredValue::Position(1, 1))
            .await
            .unwrap();
        store.ensure_table(FieldSchema::for_table(TableId::Cursor)).await.unwrap();
        assert_eq!(store.row_count(TableId::Cursor).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_shared_across_tables() {
        let store = store_with_tables(20).await;
        let key = SessionKey::new("/k");
        store
            .insert(TableId::History, &key, StoredValue::Text("0123456789".into()))
            .await
            .unwrap();
        assert_eq!(store.used_bytes().await, 12);

        let err = store
            .insert(TableId::Text, &key, StoredValue::Text("0123456789".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, HotCloseError::CapacityExceeded { ceiling: 20, .. }));
        assert_eq!(store.row_count(TableId::Text).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deletes_on_missing_rows_and_tables_are_noops() {
        let store = store_with_tables(1024).await;
        let key = SessionKey::new("/nothing");
        store.delete_by_key(TableId::Scroll, &key).await.unwrap();
        store.delete_all(TableId::Scroll).await.unwrap();
        store.drop_table(TableId::Scroll).await.unwrap();
        store.drop_table(TableId::Scroll).await.unwrap();
        store.delete_by_key(TableId::Scroll, &key).await.unwrap();
        assert!(!store.table_exists(TableId::Scroll).await);
    }

    #[tokio::test]
    async fn test_drop_table_releases_bytes() {
        let store = store_with_tables(1024).await;
        store
            .insert(TableId::Text, &SessionKey::new("/a"), StoredValue::Text("abc".into()))
            .await
            .unwrap();
        store.drop_table(TableId::Text).await.unwrap();
        assert_eq!(store.used_bytes().await, 0);
        let err = store.row_count(TableId::Text).await.unwrap_err();
        assert!(matches!(err, HotCloseError::TableNotFound(_)));
    }
}
