use crate::core::{HotCloseError, Result, SessionKey, StoredRow, StoredValue, TableId, ValueType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub const KEY_COLUMN: &str = "sessionId";

/// `(id INTEGER PRIMARY KEY, sessionId UNIQUE, <value_column>)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    table: TableId,
    value_column: String,
    value_type: ValueType,
}

impl FieldSchema {
    pub fn new(table: TableId, value_column: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            table,
            value_column: value_column.into(),
            value_type,
        }
    }

    /// The fixed schema of one of the four tables.
    pub fn for_table(table: TableId) -> Self {
        Self::new(table, table.value_column(), table.value_type())
    }

    pub fn table(&self) -> TableId { self.table }
    pub fn name(&self) -> &'static str { self.table.name() }
    pub fn value_column(&self) -> &str { &self.value_column }
    pub fn value_type(&self) -> ValueType { self.value_type }

    pub fn validate(&self, value: &StoredValue) -> Result<()> {
        if !self.value_type.is_compatible(value) {
            return Err(HotCloseError::TypeMismatch(format!(
                "Column '{}' expects type {}, got {}",
                self.value_column,
                self.value_type,
                value.type_name()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldTable {
    schema: FieldSchema,
    rows: BTreeMap<u64, StoredRow>,
    next_row_id: u64,
    #[serde(skip)]
    index: HashMap<SessionKey, u64>,
    #[serde(skip)]
    bytes: u64,
}

impl FieldTable {
    pub fn new(schema: FieldSchema) -> Self {
        Self {
            schema,
            rows: BTreeMap::new(),
            next_row_id: 1,
            index: HashMap::new(),
            bytes: 0,
        }
    }

    pub fn schema(&self) -> &FieldSchema {
        &self.schema
    }

    pub fn insert(&mut self, key: &SessionKey, value: StoredValue) -> Result<u64> {
        self.schema.validate(&value)?;
        if self.index.contains_key(key) {
            return Err(self.conflict(key));
        }

        let id = self.next_row_id;
        self.next_row_id += 1;

        let row = StoredRow {
            id,
            session_id: key.clone(),
            value,
        };
        self.bytes += row.byte_len();
        self.index.insert(key.clone(), id);
        self.rows.insert(id, row);
        Ok(id)
    }

    pub fn update(&mut self, key: &SessionKey, value: StoredValue) -> Result<()> {
        self.schema.validate(&value)?;
        let id = *self.index.get(key).ok_or_else(|| HotCloseError::NotFound {
            table: self.schema.name().to_string(),
            key: key.to_string(),
        })?;

        if let Some(row) = self.rows.get_mut(&id) {
            self.bytes = self.bytes - row.value.byte_len() + value.byte_len();
            row.value = value;
        }
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn delete_by_key(&mut self, key: &SessionKey) -> bool {
        match self.index.remove(key) {
            Some(id) => {
                if let Some(row) = self.rows.remove(&id) {
                    self.bytes -= row.byte_len();
                }
                true
            }
            None => false,
        }
    }

    /// Returns the number of rows removed. Row ids keep counting up.
    pub fn clear(&mut self) -> usize {
        let removed = self.rows.len();
        self.rows.clear();
        self.index.clear();
        self.bytes = 0;
        removed
    }

    pub fn get(&self, key: &SessionKey) -> Option<&StoredRow> {
        self.index.get(key).and_then(|id| self.rows.get(id))
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.index.contains_key(key)
    }

    pub fn rows(&self) -> impl Iterator<Item = &StoredRow> {
        self.rows.values()
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn byte_len(&self) -> u64 {
        self.bytes
    }

    /// Bytes the ceiling would have to absorb if `value` were written for `key`.
    pub fn write_cost(&self, key: &SessionKey, value: &StoredValue) -> u64 {
        match self.get(key) {
            Some(existing) => value.byte_len().saturating_sub(existing.value.byte_len()),
            None => key.byte_len() + value.byte_len(),
        }
    }

    /// Rebuild the key index and byte count after deserialization.
    pub fn rebuild_index(&mut self) {
        self.index = self
            .rows
            .iter()
            .map(|(id, row)| (row.session_id.clone(), *id))
            .collect();
        self.bytes = self.rows.values().map(StoredRow::byte_len).sum();
    }

    fn conflict(&self, key: &SessionKey) -> HotCloseError {
        HotCloseError::KeyConflict {
            table: self.schema.name().to_string(),
            key: key.to_string(),
        }
    }
}
