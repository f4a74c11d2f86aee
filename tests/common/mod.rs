//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use hotclose::{
    CursorPos, DocumentSource, EditorSnapshot, FieldSchema, HotCloseError, InMemoryRecordStore,
    RecordStore, Result, ScrollPos, SessionKey, StoredRow, StoredValue, TableId,
};
use serde_json::{Value as JsonValue, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    EnsureTable,
    Insert,
    Update,
    DeleteByKey,
    DeleteAll,
}

/// Wraps an in-memory store and fails scripted calls.
pub struct FaultyStore {
    inner: InMemoryRecordStore,
    faults: Mutex<HashMap<(TableId, Op), VecDeque<HotCloseError>>>,
    calls: Mutex<Vec<(TableId, Op)>>,
    write_delay: Mutex<Option<Duration>>,
    drop_delay: Mutex<Option<Duration>>,
}

impl FaultyStore {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: InMemoryRecordStore::new(capacity),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            write_delay: Mutex::new(None),
            drop_delay: Mutex::new(None),
        }
    }

    /// Make every insert and update take `delay`.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = Some(delay);
    }

    /// Make every table drop take `delay`.
    pub fn set_drop_delay(&self, delay: Duration) {
        *self.drop_delay.lock().unwrap() = Some(delay);
    }

    async fn stall(&self) {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Fail the next call of `op` on `table` with `err`.
    pub fn fail_next(&self, table: TableId, op: Op, err: HotCloseError) {
        self.faults
            .lock()
            .unwrap()
            .entry((table, op))
            .or_default()
            .push_back(err);
    }

    pub fn calls(&self, table: TableId, op: Op) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == (table, op))
            .count()
    }

    fn intercept(&self, table: TableId, op: Op) -> Result<()> {
        self.calls.lock().unwrap().push((table, op));
        match self
            .faults
            .lock()
            .unwrap()
            .get_mut(&(table, op))
            .and_then(VecDeque::pop_front)
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn ensure_table(&self, schema: FieldSchema) -> Result<()> {
        self.intercept(schema.table(), Op::EnsureTable)?;
        self.inner.ensure_table(schema).await
    }

    async fn insert(&self, table: TableId, key: &SessionKey, value: StoredValue) -> Result<()> {
        self.stall().await;
        self.intercept(table, Op::Insert)?;
        self.inner.insert(table, key, value).await
    }

    async fn update(&self, table: TableId, key: &SessionKey, value: StoredValue) -> Result<()> {
        self.stall().await;
        self.intercept(table, Op::Update)?;
        self.inner.update(table, key, value).await
    }

    async fn delete_by_key(&self, table: TableId, key: &SessionKey) -> Result<()> {
        self.intercept(table, Op::DeleteByKey)?;
        self.inner.delete_by_key(table, key).await
    }

    async fn delete_all(&self, table: TableId) -> Result<()> {
        self.intercept(table, Op::DeleteAll)?;
        self.inner.delete_all(table).await
    }

    async fn drop_table(&self, table: TableId) -> Result<()> {
        let delay = *self.drop_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.drop_table(table).await
    }

    async fn get(&self, table: TableId, key: &SessionKey) -> Result<Option<StoredRow>> {
        self.inner.get(table, key).await
    }

    async fn row_count(&self, table: TableId) -> Result<usize> {
        self.inner.row_count(table).await
    }

    async fn table_exists(&self, table: TableId) -> bool {
        self.inner.table_exists(table).await
    }

    async fn used_bytes(&self) -> u64 {
        self.inner.used_bytes().await
    }

    fn capacity_bytes(&self) -> u64 {
        self.inner.capacity_bytes()
    }
}

struct DocState {
    cursor: CursorPos,
    scroll: ScrollPos,
    history: JsonValue,
    text: String,
    dirty: bool,
}

/// An open document the tests edit directly.
pub struct TestDocument {
    key: SessionKey,
    state: Mutex<DocState>,
    snapshots: AtomicUsize,
}

impl TestDocument {
    pub fn new(path: &str) -> Arc<Self> {
        Arc::new(Self {
            key: SessionKey::new(path),
            state: Mutex::new(DocState {
                cursor: CursorPos::default(),
                scroll: ScrollPos::default(),
                history: json!({ "done": [], "undone": [] }),
                text: String::new(),
                dirty: false,
            }),
            snapshots: AtomicUsize::new(0),
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key.clone()
    }

    /// Type `text`, moving the cursor to its end and recording an undo step.
    pub fn edit(&self, text: &str) {
        let mut state = self.state.lock().unwrap();
        state.text = text.to_string();
        state.cursor = CursorPos::new(0, text.len() as i64);
        if let Some(done) = state.history["done"].as_array_mut() {
            done.push(json!({ "changes": [{ "text": text }] }));
        }
        state.dirty = true;
    }

    pub fn scroll_to(&self, left: i64, top: i64) {
        self.state.lock().unwrap().scroll = ScrollPos::new(left, top);
    }

    pub fn save(&self) {
        self.state.lock().unwrap().dirty = false;
    }

    /// How many times the document was read as a whole.
    pub fn snapshots(&self) -> usize {
        self.snapshots.load(Ordering::SeqCst)
    }
}

impl DocumentSource for TestDocument {
    fn session_key(&self) -> SessionKey {
        self.key.clone()
    }

    fn cursor(&self) -> CursorPos {
        self.state.lock().unwrap().cursor
    }

    fn scroll(&self) -> ScrollPos {
        self.state.lock().unwrap().scroll
    }

    fn history(&self) -> JsonValue {
        self.state.lock().unwrap().history.clone()
    }

    fn text(&self) -> String {
        self.state.lock().unwrap().text.clone()
    }

    fn is_dirty(&self) -> bool {
        self.state.lock().unwrap().dirty
    }

    fn snapshot(&self) -> EditorSnapshot {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        EditorSnapshot {
            session: self.key.clone(),
            cursor: state.cursor,
            scroll: state.scroll,
            history: state.history.clone(),
            text: state.text.clone(),
            is_dirty: state.dirty,
        }
    }
}

/// A store with the four tables already created.
pub async fn ready_store(capacity: u64) -> Arc<InMemoryRecordStore> {
    let store = Arc::new(InMemoryRecordStore::new(capacity));
    for table in TableId::ALL {
        store.ensure_table(FieldSchema::for_table(table)).await.unwrap();
    }
    store
}

/// Decoded document text stored for `key`, if any.
pub async fn stored_text(store: &dyn RecordStore, key: &SessionKey) -> Option<String> {
    let row = store.get(TableId::Text, key).await.ok()??;
    let encoded = row.value.as_text()?;
    hotclose::codec::decode_value(&hotclose::DeflateCodec::new(), encoded).ok()
}
