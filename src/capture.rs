//! Change capture: turns one editor snapshot into four field writes and
//! removes the shadow rows once the document is clean again.

use crate::codec::{Codec, encode_value};
use crate::core::{CursorPos, HotCloseError, Result, ScrollPos, SessionKey, StoredValue, TableId};
use crate::storage::{FieldSchema, RecordStore};
use crate::sync::resolver::{CapacityManager, FieldOutcome, WriteState};
use futures::future::join_all;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{Instrument, Level, event, info_span};

/// Read access to a live document in the editor.
///
/// Every accessor is synchronous; [`DocumentSource::snapshot`] reads them all
/// back to back so the four fields describe the same moment.
pub trait DocumentSource: Send + Sync {
    /// Stable identity of the document, normally its absolute path.
    fn session_key(&self) -> SessionKey;
    fn cursor(&self) -> CursorPos;
    fn scroll(&self) -> ScrollPos;
    /// Undo/redo history as a serializable object.
    fn history(&self) -> JsonValue;
    fn text(&self) -> String;
    fn is_dirty(&self) -> bool;

    fn snapshot(&self) -> EditorSnapshot {
        EditorSnapshot {
            session: self.session_key(),
            cursor: self.cursor(),
            scroll: self.scroll(),
            history: self.history(),
            text: self.text(),
            is_dirty: self.is_dirty(),
        }
    }
}

/// Owned copy of a document's transient state.
#[derive(Debug, Clone, PartialEq)]
pub struct EditorSnapshot {
    pub session: SessionKey,
    pub cursor: CursorPos,
    pub scroll: ScrollPos,
    pub history: JsonValue,
    pub text: String,
    pub is_dirty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    pub failures: Vec<(TableId, HotCloseError)>,
}

impl CleanupOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-field results of one capture. Fields succeed or fail independently.
#[derive(Debug, Clone)]
pub struct CaptureReport {
    pub session: SessionKey,
    pub fields: Vec<FieldOutcome>,
    /// Present when the document was clean and its rows were removed.
    pub cleanup: Option<CleanupOutcome>,
}

impl CaptureReport {
    pub fn field(&self, table: TableId) -> Option<&FieldOutcome> {
        self.fields.iter().find(|outcome| outcome.table == table)
    }

    pub fn committed(&self) -> impl Iterator<Item = &FieldOutcome> {
        self.fields.iter().filter(|outcome| outcome.is_committed())
    }

    pub fn failed(&self) -> impl Iterator<Item = &FieldOutcome> {
        self.fields.iter().filter(|outcome| !outcome.is_committed())
    }

    /// True only when all four fields committed.
    pub fn is_complete(&self) -> bool {
        self.fields.len() == TableId::ALL.len() && self.fields.iter().all(FieldOutcome::is_committed)
    }
}

pub struct ChangeCapture {
    store: Arc<dyn RecordStore>,
    codec: Arc<dyn Codec>,
    resolver: CapacityManager,
    tables_ready: AtomicBool,
}

impl ChangeCapture {
    pub fn new(store: Arc<dyn RecordStore>, codec: Arc<dyn Codec>) -> Self {
        Self {
            resolver: CapacityManager::new(store.clone()),
            store,
            codec,
            tables_ready: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    /// Create any of the four tables that are missing.
    pub async fn ensure_tables(&self) -> Result<()> {
        for table in TableId::ALL {
            self.store.ensure_table(FieldSchema::for_table(table)).await?;
        }
        self.tables_ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Forget that the tables exist, so the next capture recreates them.
    pub fn invalidate_tables(&self) {
        self.tables_ready.store(false, Ordering::SeqCst);
    }

    /// Read `source` now and commit what it holds.
    pub async fn capture_from(&self, source: &dyn DocumentSource) -> CaptureReport {
        let snapshot = source.snapshot();
        self.capture(snapshot).await
    }

    pub async fn capture(&self, snapshot: EditorSnapshot) -> CaptureReport {
        let span = info_span!("hotclose.capture", session = %snapshot.session, dirty = snapshot.is_dirty);
        self.capture_inner(snapshot).instrument(span).await
    }

    async fn capture_inner(&self, snapshot: EditorSnapshot) -> CaptureReport {
        let EditorSnapshot {
            session,
            cursor,
            scroll,
            history,
            text,
            is_dirty,
        } = snapshot;

        if !self.tables_ready.load(Ordering::SeqCst) {
            if let Err(err) = self.ensure_tables().await {
                event!(Level::ERROR, error = %err, "failed to create hot close tables");
                let fields = TableId::ALL
                    .into_iter()
                    .map(|table| FieldOutcome::failed_before_write(table, session.clone(), err.clone()))
                    .collect();
                return CaptureReport {
                    session,
                    fields,
                    cleanup: None,
                };
            }
        }

        let values: Vec<(TableId, Result<StoredValue>)> = vec![
            (TableId::Cursor, Ok(cursor.into())),
            (TableId::Scroll, Ok(scroll.into())),
            (
                TableId::History,
                encode_value(self.codec.as_ref(), &history).map(StoredValue::Text),
            ),
            (
                TableId::Text,
                encode_value(self.codec.as_ref(), &text).map(StoredValue::Text),
            ),
        ];

        let writes = values.iter().map(|(table, value)| {
            let session = &session;
            async move {
                match value {
                    Ok(value) => self.resolver.upsert(*table, session, value.clone()).await,
                    Err(err) => {
                        event!(Level::ERROR, table = table.name(), error = %err, "failed to encode field");
                        FieldOutcome::failed_before_write(*table, session.clone(), err.clone())
                    }
                }
            }
        });
        let fields = join_all(writes).await;
        let fields = self.restore_evicted(&session, fields, &values).await;

        if fields
            .iter()
            .any(|f| matches!(f.error(), Some(HotCloseError::TableNotFound(_))))
        {
            event!(Level::WARN, session = %session, "tables missing, recreating on next capture");
            self.invalidate_tables();
        }

        let cleanup = if is_dirty {
            None
        } else {
            Some(self.cleanup(&session).await)
        };

        event!(
            Level::DEBUG,
            committed = fields.iter().filter(|f| f.is_committed()).count(),
            cleaned = cleanup.is_some(),
            "capture finished"
        );

        CaptureReport {
            session,
            fields,
            cleanup,
        }
    }

    /// An eviction by one field also wipes rows its siblings already wrote.
    /// Each such sibling is written once more, without evicting again.
    async fn restore_evicted(
        &self,
        session: &SessionKey,
        fields: Vec<FieldOutcome>,
        values: &[(TableId, Result<StoredValue>)],
    ) -> Vec<FieldOutcome> {
        if !fields.iter().any(FieldOutcome::caused_eviction) {
            return fields;
        }

        let mut restored = Vec::with_capacity(fields.len());
        for outcome in fields {
            let lost = match &outcome.state {
                WriteState::Committed(_) => matches!(self.store.get(outcome.table, session).await, Ok(None)),
                WriteState::PermanentlyFailed(HotCloseError::NotFound { .. }) => true,
                _ => false,
            };
            let value = values
                .iter()
                .find(|(table, _)| *table == outcome.table)
                .and_then(|(_, value)| value.as_ref().ok());

            match value {
                Some(value) if lost => {
                    event!(Level::DEBUG, table = outcome.table.name(), session = %session, "rewriting evicted field");
                    restored.push(self.resolver.rewrite(outcome, value.clone()).await);
                }
                _ => restored.push(outcome),
            }
        }
        restored
    }

    /// Remove every row for `session`. Failures are reported, not retried.
    pub async fn cleanup(&self, session: &SessionKey) -> CleanupOutcome {
        let deletes = TableId::ALL.into_iter().map(|table| async move {
            (table, self.store.delete_by_key(table, session).await)
        });

        let mut outcome = CleanupOutcome::default();
        for (table, result) in join_all(deletes).await {
            if let Err(err) = result {
                event!(Level::ERROR, table = table.name(), error = %err, "failed to delete clean rows");
                outcome.failures.push((table, err));
            }
        }
        outcome
    }
}
