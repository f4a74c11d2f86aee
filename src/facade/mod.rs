// ============================================================================
// Hot Close Facade
// ============================================================================
//
// Entry point for the editor. Owns the store, the change capture and the
// sync coordinator. If the store cannot be opened the facade still comes
// up, but every operation fails fast with `StoreUnavailable`.
//
// ============================================================================

use crate::capture::{CaptureReport, ChangeCapture, DocumentSource};
use crate::codec::{Codec, DeflateCodec, decode_value};
use crate::config::HotCloseConfig;
use crate::core::{CursorPos, HotCloseError, Result, ScrollPos, SessionKey, StoredRow, TableId};
use crate::storage::{InMemoryRecordStore, RecordStore};
use crate::sync::SyncCoordinator;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{Level, event};

/// Which rows `delete_rows` removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSelector {
    Session(SessionKey),
    All,
}

/// Decoded contents of the four tables for one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DumpedRows {
    pub cursor: Option<CursorPos>,
    pub scroll: Option<ScrollPos>,
    pub history: Option<JsonValue>,
    pub text: Option<String>,
}

impl DumpedRows {
    pub fn is_empty(&self) -> bool {
        self.cursor.is_none() && self.scroll.is_none() && self.history.is_none() && self.text.is_none()
    }
}

enum Backend {
    Ready {
        capture: Arc<ChangeCapture>,
        coordinator: SyncCoordinator,
    },
    Unavailable(String),
}

pub struct HotClose {
    config: HotCloseConfig,
    backend: Backend,
}

impl HotClose {
    /// Open the configured store and create the tables if needed.
    pub async fn open(config: HotCloseConfig) -> Self {
        let store = config
            .validate()
            .and_then(|_| InMemoryRecordStore::open(&config));
        match store {
            Ok(store) => Self::with_store(config, Arc::new(store), Arc::new(DeflateCodec::new())).await,
            Err(err) => Self::unavailable(config, err),
        }
    }

    /// Run against a caller-supplied store and codec.
    pub async fn with_store(
        config: HotCloseConfig,
        store: Arc<dyn RecordStore>,
        codec: Arc<dyn Codec>,
    ) -> Self {
        let capture = Arc::new(ChangeCapture::new(store, codec));
        if let Err(err) = capture.ensure_tables().await {
            return Self::unavailable(config, err);
        }
        let coordinator = SyncCoordinator::new(capture.clone(), config.debounce, config.enabled);
        Self {
            config,
            backend: Backend::Ready { capture, coordinator },
        }
    }

    fn unavailable(config: HotCloseConfig, err: HotCloseError) -> Self {
        event!(Level::ERROR, error = %err, "hot close store failed to initialize");
        Self {
            config,
            backend: Backend::Unavailable(err.to_string()),
        }
    }

    fn ready(&self) -> Result<(&Arc<ChangeCapture>, &SyncCoordinator)> {
        match &self.backend {
            Backend::Ready { capture, coordinator } => Ok((capture, coordinator)),
            Backend::Unavailable(reason) => Err(HotCloseError::StoreUnavailable(reason.clone())),
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self.backend, Backend::Ready { .. })
    }

    pub fn config(&self) -> &HotCloseConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Option<&SyncCoordinator> {
        self.ready().ok().map(|(_, coordinator)| coordinator)
    }

    pub fn store(&self) -> Option<&Arc<dyn RecordStore>> {
        self.ready().ok().map(|(capture, _)| capture.store())
    }

    /// Capture `source` right away, e.g. while its document is closing.
    pub async fn capture_unsaved_changes(&self, source: Arc<dyn DocumentSource>) -> Result<CaptureReport> {
        let (_, coordinator) = self.ready()?;
        coordinator.capture_now(source).await
    }

    /// Note editor activity on `source`; a capture follows once activity has
    /// been quiet for `delay` (the configured debounce when `None`).
    pub fn schedule_debounced_capture(
        &self,
        source: Arc<dyn DocumentSource>,
        delay: Option<Duration>,
    ) -> Result<()> {
        let (_, coordinator) = self.ready()?;
        coordinator.schedule(source, delay);
        Ok(())
    }

    /// Must be called when a document closes before its window fires.
    pub fn cancel(&self, session: &SessionKey) -> Result<bool> {
        let (_, coordinator) = self.ready()?;
        Ok(coordinator.cancel(session))
    }

    pub async fn delete_rows(&self, selector: RowSelector) -> Result<()> {
        let (capture, _) = self.ready()?;
        match selector {
            RowSelector::Session(session) => {
                let outcome = capture.cleanup(&session).await;
                match outcome.failures.into_iter().next() {
                    Some((_, err)) => Err(err),
                    None => Ok(()),
                }
            }
            RowSelector::All => {
                let mut first_error = None;
                for table in TableId::ALL {
                    if let Err(err) = capture.store().delete_all(table).await {
                        event!(Level::ERROR, table = table.name(), error = %err, "failed to clear table");
                        first_error.get_or_insert(err);
                    }
                }
                first_error.map_or(Ok(()), Err)
            }
        }
    }

    /// Drop all four tables. They are recreated before the next capture.
    pub async fn wipe_store(&self) -> Result<()> {
        let (capture, _) = self.ready()?;
        let result = drop_all_tables(capture.store().as_ref()).await;
        // Only after the drops; a capture running meanwhile may have marked them ready.
        capture.invalidate_tables();
        result?;
        event!(Level::INFO, "hot close store wiped");
        Ok(())
    }

    /// Read back and decode what is stored for `session`.
    pub async fn dump_rows(&self, session: &SessionKey) -> Result<DumpedRows> {
        let (capture, _) = self.ready()?;
        let store = capture.store();
        let codec: &dyn Codec = capture.codec().as_ref();
        let mut dump = DumpedRows::default();

        for table in TableId::ALL {
            let Some(row) = read_row(store.as_ref(), table, session).await? else {
                continue;
            };
            match table {
                TableId::Cursor => dump.cursor = Some(CursorPos::try_from(&row.value)?),
                TableId::Scroll => dump.scroll = Some(ScrollPos::try_from(&row.value)?),
                TableId::History => dump.history = Some(decode_value(codec, text_of(&row)?)?),
                TableId::Text => dump.text = Some(decode_value(codec, text_of(&row)?)?),
            }
        }

        event!(Level::DEBUG, session = %session, dump = ?dump, "hot close rows");
        Ok(dump)
    }

    /// Reports of completed captures.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<CaptureReport>> {
        let (_, coordinator) = self.ready()?;
        Ok(coordinator.subscribe())
    }
}

async fn drop_all_tables(store: &dyn RecordStore) -> Result<()> {
    for table in TableId::ALL {
        store.drop_table(table).await?;
    }
    Ok(())
}

async fn read_row(store: &dyn RecordStore, table: TableId, session: &SessionKey) -> Result<Option<StoredRow>> {
    match store.get(table, session).await {
        Err(HotCloseError::TableNotFound(_)) => Ok(None),
        other => other,
    }
}

fn text_of(row: &StoredRow) -> Result<&str> {
    row.value.as_text().ok_or_else(|| {
        HotCloseError::TypeMismatch(format!(
            "expected TEXT in '{}', got {}",
            row.session_id,
            row.value.type_name()
        ))
    })
}
