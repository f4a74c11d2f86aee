// ============================================================================
// Capacity Manager
// ============================================================================
//
// Drives one field write to a terminal state:
//
//   Attempting --ok--------------------------------------> Committed(Inserted)
//   Attempting --KeyConflict--> ConflictRetry --ok-------> Committed(UpdatedAfterConflict)
//   Attempting --CapacityExceeded--> evict all
//                               --> CapacityRetry --ok---> Committed(InsertedAfterEviction)
//   any retry --err--------------------------------------> PermanentlyFailed
//   Attempting --other err-------------------------------> PermanentlyFailed
//
// At most two store writes per field. Retries never chain.
//
// `rewrite` replays a field whose row an eviction removed. It follows the
// same path but treats a second CapacityExceeded as final instead of evicting.
//
// ============================================================================

use crate::core::{FailureClass, HotCloseError, Result, SessionKey, StoredValue, TableId};
use crate::storage::RecordStore;
use std::sync::Arc;
use tracing::{Level, event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPath {
    Inserted,
    UpdatedAfterConflict,
    InsertedAfterEviction,
    /// Written again after a sibling field's eviction removed the first write.
    RewrittenAfterEviction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteState {
    Attempting,
    ConflictRetry,
    CapacityRetry,
    Committed(CommitPath),
    PermanentlyFailed(HotCloseError),
}

impl WriteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteState::Committed(_) | WriteState::PermanentlyFailed(_))
    }
}

/// Terminal result of one field write, with the states it passed through.
#[derive(Debug, Clone)]
pub struct FieldOutcome {
    pub table: TableId,
    pub session: SessionKey,
    pub state: WriteState,
    pub trail: Vec<WriteState>,
}

impl FieldOutcome {
    /// Outcome for a field that never reached the store.
    pub fn failed_before_write(table: TableId, session: SessionKey, error: HotCloseError) -> Self {
        Self {
            table,
            session,
            state: WriteState::PermanentlyFailed(error),
            trail: Vec::new(),
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self.state, WriteState::Committed(_))
    }

    pub fn commit_path(&self) -> Option<CommitPath> {
        match self.state {
            WriteState::Committed(path) => Some(path),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&HotCloseError> {
        match &self.state {
            WriteState::PermanentlyFailed(err) => Some(err),
            _ => None,
        }
    }

    /// Whether this write wiped the store on its way to a terminal state.
    pub fn caused_eviction(&self) -> bool {
        self.trail.contains(&WriteState::CapacityRetry)
    }

    /// Number of store writes issued for this field.
    pub fn attempts(&self) -> usize {
        self.trail.len()
    }
}

#[derive(Clone)]
pub struct CapacityManager {
    store: Arc<dyn RecordStore>,
}

impl CapacityManager {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Insert-or-update `value` for `key`, resolving conflicts and capacity
    /// overflow locally. Only unrecoverable failures come back as
    /// `PermanentlyFailed`.
    pub async fn upsert(&self, table: TableId, key: &SessionKey, value: StoredValue) -> FieldOutcome {
        self.drive(table, key, value, true).await
    }

    /// Write `value` again after an eviction wiped it, without evicting a
    /// second time. Extends `previous` with the new attempts.
    pub async fn rewrite(&self, previous: FieldOutcome, value: StoredValue) -> FieldOutcome {
        let FieldOutcome {
            table,
            session,
            trail: mut earlier,
            ..
        } = previous;
        let mut outcome = self.drive(table, &session, value, false).await;
        if outcome.is_committed() {
            outcome.state = WriteState::Committed(CommitPath::RewrittenAfterEviction);
        }
        earlier.append(&mut outcome.trail);
        outcome.trail = earlier;
        outcome
    }

    async fn drive(&self, table: TableId, key: &SessionKey, value: StoredValue, allow_evict: bool) -> FieldOutcome {
        let mut state = WriteState::Attempting;
        let mut trail = Vec::with_capacity(2);

        while !state.is_terminal() {
            trail.push(state.clone());
            state = match state {
                WriteState::Attempting => match self.store.insert(table, key, value.clone()).await {
                    Ok(()) => WriteState::Committed(CommitPath::Inserted),
                    Err(err) => match err.failure_class() {
                        FailureClass::Conflict => WriteState::ConflictRetry,
                        FailureClass::Capacity if !allow_evict => WriteState::PermanentlyFailed(err),
                        FailureClass::Capacity => match self.evict_all(table, key).await {
                            Ok(()) => WriteState::CapacityRetry,
                            Err(evict_err) => WriteState::PermanentlyFailed(evict_err),
                        },
                        FailureClass::Other => WriteState::PermanentlyFailed(err),
                    },
                },
                WriteState::ConflictRetry => match self.store.update(table, key, value.clone()).await {
                    Ok(()) => WriteState::Committed(CommitPath::UpdatedAfterConflict),
                    Err(err) => WriteState::PermanentlyFailed(err),
                },
                WriteState::CapacityRetry => match self.store.insert(table, key, value.clone()).await {
                    Ok(()) => WriteState::Committed(CommitPath::InsertedAfterEviction),
                    Err(err) => WriteState::PermanentlyFailed(err),
                },
                terminal => terminal,
            };
        }

        if let WriteState::PermanentlyFailed(err) = &state {
            event!(
                Level::ERROR,
                table = table.name(),
                session = %key,
                attempts = trail.len(),
                error = %err,
                "field write failed permanently"
            );
        }

        FieldOutcome {
            table,
            session: key.clone(),
            state,
            trail,
        }
    }

    /// Wipe every row of every table, for every session.
    pub async fn evict_all(&self, table: TableId, key: &SessionKey) -> Result<()> {
        let used = self.store.used_bytes().await;
        event!(
            Level::WARN,
            table = table.name(),
            session = %key,
            used_bytes = used,
            capacity_bytes = self.store.capacity_bytes(),
            "store full, evicting all rows"
        );
        for table in TableId::ALL {
            self.store.delete_all(table).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FieldSchema, InMemoryRecordStore};

    async fn manager(capacity: u64) -> (Arc<InMemoryRecordStore>, CapacityManager) {
        let store = Arc::new(InMemoryRecordStore::new(capacity));
        for table in TableId::ALL {
            store.ensure_table(FieldSchema::for_table(table)).await.unwrap();
        }
        let manager = CapacityManager::new(store.clone());
        (store, manager)
    }

    #[tokio::test]
    async fn test_first_write_inserts() {
        let (_, manager) = manager(1024).await;
        let outcome = manager
            .upsert(TableId::Cursor, &SessionKey::new("/a"), StoredValue::Position(1, 2))
            .await;
        assert_eq!(outcome.commit_path(), Some(CommitPath::Inserted));
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test]
    async fn test_second_write_updates_after_conflict() {
        let (store, manager) = manager(1024).await;
        let key = SessionKey::new("/a");
        manager.upsert(TableId::Cursor, &key, StoredValue::Position(1, 2)).await;
        let outcome = manager.upsert(TableId::Cursor, &key, StoredValue::Position(5, 6)).await;

        assert_eq!(outcome.commit_path(), Some(CommitPath::UpdatedAfterConflict));
        assert_eq!(outcome.trail, vec![WriteState::Attempting, WriteState::ConflictRetry]);
        assert_eq!(store.row_count(TableId::Cursor).await.unwrap(), 1);
        let row = store.get(TableId::Cursor, &key).await.unwrap().unwrap();
        assert_eq!(row.value, StoredValue::Position(5, 6));
    }

    #[tokio::test]
    async fn test_overflow_evicts_then_inserts() {
        let (store, manager) = manager(40).await;
        let other = SessionKey::new("/other");
        manager
            .upsert(TableId::Text, &other, StoredValue::Text("x".repeat(20)))
            .await;

        let key = SessionKey::new("/mine");
        let outcome = manager
            .upsert(TableId::History, &key, StoredValue::Text("y".repeat(20)))
            .await;

        assert_eq!(outcome.commit_path(), Some(CommitPath::InsertedAfterEviction));
        assert_eq!(store.row_count(TableId::Text).await.unwrap(), 0);
        assert!(store.get(TableId::History, &key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_value_larger_than_store_fails_once() {
        let (_, manager) = manager(8).await;
        let outcome = manager
            .upsert(TableId::Text, &SessionKey::new("/big"), StoredValue::Text("z".repeat(64)))
            .await;

        assert!(matches!(outcome.error(), Some(HotCloseError::CapacityExceeded { .. })));
        assert_eq!(outcome.trail, vec![WriteState::Attempting, WriteState::CapacityRetry]);
    }

    #[tokio::test]
    async fn test_rewrite_never_evicts() {
        let (store, manager) = manager(40).await;
        let other = SessionKey::new("/other");
        manager
            .upsert(TableId::Text, &other, StoredValue::Text("x".repeat(20)))
            .await;

        let key = SessionKey::new("/mine");
        let previous = FieldOutcome::failed_before_write(
            TableId::History,
            key.clone(),
            HotCloseError::NotFound {
                table: TableId::History.name().to_string(),
                key: key.to_string(),
            },
        );
        let outcome = manager.rewrite(previous, StoredValue::Text("y".repeat(20))).await;

        assert!(matches!(outcome.error(), Some(HotCloseError::CapacityExceeded { .. })));
        assert!(!outcome.caused_eviction());
        assert!(store.get(TableId::Text, &other).await.unwrap().is_some());
    }
}
