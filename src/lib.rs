// ============================================================================
// hotclose Library
// ============================================================================
//
// Keeps an editor's unsaved state (cursor, scroll, undo history, text) in a
// bounded local store so closing a document without saving loses nothing.
//
//   activity -> SyncCoordinator (debounce) -> ChangeCapture (snapshot, codec)
//            -> CapacityManager (insert / update / evict+retry) -> RecordStore
//
// ============================================================================

pub mod capture;
pub mod codec;
pub mod config;
pub mod core;
pub mod facade;
pub mod storage;
pub mod sync;

pub use capture::{CaptureReport, ChangeCapture, CleanupOutcome, DocumentSource, EditorSnapshot};
pub use codec::{Codec, DeflateCodec};
pub use config::HotCloseConfig;
pub use core::{
    CursorPos, FailureClass, HotCloseError, Result, ScrollPos, SessionKey, StoredRow, StoredValue,
    TableId,
};
pub use facade::{DumpedRows, HotClose, RowSelector};
pub use storage::{DurabilityMode, FieldSchema, InMemoryRecordStore, RecordStore};
pub use sync::{CapacityManager, CommitPath, FieldOutcome, SyncCoordinator, SyncPhase, WriteState};
