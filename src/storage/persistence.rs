//! Write-ahead log and snapshot files backing the record store.
//!
//! Every mutation is appended to `hotclose.wal` as a length-prefixed
//! MessagePack record. Once enough records pile up the full table set is
//! written to `hotclose.snapshot` (temp file + rename) and the log is
//! truncated. Recovery loads the snapshot, then replays the log on top.

use super::table::{FieldSchema, FieldTable};
use crate::core::{HotCloseError, Result, SessionKey, StoredValue, TableId};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{Level, event};

pub const WAL_FILE: &str = "hotclose.wal";
pub const SNAPSHOT_FILE: &str = "hotclose.snapshot";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WalEntry {
    CreateTable { schema: FieldSchema },
    Insert { table: TableId, key: SessionKey, value: StoredValue },
    Update { table: TableId, key: SessionKey, value: StoredValue },
    Delete { table: TableId, key: SessionKey },
    DeleteAll { table: TableId },
    DropTable { table: TableId },
}

impl WalEntry {
    fn apply(self, tables: &mut HashMap<TableId, FieldTable>) -> Result<()> {
        match self {
            WalEntry::CreateTable { schema } => {
                tables
                    .entry(schema.table())
                    .or_insert_with(|| FieldTable::new(schema));
            }
            // Replay is idempotent: a crash between snapshot install and log
            // truncation replays records the snapshot already holds.
            WalEntry::Insert { table, key, value } | WalEntry::Update { table, key, value } => {
                if let Some(tbl) = tables.get_mut(&table) {
                    if tbl.contains(&key) {
                        tbl.update(&key, value)?;
                    } else {
                        tbl.insert(&key, value)?;
                    }
                }
            }
            WalEntry::Delete { table, key } => {
                if let Some(tbl) = tables.get_mut(&table) {
                    tbl.delete_by_key(&key);
                }
            }
            WalEntry::DeleteAll { table } => {
                if let Some(tbl) = tables.get_mut(&table) {
                    tbl.clear();
                }
            }
            WalEntry::DropTable { table } => {
                tables.remove(&table);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub version: u32,
    pub created_at_ms: i64,
    pub tables: Vec<FieldTable>,
}

impl StoreSnapshot {
    pub fn new(tables: Vec<FieldTable>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            created_at_ms: Utc::now().timestamp_millis(),
            tables,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// fsync after every record.
    Sync,
    /// Flush to the OS after every record.
    #[default]
    Async,
    /// Nothing touches disk.
    None,
}

impl std::str::FromStr for DurabilityMode {
    type Err = HotCloseError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "sync" => Ok(DurabilityMode::Sync),
            "async" => Ok(DurabilityMode::Async),
            "none" => Ok(DurabilityMode::None),
            other => Err(HotCloseError::Config(format!(
                "unknown durability mode '{}' (expected sync, async or none)",
                other
            ))),
        }
    }
}

fn io_err(context: &str, err: impl std::fmt::Display) -> HotCloseError {
    HotCloseError::Io(format!("{}: {}", context, err))
}

pub struct WalManager {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    mode: DurabilityMode,
    entries_since_checkpoint: usize,
}

impl WalManager {
    pub fn open(path: impl AsRef<Path>, mode: DurabilityMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let writer = if mode == DurabilityMode::None {
            None
        } else {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| io_err("Failed to create WAL directory", e))?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| io_err("Failed to open WAL", e))?;
            Some(BufWriter::new(file))
        };

        Ok(Self {
            path,
            writer,
            mode,
            entries_since_checkpoint: 0,
        })
    }

    pub fn append(&mut self, entry: &WalEntry) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        let payload = rmp_serde::to_vec(entry).map_err(|e| io_err("Failed to encode WAL record", e))?;
        let len = u32::try_from(payload.len()).map_err(|e| io_err("WAL record too large", e))?;

        writer
            .write_all(&len.to_le_bytes())
            .and_then(|_| writer.write_all(&payload))
            .and_then(|_| writer.flush())
            .map_err(|e| io_err("Failed to write WAL", e))?;
        if self.mode == DurabilityMode::Sync {
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| io_err("Failed to sync WAL", e))?;
        }
        self.entries_since_checkpoint += 1;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<WalEntry>> {
        Ok(self.read_valid()?.0)
    }

    /// Every complete record, plus the byte length of the prefix they span.
    /// Anything past that length is a torn append.
    pub fn read_valid(&self) -> Result<(Vec<WalEntry>, u64)> {
        if !self.path.exists() {
            return Ok((Vec::new(), 0));
        }
        let file = File::open(&self.path).map_err(|e| io_err("Failed to open WAL for reading", e))?;
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_bytes = [0u8; 4];
            match reader.read_exact(&mut len_bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err("Failed to read WAL record length", e)),
            }
            let len = u32::from_le_bytes(len_bytes);
            let mut payload = vec![0u8; len as usize];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(io_err("Failed to read WAL record", e)),
            }
            let entry = rmp_serde::from_slice(&payload)
                .map_err(|e| HotCloseError::CorruptData(format!("Bad WAL record: {}", e)))?;
            entries.push(entry);
            valid_len += 4 + u64::from(len);
        }
        Ok((entries, valid_len))
    }

    /// Current size of the log file in bytes.
    pub fn file_len(&self) -> Result<u64> {
        match fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(io_err("Failed to stat WAL", e)),
        }
    }

    /// Cut the log back to `len` bytes; later appends continue from there.
    pub fn truncate_to(&mut self, len: u64) -> Result<()> {
        if self.mode == DurabilityMode::None {
            return Ok(());
        }
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|e| io_err("Failed to flush WAL", e))?;
        }
        self.writer = None;
        {
            let file = OpenOptions::new()
                .write(true)
                .open(&self.path)
                .map_err(|e| io_err("Failed to open WAL for truncation", e))?;
            file.set_len(len)
                .and_then(|_| file.sync_all())
                .map_err(|e| io_err("Failed to truncate WAL", e))?;
        }
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| io_err("Failed to reopen WAL", e))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn truncate(&mut self) -> Result<()> {
        if self.mode == DurabilityMode::None {
            return Ok(());
        }
        self.writer = None;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| io_err("Failed to truncate WAL", e))?;
        self.writer = Some(BufWriter::new(file));
        self.entries_since_checkpoint = 0;
        Ok(())
    }

    pub fn entries_since_checkpoint(&self) -> usize {
        self.entries_since_checkpoint
    }
}

pub struct SnapshotManager {
    path: PathBuf,
}

impl SnapshotManager {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("Failed to create snapshot directory", e))?;
        }
        let payload = rmp_serde::to_vec(snapshot).map_err(|e| io_err("Failed to encode snapshot", e))?;
        let temp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&temp_path).map_err(|e| io_err("Failed to create temp snapshot", e))?;
            let mut writer = BufWriter::new(file);
            writer
                .write_all(&payload)
                .and_then(|_| writer.flush())
                .map_err(|e| io_err("Failed to write snapshot", e))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| io_err("Failed to sync snapshot", e))?;
        }
        fs::rename(&temp_path, &self.path).map_err(|e| io_err("Failed to install snapshot", e))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path).map_err(|e| io_err("Failed to read snapshot", e))?;
        let snapshot: StoreSnapshot = rmp_serde::from_slice(&data)
            .map_err(|e| HotCloseError::CorruptData(format!("Bad snapshot: {}", e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(HotCloseError::CorruptData(format!(
                "Unsupported snapshot version {}",
                snapshot.version
            )));
        }
        Ok(Some(snapshot))
    }
}

pub struct PersistenceManager {
    wal: WalManager,
    snapshot: SnapshotManager,
    mode: DurabilityMode,
    checkpoint_threshold: usize,
}

impl PersistenceManager {
    pub fn open(data_dir: impl AsRef<Path>, mode: DurabilityMode, checkpoint_threshold: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        Ok(Self {
            wal: WalManager::open(data_dir.join(WAL_FILE), mode)?,
            snapshot: SnapshotManager::new(data_dir.join(SNAPSHOT_FILE)),
            mode,
            checkpoint_threshold: checkpoint_threshold.max(1),
        })
    }

    pub fn log(&mut self, entry: &WalEntry) -> Result<()> {
        self.wal.append(entry)
    }

    pub fn needs_checkpoint(&self) -> bool {
        self.wal.entries_since_checkpoint() >= self.checkpoint_threshold
    }

    pub fn checkpoint(&mut self, tables: Vec<FieldTable>) -> Result<()> {
        if self.mode == DurabilityMode::None {
            return Ok(());
        }
        self.snapshot.save(&StoreSnapshot::new(tables))?;
        self.wal.truncate()
    }

    /// Snapshot plus replayed log, with indexes rebuilt. A torn tail is cut
    /// off the log so new records are never appended behind it.
    pub fn recover(&mut self) -> Result<HashMap<TableId, FieldTable>> {
        let mut tables: HashMap<TableId, FieldTable> = match self.snapshot.load()? {
            Some(snapshot) => snapshot
                .tables
                .into_iter()
                .map(|mut table| {
                    table.rebuild_index();
                    (table.schema().table(), table)
                })
                .collect(),
            None => HashMap::new(),
        };

        let (entries, valid_len) = self.wal.read_valid()?;
        for entry in entries {
            entry.apply(&mut tables)?;
        }

        let file_len = self.wal.file_len()?;
        if file_len > valid_len {
            event!(
                Level::WARN,
                dropped_bytes = file_len - valid_len,
                "discarding torn WAL tail"
            );
            self.wal.truncate_to(valid_len)?;
        }
        Ok(tables)
    }

    pub fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub fn mode(&self) -> DurabilityMode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(s: &str) -> SessionKey {
        SessionKey::new(s)
    }

    #[test]
    fn test_wal_append_and_read() {
        let dir = TempDir::new().unwrap();
        let mut wal = WalManager::open(dir.path().join("t.wal"), DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::CreateTable { schema: FieldSchema::for_table(TableId::Cursor) })
            .unwrap();
        wal.append(&WalEntry::Insert {
            table: TableId::Cursor,
            key: key("/a"),
            value: StoredValue::Position(3, 4),
        })
        .unwrap();

        assert_eq!(wal.read_all().unwrap().len(), 2);
        assert_eq!(wal.entries_since_checkpoint(), 2);
    }

    #[test]
    fn test_recovery_replays_log_over_snapshot() {
        let dir = TempDir::new().unwrap();
        let mut persistence = PersistenceManager::open(dir.path(), DurabilityMode::Sync, 100).unwrap();

        let mut table = FieldTable::new(FieldSchema::for_table(TableId::Text));
        table.insert(&key("/a"), StoredValue::Text("old".into())).unwrap();
        persistence.checkpoint(vec![table]).unwrap();
        assert_eq!(persistence.wal().entries_since_checkpoint(), 0);

        persistence
            .log(&WalEntry::Update {
                table: TableId::Text,
                key: key("/a"),
                value: StoredValue::Text("new".into()),
            })
            .unwrap();
        persistence
            .log(&WalEntry::Insert {
                table: TableId::Text,
                key: key("/b"),
                value: StoredValue::Text("b".into()),
            })
            .unwrap();

        let tables = persistence.recover().unwrap();
        let text = tables.get(&TableId::Text).unwrap();
        assert_eq!(text.row_count(), 2);
        assert_eq!(text.get(&key("/a")).unwrap().value, StoredValue::Text("new".into()));
        assert_eq!(text.byte_len(), 2 + 3 + 2 + 1);
    }

    #[test]
    fn test_torn_tail_record_is_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.wal");
        let mut wal = WalManager::open(&path, DurabilityMode::Sync).unwrap();
        wal.append(&WalEntry::DeleteAll { table: TableId::Scroll }).unwrap();
        drop(wal);

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();

        let wal = WalManager::open(&path, DurabilityMode::Sync).unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_recovery_cuts_torn_tail_before_new_appends() {
        let dir = TempDir::new().unwrap();
        let mut persistence = PersistenceManager::open(dir.path(), DurabilityMode::Sync, 100).unwrap();
        persistence
            .log(&WalEntry::CreateTable { schema: FieldSchema::for_table(TableId::Text) })
            .unwrap();
        drop(persistence);

        let wal_path = dir.path().join(WAL_FILE);
        let clean_len = fs::metadata(&wal_path).unwrap().len();
        let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
        file.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(file);

        let mut persistence = PersistenceManager::open(dir.path(), DurabilityMode::Sync, 100).unwrap();
        persistence.recover().unwrap();
        assert_eq!(fs::metadata(&wal_path).unwrap().len(), clean_len);

        persistence
            .log(&WalEntry::Insert {
                table: TableId::Text,
                key: key("/b"),
                value: StoredValue::Text("b".into()),
            })
            .unwrap();
        drop(persistence);

        let mut persistence = PersistenceManager::open(dir.path(), DurabilityMode::Sync, 100).unwrap();
        let tables = persistence.recover().unwrap();
        assert!(tables.get(&TableId::Text).unwrap().get(&key("/b")).is_some());
    }

    #[test]
    fn test_durability_mode_parse() {
        assert_eq!("SYNC".parse::<DurabilityMode>().unwrap(), DurabilityMode::Sync);
        assert!("fast".parse::<DurabilityMode>().is_err());
    }
}
