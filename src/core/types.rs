use super::{HotCloseError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Identity of an open document, used as the row key in every table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(String);

impl SessionKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn from_path(path: impl AsRef<Path>) -> Self {
        Self(path.as_ref().to_string_lossy().into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn byte_len(&self) -> u64 {
        self.0.len() as u64
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    /// Two integer coordinates.
    Position,
    /// Opaque codec output.
    Text,
}

impl ValueType {
    pub fn is_compatible(&self, value: &StoredValue) -> bool {
        matches!(
            (self, value),
            (ValueType::Position, StoredValue::Position(_, _)) | (ValueType::Text, StoredValue::Text(_))
        )
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Position => write!(f, "INTEGER"),
            ValueType::Text => write!(f, "TEXT"),
        }
    }
}

/// The four tables of the store. The set is closed: table names never come
/// from callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableId {
    Cursor,
    Scroll,
    History,
    Text,
}

impl TableId {
    pub const ALL: [TableId; 4] = [TableId::Cursor, TableId::Scroll, TableId::History, TableId::Text];

    pub fn name(&self) -> &'static str {
        match self {
            TableId::Cursor => "cursorpos_coords",
            TableId::Scroll => "scrollpos_coords",
            TableId::History => "undo_redo_history",
            TableId::Text => "unsaved_doc_changes",
        }
    }

    pub fn value_column(&self) -> &'static str {
        match self {
            TableId::Cursor => "int__CursorPos",
            TableId::Scroll => "int__ScrollPos",
            TableId::History => "str__DocHistory",
            TableId::Text => "str__DocTxt",
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            TableId::Cursor | TableId::Scroll => ValueType::Position,
            TableId::History | TableId::Text => ValueType::Text,
        }
    }

    pub fn from_name(name: &str) -> Option<TableId> {
        TableId::ALL.into_iter().find(|table| table.name() == name)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredValue {
    Position(i64, i64),
    Text(String),
}

impl StoredValue {
    /// Bytes charged against the store ceiling for this value.
    pub fn byte_len(&self) -> u64 {
        match self {
            StoredValue::Position(_, _) => 16,
            StoredValue::Text(text) => text.len() as u64,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            StoredValue::Position(_, _) => "INTEGER",
            StoredValue::Text(_) => "TEXT",
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(text) => Some(text),
            StoredValue::Position(_, _) => None,
        }
    }
}

/// One live row: `(id, session_id UNIQUE, value)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub id: u64,
    pub session_id: SessionKey,
    pub value: StoredValue,
}

impl StoredRow {
    pub fn byte_len(&self) -> u64 {
        self.session_id.byte_len() + self.value.byte_len()
    }
}

/// Cursor location as reported by the editor (0-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CursorPos {
    pub line: i64,
    pub ch: i64,
}

impl CursorPos {
    pub fn new(line: i64, ch: i64) -> Self {
        Self { line, ch }
    }
}

impl From<CursorPos> for StoredValue {
    fn from(pos: CursorPos) -> Self {
        StoredValue::Position(pos.line, pos.ch)
    }
}

impl TryFrom<&StoredValue> for CursorPos {
    type Error = HotCloseError;

    fn try_from(value: &StoredValue) -> Result<Self> {
        match value {
            StoredValue::Position(line, ch) => Ok(CursorPos::new(*line, *ch)),
            other => Err(HotCloseError::TypeMismatch(format!(
                "cursor position expects INTEGER pair, got {}",
                other.type_name()
            ))),
        }
    }
}

/// Scroll offset in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScrollPos {
    pub left: i64,
    pub top: i64,
}

impl ScrollPos {
    pub fn new(left: i64, top: i64) -> Self {
        Self { left, top }
    }
}

impl From<ScrollPos> for StoredValue {
    fn from(pos: ScrollPos) -> Self {
        StoredValue::Position(pos.left, pos.top)
    }
}

impl TryFrom<&StoredValue> for ScrollPos {
    type Error = HotCloseError;

    fn try_from(value: &StoredValue) -> Result<Self> {
        match value {
            StoredValue::Position(left, top) => Ok(ScrollPos::new(*left, *top)),
            other => Err(HotCloseError::TypeMismatch(format!(
                "scroll position expects INTEGER pair, got {}",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_stable() {
        let names: Vec<_> = TableId::ALL.iter().map(|t| t.name()).collect();
        assert_eq!(
            names,
            vec!["cursorpos_coords", "scrollpos_coords", "undo_redo_history", "unsaved_doc_changes"]
        );
        assert_eq!(TableId::from_name("undo_redo_history"), Some(TableId::History));
        assert_eq!(TableId::from_name("users"), None);
    }

    #[test]
    fn test_value_type_compatibility() {
        assert!(ValueType::Position.is_compatible(&StoredValue::Position(1, 2)));
        assert!(!ValueType::Position.is_compatible(&StoredValue::Text("x".into())));
        assert!(ValueType::Text.is_compatible(&StoredValue::Text(String::new())));
    }

    #[test]
    fn test_cursor_from_text_is_type_mismatch() {
        let err = CursorPos::try_from(&StoredValue::Text("1,2".into())).unwrap_err();
        assert!(matches!(err, HotCloseError::TypeMismatch(_)));
    }
}
