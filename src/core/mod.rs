pub mod error;
pub mod types;

pub use error::{FailureClass, HotCloseError, Result};
pub use types::{CursorPos, ScrollPos, SessionKey, StoredRow, StoredValue, TableId, ValueType};
