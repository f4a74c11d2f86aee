use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HotCloseError {
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Row for session '{key}' already exists in table '{table}'")]
    KeyConflict { table: String, key: String },

    #[error("Capacity exceeded writing to '{table}': {requested} bytes requested, ceiling is {ceiling} bytes")]
    CapacityExceeded {
        table: String,
        requested: u64,
        ceiling: u64,
    },

    #[error("No row for session '{key}' in table '{table}'")]
    NotFound { table: String, key: String },

    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Capture for session '{0}' was cancelled")]
    Cancelled(String),

    #[error("Lock error: {0}")]
    Lock(String),
}

/// How the capacity manager treats a failed store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// A row already exists for the key; repairable with an update.
    Conflict,
    /// The store is at its byte ceiling; repairable with eviction.
    Capacity,
    /// Everything else. Terminal for the write that hit it.
    Other,
}

impl HotCloseError {
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::KeyConflict { .. } => FailureClass::Conflict,
            Self::CapacityExceeded { .. } => FailureClass::Capacity,
            _ => FailureClass::Other,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        self.failure_class() != FailureClass::Other
    }
}

pub type Result<T> = std::result::Result<T, HotCloseError>;

impl<T> From<std::sync::PoisonError<T>> for HotCloseError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}

impl From<std::io::Error> for HotCloseError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
