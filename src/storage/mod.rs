pub mod engine;
pub mod memory;
pub mod persistence;
pub mod table;

pub use engine::RecordStore;
pub use memory::InMemoryRecordStore;
pub use persistence::{DurabilityMode, PersistenceManager};
pub use table::{FieldSchema, FieldTable};
