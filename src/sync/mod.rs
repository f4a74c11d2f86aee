pub mod coordinator;
pub mod resolver;

pub use coordinator::{SyncCoordinator, SyncPhase};
pub use resolver::{CapacityManager, CommitPath, FieldOutcome, WriteState};
