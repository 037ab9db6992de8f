pub mod gateway;
pub mod memory;
pub mod snapshot;
pub mod timed;

pub use gateway::{
    DeleteOutcome, PersistenceGateway, ReadMany, ScanResult, StorageError, TracePage,
};
pub use memory::MemoryStore;
pub use snapshot::{SnapshotError, SnapshotManager, SnapshotMetadata, SnapshotWorker};
pub use timed::{TimedGateway, DEFAULT_STORE_TIMEOUT_MS};
