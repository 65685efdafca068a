//! Persistent Storage
//!
//! Durable records for keys, device metadata and in-flight signing sessions.
//! Implementations: SQLite (production) and in-memory (testing).

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{CoordinatorStore, DeviceRecord, StorageError, StorageResult};
