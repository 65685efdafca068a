//! Storage Trait Definitions
//!
//! The coordinator persists three kinds of records: completed keys, device
//! metadata (labels and nonce counters) and descriptions of in-flight signing
//! sessions. Loading is fail-closed: a record that cannot be decoded is an
//! error, never silently skipped, because acting on partial key or session
//! state risks signing with the wrong material.

use async_trait::async_trait;
use thiserror::Error;

use crate::session::PersistedSigning;
use crate::types::{DeviceId, FrostKey, KeyId, SessionId};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// A stored record exists but cannot be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Key rows are unreadable; signing with this key is impossible
    #[error("key material lost: {0}")]
    KeyMaterialLost(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Persisted per-device metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    pub device_id: DeviceId,
    pub label: Option<String>,
    /// Count of nonces this device has ever had consumed, never decremented
    pub nonce_counter: u64,
}

/// Coordinator persistence interface
///
/// Implementations:
/// - `SqliteStore` - production storage
/// - `MemoryStore` - testing
#[async_trait]
pub trait CoordinatorStore: Send + Sync {
    /// Insert or update a completed key
    async fn upsert_key(&self, key: &FrostKey) -> StorageResult<()>;

    /// Load every stored key
    async fn load_keys(&self) -> StorageResult<Vec<FrostKey>>;

    /// Insert or update one device's metadata
    async fn upsert_device(&self, record: &DeviceRecord) -> StorageResult<()>;

    /// Load all device metadata
    async fn load_devices(&self) -> StorageResult<Vec<DeviceRecord>>;

    /// Persist an in-flight signing session, replacing any earlier
    /// description of the same session
    async fn persist_signing(&self, record: &PersistedSigning) -> StorageResult<()>;

    /// Load the persisted signing session for a key, if any
    async fn load_signing(&self, key_id: &KeyId) -> StorageResult<Option<PersistedSigning>>;

    /// Remove a signing session record once it reaches a terminal state
    async fn purge_signing(&self, session_id: &SessionId) -> StorageResult<bool>;
}
