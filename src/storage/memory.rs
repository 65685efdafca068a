//! In-Memory Storage
//!
//! Backing store for tests and development. Data is lost on restart.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{CoordinatorStore, DeviceRecord, StorageResult};
use crate::session::PersistedSigning;
use crate::types::{DeviceId, FrostKey, KeyId, SessionId};

/// In-memory coordinator store
#[derive(Clone, Default)]
pub struct MemoryStore {
    keys: Arc<RwLock<HashMap<KeyId, FrostKey>>>,
    devices: Arc<RwLock<HashMap<DeviceId, DeviceRecord>>>,
    sessions: Arc<RwLock<HashMap<SessionId, PersistedSigning>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CoordinatorStore for MemoryStore {
    async fn upsert_key(&self, key: &FrostKey) -> StorageResult<()> {
        self.keys.write().await.insert(key.key_id, key.clone());
        Ok(())
    }

    async fn load_keys(&self) -> StorageResult<Vec<FrostKey>> {
        let keys = self.keys.read().await;
        let mut out: Vec<FrostKey> = keys.values().cloned().collect();
        out.sort_by_key(|k| k.key_id);
        Ok(out)
    }

    async fn upsert_device(&self, record: &DeviceRecord) -> StorageResult<()> {
        self.devices
            .write()
            .await
            .insert(record.device_id, record.clone());
        Ok(())
    }

    async fn load_devices(&self) -> StorageResult<Vec<DeviceRecord>> {
        let devices = self.devices.read().await;
        let mut out: Vec<DeviceRecord> = devices.values().cloned().collect();
        out.sort_by_key(|d| d.device_id);
        Ok(out)
    }

    async fn persist_signing(&self, record: &PersistedSigning) -> StorageResult<()> {
        self.sessions
            .write()
            .await
            .insert(record.session_id, record.clone());
        Ok(())
    }

    async fn load_signing(&self, key_id: &KeyId) -> StorageResult<Option<PersistedSigning>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.values().find(|s| s.key_id == *key_id).cloned())
    }

    async fn purge_signing(&self, session_id: &SessionId) -> StorageResult<bool> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[tokio::test]
    async fn test_round_trips() {
        let store = MemoryStore::new();
        let participants: BTreeSet<_> = [DeviceId([1; 33]), DeviceId([2; 33])].into();
        let key = FrostKey::new(2, participants, vec![7; 8], "k".into()).unwrap();

        store.upsert_key(&key).await.unwrap();
        assert_eq!(store.load_keys().await.unwrap(), vec![key.clone()]);

        let record = DeviceRecord {
            device_id: DeviceId([1; 33]),
            label: Some("Alice".into()),
            nonce_counter: 3,
        };
        store.upsert_device(&record).await.unwrap();
        assert_eq!(store.load_devices().await.unwrap(), vec![record]);
    }
}
