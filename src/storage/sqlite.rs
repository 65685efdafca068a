//! SQLite Persistent Storage
//!
//! Durable coordinator state that survives restarts, pooled via r2d2. Keys
//! and device metadata are plain columns; signing session descriptions are
//! stored as JSON because they are written whole and read whole.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;

use super::traits::{CoordinatorStore, DeviceRecord, StorageError, StorageResult};
use crate::session::PersistedSigning;
use crate::types::{DeviceId, FrostKey, KeyId, SessionId};

/// SQLite-backed coordinator store with connection pooling
pub struct SqliteStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteStore {
    /// Create a store at the given database path, running migrations if
    /// needed
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;
        Ok(store)
    }

    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS keys (
                key_id TEXT PRIMARY KEY,
                threshold INTEGER NOT NULL,
                participants TEXT NOT NULL,
                public_material TEXT NOT NULL,
                display_name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS devices (
                device_id TEXT PRIMARY KEY,
                label TEXT,
                nonce_counter INTEGER NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS signing_sessions (
                session_id TEXT PRIMARY KEY,
                key_id TEXT NOT NULL,
                record TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_signing_sessions_key
                ON signing_sessions(key_id);
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    /// Decode one key row; any undecodable field means lost key material
    fn row_to_key(row: &rusqlite::Row) -> Result<FrostKey, StorageError> {
        let key_id_hex: String = row
            .get("key_id")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let lost = |detail: String| StorageError::KeyMaterialLost(format!("{key_id_hex}: {detail}"));

        let key_id: KeyId = key_id_hex.parse().map_err(lost)?;
        let threshold: i64 = row
            .get("threshold")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let participants_json: String = row
            .get("participants")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let participants: BTreeSet<DeviceId> = serde_json::from_str(&participants_json)
            .map_err(|e| StorageError::KeyMaterialLost(format!("{key_id_hex}: {e}")))?;
        let material_hex: String = row
            .get("public_material")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let polynomial_identifier = hex::decode(&material_hex)
            .map_err(|e| StorageError::KeyMaterialLost(format!("{key_id_hex}: {e}")))?;
        let display_name: String = row
            .get("display_name")
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(FrostKey {
            key_id,
            threshold: threshold as u16,
            participants,
            polynomial_identifier,
            display_name,
        })
    }
}

#[async_trait]
impl CoordinatorStore for SqliteStore {
    async fn upsert_key(&self, key: &FrostKey) -> StorageResult<()> {
        let conn = self.conn()?;
        let participants = serde_json::to_string(&key.participants)
            .map_err(|e| StorageError::Database(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO keys (key_id, threshold, participants, public_material, display_name)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(key_id) DO UPDATE SET display_name = excluded.display_name
            "#,
            params![
                key.key_id.to_hex(),
                key.threshold as i64,
                participants,
                hex::encode(&key.polynomial_identifier),
                key.display_name,
            ],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn load_keys(&self) -> StorageResult<Vec<FrostKey>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT * FROM keys ORDER BY key_id")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut keys = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            keys.push(Self::row_to_key(row)?);
        }
        Ok(keys)
    }

    async fn upsert_device(&self, record: &DeviceRecord) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO devices (device_id, label, nonce_counter)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(device_id) DO UPDATE SET
                label = excluded.label,
                nonce_counter = excluded.nonce_counter
            "#,
            params![
                record.device_id.to_hex(),
                record.label,
                record.nonce_counter as i64,
            ],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn load_devices(&self) -> StorageResult<Vec<DeviceRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT device_id, label, nonce_counter FROM devices ORDER BY device_id")
            .map_err(|e| StorageError::Database(e.to_string()))?;
        let mut rows = stmt
            .query([])
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut devices = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| StorageError::Database(e.to_string()))?
        {
            let device_id_hex: String = row
                .get(0)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let device_id: DeviceId = device_id_hex
                .parse()
                .map_err(|e: String| StorageError::Corrupt(format!("device {device_id_hex}: {e}")))?;
            let label: Option<String> = row
                .get(1)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            let nonce_counter: i64 = row
                .get(2)
                .map_err(|e| StorageError::Database(e.to_string()))?;
            devices.push(DeviceRecord {
                device_id,
                label,
                nonce_counter: nonce_counter as u64,
            });
        }
        Ok(devices)
    }

    async fn persist_signing(&self, record: &PersistedSigning) -> StorageResult<()> {
        let conn = self.conn()?;
        let json =
            serde_json::to_string(record).map_err(|e| StorageError::Database(e.to_string()))?;
        conn.execute(
            r#"
            INSERT INTO signing_sessions (session_id, key_id, record)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(session_id) DO UPDATE SET record = excluded.record
            "#,
            params![
                record.session_id.to_string(),
                record.key_id.to_hex(),
                json
            ],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(())
    }

    async fn load_signing(&self, key_id: &KeyId) -> StorageResult<Option<PersistedSigning>> {
        let conn = self.conn()?;
        let json: Option<String> = conn
            .query_row(
                "SELECT record FROM signing_sessions WHERE key_id = ?1",
                params![key_id.to_hex()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        match json {
            Some(json) => {
                let record = serde_json::from_str(&json).map_err(|e| {
                    StorageError::Corrupt(format!("signing session for key {key_id}: {e}"))
                })?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn purge_signing(&self, session_id: &SessionId) -> StorageResult<bool> {
        let conn = self.conn()?;
        let deleted = conn
            .execute(
                "DELETE FROM signing_sessions WHERE session_id = ?1",
                params![session_id.to_string()],
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(deleted > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::NonceCommitment;
    use crate::types::SignTask;
    use std::collections::BTreeMap;

    fn device(n: u8) -> DeviceId {
        DeviceId([n; 33])
    }

    fn sample_key() -> FrostKey {
        FrostKey::new(
            2,
            [device(1), device(2), device(3)].into(),
            vec![0xcd; 33],
            "vault".into(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_key_round_trip_and_rename() {
        let store = SqliteStore::in_memory().unwrap();
        let mut key = sample_key();
        store.upsert_key(&key).await.unwrap();

        key.display_name = "renamed".into();
        store.upsert_key(&key).await.unwrap();

        let loaded = store.load_keys().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], key);
    }

    #[tokio::test]
    async fn test_device_round_trip() {
        let store = SqliteStore::in_memory().unwrap();
        let record = DeviceRecord {
            device_id: device(5),
            label: Some("Bob".into()),
            nonce_counter: 12,
        };
        store.upsert_device(&record).await.unwrap();

        let updated = DeviceRecord {
            nonce_counter: 13,
            ..record.clone()
        };
        store.upsert_device(&updated).await.unwrap();
        assert_eq!(store.load_devices().await.unwrap(), vec![updated]);
    }

    #[tokio::test]
    async fn test_signing_session_persist_load_purge() {
        let store = SqliteStore::in_memory().unwrap();
        let key = sample_key();
        let record = PersistedSigning {
            session_id: SessionId::random(),
            key_id: key.key_id,
            task: SignTask::Message {
                message: "hi".into(),
            },
            required: key.participants.clone(),
            commitments: BTreeMap::from([(
                device(1),
                NonceCommitment {
                    index: 0,
                    commitment: vec![1, 2, 3],
                },
            )]),
            collected: BTreeMap::from([(device(1), vec![9, 9])]),
            discarded: Default::default(),
            started_at: chrono::Utc::now(),
        };

        store.persist_signing(&record).await.unwrap();
        let loaded = store.load_signing(&key.key_id).await.unwrap().unwrap();
        assert_eq!(loaded.session_id, record.session_id);
        assert_eq!(loaded.collected, record.collected);

        assert!(store.purge_signing(&record.session_id).await.unwrap());
        assert!(store.load_signing(&key.key_id).await.unwrap().is_none());
        // purging twice reports nothing deleted
        assert!(!store.purge_signing(&record.session_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_session_record_fails_closed() {
        let store = SqliteStore::in_memory().unwrap();
        let key = sample_key();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO signing_sessions (session_id, key_id, record) VALUES (?1, ?2, ?3)",
                params![SessionId::random().to_string(), key.key_id.to_hex(), "{not json"],
            )
            .unwrap();
        }
        let err = store.load_signing(&key.key_id).await.unwrap_err();
        assert!(matches!(err, StorageError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_unreadable_key_row_is_key_material_lost() {
        let store = SqliteStore::in_memory().unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                r#"INSERT INTO keys (key_id, threshold, participants, public_material, display_name)
                   VALUES ('zz-not-hex', 2, '[]', 'zz', 'broken')"#,
                [],
            )
            .unwrap();
        }
        let err = store.load_keys().await.unwrap_err();
        assert!(matches!(err, StorageError::KeyMaterialLost(_)));
    }
}
