//! Settings Store: instruction text keyed by user or by (group, user).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use relay_kernel::ScopeKey;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Reads of a key that was never written return the empty string.
/// Writes are plain upserts; the last one wins.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get(&self, key: &ScopeKey) -> Result<String, StoreError>;
    async fn set(&self, key: &ScopeKey, instruction: &str) -> Result<(), StoreError>;
}

pub fn open_store(cfg: &relay_config::Store) -> Result<Arc<dyn SettingsStore>, String> {
    if cfg.kind == "sqlite" {
        let sqlite_path = cfg
            .sqlite_path
            .as_deref()
            .ok_or_else(|| "store.sqlite_path is required for sqlite store".to_string())?;
        let store = SqliteStore::open(sqlite_path).map_err(|e| e.to_string())?;
        Ok(Arc::new(store))
    } else {
        Ok(Arc::new(MemoryStore::default()))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    settings: Mutex<HashMap<ScopeKey, String>>,
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn get(&self, key: &ScopeKey) -> Result<String, StoreError> {
        Ok(self
            .settings
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn set(&self, key: &ScopeKey, instruction: &str) -> Result<(), StoreError> {
        self.settings
            .lock()
            .await
            .insert(key.clone(), instruction.to_string());
        Ok(())
    }
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS user_settings (
                user_id TEXT PRIMARY KEY,
                system_instruction TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS group_user_settings (
                group_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                system_instruction TEXT NOT NULL,
                PRIMARY KEY (group_id, user_id)
            );
            ",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get(&self, key: &ScopeKey) -> Result<String, StoreError> {
        let conn = self.conn.lock().await;
        let instruction: Option<String> = match key {
            ScopeKey::User { user_id } => conn
                .query_row(
                    "SELECT system_instruction FROM user_settings WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?,
            ScopeKey::GroupUser { group_id, user_id } => conn
                .query_row(
                    "SELECT system_instruction FROM group_user_settings
                     WHERE group_id = ?1 AND user_id = ?2",
                    params![group_id, user_id],
                    |row| row.get(0),
                )
                .optional()?,
        };
        Ok(instruction.unwrap_or_default())
    }

    async fn set(&self, key: &ScopeKey, instruction: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        match key {
            ScopeKey::User { user_id } => conn.execute(
                "
                INSERT INTO user_settings (user_id, system_instruction)
                VALUES (?1, ?2)
                ON CONFLICT(user_id) DO UPDATE SET
                    system_instruction=excluded.system_instruction
                ",
                params![user_id, instruction],
            )?,
            ScopeKey::GroupUser { group_id, user_id } => conn.execute(
                "
                INSERT INTO group_user_settings (group_id, user_id, system_instruction)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(group_id, user_id) DO UPDATE SET
                    system_instruction=excluded.system_instruction
                ",
                params![group_id, user_id, instruction],
            )?,
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn user(id: &str) -> ScopeKey {
        ScopeKey::User {
            user_id: id.to_string(),
        }
    }

    fn member(group: &str, id: &str) -> ScopeKey {
        ScopeKey::GroupUser {
            group_id: group.to_string(),
            user_id: id.to_string(),
        }
    }

    async fn exercise(store: &dyn SettingsStore) {
        assert_eq!(store.get(&user("U1")).await.unwrap(), "");
        assert_eq!(store.get(&member("C1", "U1")).await.unwrap(), "");

        store.set(&user("U1"), "be terse").await.unwrap();
        store.set(&member("C1", "U1"), "speak French").await.unwrap();
        store.set(&member("C1", "U1"), "speak German").await.unwrap();

        assert_eq!(store.get(&user("U1")).await.unwrap(), "be terse");
        assert_eq!(store.get(&member("C1", "U1")).await.unwrap(), "speak German");
        assert_eq!(store.get(&member("C2", "U1")).await.unwrap(), "");
        assert_eq!(
            store.get(&ScopeKey::group_default("C1")).await.unwrap(),
            ""
        );
    }

    #[tokio::test]
    async fn memory_store_last_write_wins() {
        exercise(&MemoryStore::default()).await;
    }

    #[tokio::test]
    async fn sqlite_store_last_write_wins() {
        exercise(&SqliteStore::open_in_memory().unwrap()).await;
    }

    #[tokio::test]
    async fn sqlite_failures_surface_as_store_errors() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .conn
            .lock()
            .await
            .execute_batch("DROP TABLE user_settings;")
            .unwrap();

        let err = store.get(&user("U1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
        let err = store.set(&user("U1"), "x").await.unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[tokio::test]
    async fn sqlite_store_persists_across_reopen() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("linerelay-store-{nanos}.db"));
        let path = path.to_string_lossy().to_string();

        {
            let store = SqliteStore::open(&path).unwrap();
            store
                .set(&ScopeKey::group_default("C9"), "reply in haiku")
                .await
                .unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(
            reopened.get(&ScopeKey::group_default("C9")).await.unwrap(),
            "reply in haiku"
        );
        let _ = std::fs::remove_file(&path);
    }
}
