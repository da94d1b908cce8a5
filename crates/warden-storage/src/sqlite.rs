//! `SQLite`-backed `KvStore`.
//!
//! One table, one row per `(namespace, key)`. The connection lives
//! behind an async mutex and every statement runs under it; `SQLite`
//! serializes writers anyway, so a finer scheme buys nothing here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use crate::error::{StorageError, StorageResult};
use crate::kv::KvStore;

/// Durable store over an embedded `SQLite` database.
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OpenFailed`] if the file cannot be
    /// opened or the schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| StorageError::OpenFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::init(conn, &path.display().to_string())
    }

    /// Open an in-memory database (useful for tests exercising the
    /// `SQLite` code path without a file).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OpenFailed`] if the schema cannot be
    /// created.
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StorageError::OpenFailed {
            path: ":memory:".to_string(),
            message: e.to_string(),
        })?;
        Self::init(conn, ":memory:")
    }

    fn init(conn: Connection, path: &str) -> StorageResult<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                namespace TEXT NOT NULL,
                key       TEXT NOT NULL,
                value     BLOB NOT NULL,
                PRIMARY KEY (namespace, key)
            );",
        )
        .map_err(|e| StorageError::OpenFailed {
            path: path.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl KvStore for SqliteKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let conn = self.conn.lock().await;
        let value = conn
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            params![namespace, key, value],
        )?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM kv WHERE namespace = ?1 AND key = ?2",
            params![namespace, key],
        )?;
        Ok(())
    }

    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT key FROM kv WHERE namespace = ?1")?;
        let keys = stmt
            .query_map(params![namespace], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let current = tx
            .query_row(
                "SELECT value FROM kv WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        if current.as_deref() != expected {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO kv (namespace, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value",
            params![namespace, key, value],
        )?;
        tx.commit()?;
        Ok(true)
    }
}

impl std::fmt::Debug for SqliteKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteKvStore").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");

        let store = SqliteKvStore::open(&path).unwrap();
        store.set("audit", "e1", b"entry".to_vec()).await.unwrap();
        drop(store);

        // Reopen and verify the row survived.
        let store = SqliteKvStore::open(&path).unwrap();
        assert_eq!(store.get("audit", "e1").await.unwrap(), Some(b"entry".to_vec()));
    }

    #[tokio::test]
    async fn test_upsert_replaces() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.set("ns", "k", b"1".to_vec()).await.unwrap();
        store.set("ns", "k", b"2".to_vec()).await.unwrap();
        assert_eq!(store.get("ns", "k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_compare_and_set_transactional() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        assert!(store.compare_and_set("ns", "k", None, b"1".to_vec()).await.unwrap());
        assert!(!store
            .compare_and_set("ns", "k", Some(b"0"), b"2".to_vec())
            .await
            .unwrap());
        assert!(store
            .compare_and_set("ns", "k", Some(b"1"), b"2".to_vec())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_list_keys_per_namespace() {
        let store = SqliteKvStore::open_in_memory().unwrap();
        store.set("a", "k1", vec![]).await.unwrap();
        store.set("a", "k2", vec![]).await.unwrap();
        store.set("b", "k3", vec![]).await.unwrap();
        let mut keys = store.list_keys("a").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["k1", "k2"]);
    }
}
