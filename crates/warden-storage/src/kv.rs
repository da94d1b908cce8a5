//! The `KvStore` trait and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StorageResult;

/// Byte-level key-value storage with namespaced keys.
///
/// Implementations must be safe for concurrent use; `compare_and_set`
/// is the only primitive with atomicity requirements beyond a single
/// operation.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value.
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Write a value, replacing any existing one.
    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()>;

    /// List all keys in a namespace, unordered.
    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>>;

    /// Atomically replace `expected` with `value`.
    ///
    /// `expected = None` means "create only if absent". Returns `true`
    /// if the swap happened, `false` if the current value did not match.
    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool>;
}

/// In-memory store for tests and single-process development.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: RwLock<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning a trait object.
    #[must_use]
    pub fn shared() -> Arc<dyn KvStore> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let data = self.data.read().await;
        Ok(data.get(namespace).and_then(|ns| ns.get(key)).cloned())
    }

    async fn set(&self, namespace: &str, key: &str, value: Vec<u8>) -> StorageResult<()> {
        let mut data = self.data.write().await;
        data.entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> StorageResult<()> {
        let mut data = self.data.write().await;
        if let Some(ns) = data.get_mut(namespace) {
            ns.remove(key);
        }
        Ok(())
    }

    async fn list_keys(&self, namespace: &str) -> StorageResult<Vec<String>> {
        let data = self.data.read().await;
        Ok(data
            .get(namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&[u8]>,
        value: Vec<u8>,
    ) -> StorageResult<bool> {
        let mut data = self.data.write().await;
        let ns = data.entry(namespace.to_string()).or_default();
        let current = ns.get(key).map(Vec::as_slice);
        if current != expected {
            return Ok(false);
        }
        ns.insert(key.to_string(), value);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryKvStore::new();
        store.set("ns", "k", b"value".to_vec()).await.unwrap();
        assert_eq!(store.get("ns", "k").await.unwrap(), Some(b"value".to_vec()));

        store.delete("ns", "k").await.unwrap();
        assert_eq!(store.get("ns", "k").await.unwrap(), None);
        // Deleting again is fine.
        store.delete("ns", "k").await.unwrap();
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let store = MemoryKvStore::new();
        store.set("a", "k", b"1".to_vec()).await.unwrap();
        store.set("b", "k", b"2".to_vec()).await.unwrap();
        assert_eq!(store.get("a", "k").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get("b", "k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn test_list_keys() {
        let store = MemoryKvStore::new();
        store.set("ns", "a", vec![]).await.unwrap();
        store.set("ns", "b", vec![]).await.unwrap();
        let mut keys = store.list_keys("ns").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(store.list_keys("empty").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = MemoryKvStore::new();

        // Create-if-absent.
        assert!(store.compare_and_set("ns", "k", None, b"1".to_vec()).await.unwrap());
        // Second create fails.
        assert!(!store.compare_and_set("ns", "k", None, b"2".to_vec()).await.unwrap());
        // Swap with the right expectation succeeds.
        assert!(
            store
                .compare_and_set("ns", "k", Some(b"1"), b"2".to_vec())
                .await
                .unwrap()
        );
        assert_eq!(store.get("ns", "k").await.unwrap(), Some(b"2".to_vec()));
    }
}
