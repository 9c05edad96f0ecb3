use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{ObjectReader, ObjectStore};

#[derive(Default)]
struct Objects {
    blobs: BTreeMap<String, Vec<u8>>,
    failing_deletes: HashSet<String>,
}

/// In-process object store. Clones share the same objects.
#[derive(Clone)]
pub struct MemoryStore {
    bucket: String,
    objects: Arc<RwLock<Objects>>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            objects: Arc::new(RwLock::new(Objects::default())),
        }
    }

    pub async fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.objects
            .write()
            .await
            .blobs
            .insert(key.into(), data.into());
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.blobs.get(key).cloned()
    }

    pub async fn get_string(&self, key: &str) -> Option<String> {
        self.get(key)
            .await
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// All keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        self.objects.read().await.blobs.keys().cloned().collect()
    }

    /// Make every later `delete(key)` fail
    pub async fn fail_deletes_of(&self, key: impl Into<String>) {
        self.objects.write().await.failing_deletes.insert(key.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .await
            .blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn reader(&self, key: &str) -> Result<ObjectReader> {
        let data = self
            .get(key)
            .await
            .ok_or_else(|| anyhow!("No such object: {}", self.uri(key)))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn put_bytes(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.insert(key, data).await;
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path).await?;
        self.insert(key, data).await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.write().await;
        if objects.failing_deletes.contains(key) {
            return Err(anyhow!("Access denied deleting {}", key));
        }
        objects.blobs.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_list_filters_by_prefix() {
        let store = MemoryStore::new("b");
        store.insert("horse_data/a.ndjson", "1").await;
        store.insert("horse_data/b.ndjson", "2").await;
        store.insert("other/c.ndjson", "3").await;

        let mut keys = store.list("horse_data/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["horse_data/a.ndjson", "horse_data/b.ndjson"]);
    }

    #[tokio::test]
    async fn test_reader_and_delete() {
        let store = MemoryStore::new("b");
        store.put_bytes("k", b"hello".to_vec()).await.unwrap();

        let mut body = String::new();
        store
            .reader("k")
            .await
            .unwrap()
            .read_to_string(&mut body)
            .await
            .unwrap();
        assert_eq!(body, "hello");

        store.delete("k").await.unwrap();
        assert!(store.reader("k").await.is_err());
    }

    #[tokio::test]
    async fn test_injected_delete_failure() {
        let store = MemoryStore::new("b");
        store.insert("k", "x").await;
        store.fail_deletes_of("k").await;
        assert!(store.delete("k").await.is_err());
        assert!(store.get("k").await.is_some());
    }
}
