use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::types::{KvStore, StoreResult};

/// In-process key-value store for single-node operation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str, _local: bool) -> StoreResult<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.get("containers::web::a", false).await.unwrap(), None);

        store.set("containers::web::a", "{}".to_string()).await.unwrap();
        assert_eq!(
            store.get("containers::web::a", true).await.unwrap().as_deref(),
            Some("{}")
        );

        store.delete("containers::web::a").await.unwrap();
        store.delete("containers::web::a").await.unwrap();
        assert_eq!(store.get("containers::web::a", false).await.unwrap(), None);
    }
}
