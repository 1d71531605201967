use std::sync::Arc;

use tracing::debug;

use super::types::{KEY_DELIMITER, KvStore, RecordStore, StoreError, StoreResult};
use crate::lib::tasks::{state::RecordUpdate, types::ContainerRecord};

impl RecordStore {
    pub fn new(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        RecordStore {
            kv,
            prefix: prefix.to_string(),
        }
    }

    pub fn key(&self, application_name: &str, container_id: &str) -> String {
        [self.prefix.as_str(), application_name, container_id].join(KEY_DELIMITER)
    }

    pub async fn get(
        &self,
        application_name: &str,
        container_id: &str,
    ) -> StoreResult<Option<ContainerRecord>> {
        let key = self.key(application_name, container_id);
        let Some(raw) = self.kv.get(&key, false).await? else {
            return Ok(None);
        };

        let mut record: ContainerRecord =
            serde_json::from_str(&raw).map_err(|source| StoreError::Malformed {
                key: key.clone(),
                source,
            })?;
        if record.application_name.is_empty() {
            record.application_name = application_name.to_string();
        }

        Ok(Some(record))
    }

    /// Blind overwrite of the whole record.
    pub async fn put(&self, record: &ContainerRecord) -> StoreResult<()> {
        let key = self.key(&record.application_name, &record.id);
        let raw = serde_json::to_string(record).map_err(|source| StoreError::Malformed {
            key: key.clone(),
            source,
        })?;
        self.kv.set(&key, raw).await
    }

    pub async fn delete(&self, application_name: &str, container_id: &str) -> StoreResult<()> {
        self.kv
            .delete(&self.key(application_name, container_id))
            .await
    }

    /// Reads the current record, applies `update` and writes it back. A
    /// `respawn=false` update deletes the record instead.
    pub async fn update(
        &self,
        application_name: &str,
        container_id: &str,
        update: &RecordUpdate,
    ) -> StoreResult<()> {
        if update.deletes_record() {
            debug!(
                "Removing {} container {} record (no respawn)",
                application_name, container_id
            );
            return self.delete(application_name, container_id).await;
        }

        let mut record = self
            .get(application_name, container_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(self.key(application_name, container_id)))?;

        record.apply(update);
        self.put(&record).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::store::memory::MemoryStore;
    use crate::lib::tasks::types::Status;

    const ID: &str = "3f2a1b4c-0d1e-4f5a-8b9c-0123456789ab";

    fn store() -> (Arc<MemoryStore>, RecordStore) {
        let kv = Arc::new(MemoryStore::new());
        let records = RecordStore::new(kv.clone(), "containers");
        (kv, records)
    }

    #[tokio::test]
    async fn test_key_layout() {
        let (_, records) = store();
        assert_eq!(records.key("web", ID), format!("containers::web::{}", ID));
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let (kv, records) = store();
        let record = ContainerRecord::new("web", ID);

        records.put(&record).await.unwrap();
        assert!(kv.get(&records.key("web", ID), false).await.unwrap().is_some());
        assert_eq!(records.get("web", ID).await.unwrap(), Some(record));

        records.delete("web", ID).await.unwrap();
        assert_eq!(records.get("web", ID).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_keeps_application_name_in_key_only() {
        let (kv, records) = store();
        kv.set(&records.key("web", ID), format!(r#"{{"id":"{}","image":"nginx"}}"#, ID))
            .await
            .unwrap();

        records.update("web", ID, &RecordUpdate::loaded()).await.unwrap();

        let raw = kv.get(&records.key("web", ID), false).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value.get("application_name").is_none());
        assert_eq!(value["status"], "loaded");
        assert_eq!(records.get("web", ID).await.unwrap().unwrap().application_name, "web");
    }

    #[tokio::test]
    async fn test_update_missing_record_fails() {
        let (_, records) = store();
        let err = records
            .update("web", ID, &RecordUpdate::loaded())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_applies_and_deletes_without_respawn() {
        let (_, records) = store();
        records.put(&ContainerRecord::new("web", ID)).await.unwrap();

        records
            .update("web", ID, &RecordUpdate::loaded().host(Some("node-1".to_string())))
            .await
            .unwrap();
        let record = records.get("web", ID).await.unwrap().unwrap();
        assert_eq!(record.status, Status::Loaded);
        assert_eq!(record.host.as_deref(), Some("node-1"));

        records
            .update("web", ID, &RecordUpdate::released().respawn(Some(false)))
            .await
            .unwrap();
        assert_eq!(records.get("web", ID).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_malformed_record() {
        let (kv, records) = store();
        kv.set(&records.key("web", ID), "{not json".to_string())
            .await
            .unwrap();
        assert!(matches!(
            records.get("web", ID).await,
            Err(StoreError::Malformed { .. })
        ));
    }
}
