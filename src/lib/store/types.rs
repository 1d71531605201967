use std::sync::Arc;

use async_trait::async_trait;

pub const KEY_DELIMITER: &str = "::";
pub const DEFAULT_CONTAINERS_PREFIX: &str = "containership::containers";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("malformed record at {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Backend outage. The in-process store never reports one.
    #[allow(dead_code)]
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Distributed key-value store the container records live in.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// `local` asks for the node's replica instead of a cluster-consistent read.
    async fn get(&self, key: &str, local: bool) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: String) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Typed access to container records keyed by `prefix::application::id`.
#[derive(Clone)]
pub struct RecordStore {
    pub(super) kv: Arc<dyn KvStore>,
    pub(super) prefix: String,
}
