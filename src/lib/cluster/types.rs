use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Broadcast when a re-attached volume snapshot may be dropped by its holder.
pub const REMOVE_SNAPSHOT_EVENT: &str = "codexd.snapshot.remove";
/// Broadcast when a container could not be loaded on this node.
pub const CONTAINER_UNLOADED_EVENT: &str = "container.unloaded";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    pub id: String,
    #[serde(default)]
    pub tags: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub event: String,
    pub data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("failed to create volume {id}: {reason}")]
    CreateVolume { id: String, reason: String },

    #[error("snapshot for volume {id} unavailable: {reason}")]
    Snapshot { id: String, reason: String },

    #[error("cluster io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Cluster membership: this node's attributes plus cluster-wide broadcast.
pub trait Membership: Send + Sync {
    fn attributes(&self) -> NodeAttributes;

    fn set_tags(&self, tags: Map<String, Value>);

    fn send(&self, event: &str, data: Value);
}

/// Distributed ephemeral volume service.
#[async_trait]
pub trait VolumeService: Send + Sync {
    fn base_path(&self) -> &str;

    fn create_id(&self) -> String;

    async fn create_volume(&self, id: &str) -> ClusterResult<()>;

    /// Volumes available on this node, id -> path.
    async fn volumes(&self) -> ClusterResult<HashMap<String, String>>;

    /// Fetches the latest snapshot of a volume held elsewhere in the cluster.
    async fn fetch_snapshot(&self, id: &str) -> ClusterResult<()>;
}
