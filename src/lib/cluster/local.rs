use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{
    ClusterError, ClusterEvent, ClusterResult, Membership, NodeAttributes, VolumeService,
};

const EVENT_BUFFER: usize = 64;

/// Single-node membership. Broadcast events go to local subscribers only.
#[derive(Debug)]
pub struct LocalMembership {
    attributes: RwLock<NodeAttributes>,
    events: broadcast::Sender<ClusterEvent>,
}

impl LocalMembership {
    pub fn new(node_id: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        LocalMembership {
            attributes: RwLock::new(NodeAttributes {
                id: node_id.to_string(),
                tags: Map::new(),
            }),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events.subscribe()
    }
}

impl Membership for LocalMembership {
    fn attributes(&self) -> NodeAttributes {
        match self.attributes.read() {
            Ok(attributes) => attributes.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_tags(&self, tags: Map<String, Value>) {
        match self.attributes.write() {
            Ok(mut attributes) => attributes.tags = tags,
            Err(poisoned) => poisoned.into_inner().tags = tags,
        }
    }

    fn send(&self, event: &str, data: Value) {
        debug!("Broadcasting {}", event);
        // no subscribers is fine
        let _ = self.events.send(ClusterEvent {
            event: event.to_string(),
            data,
        });
    }
}

/// Volumes backed by directories under `base_path`. Nothing is replicated,
/// so snapshots of volumes that are not already here cannot be fetched.
#[derive(Debug, Clone)]
pub struct LocalVolumeService {
    base_path: String,
}

impl LocalVolumeService {
    pub fn new(base_path: &str) -> Self {
        LocalVolumeService {
            base_path: base_path.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl VolumeService for LocalVolumeService {
    fn base_path(&self) -> &str {
        &self.base_path
    }

    fn create_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    async fn create_volume(&self, id: &str) -> ClusterResult<()> {
        let path = Path::new(&self.base_path).join(id);
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| ClusterError::CreateVolume {
                id: id.to_string(),
                reason: e.to_string(),
            })
    }

    async fn volumes(&self) -> ClusterResult<HashMap<String, String>> {
        let mut volumes = HashMap::new();
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(volumes),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                volumes.insert(
                    entry.file_name().to_string_lossy().into_owned(),
                    entry.path().to_string_lossy().into_owned(),
                );
            }
        }

        Ok(volumes)
    }

    async fn fetch_snapshot(&self, id: &str) -> ClusterResult<()> {
        Err(ClusterError::Snapshot {
            id: id.to_string(),
            reason: "no replicas reachable from a local volume service".to_string(),
        })
    }
}
