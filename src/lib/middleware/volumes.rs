//! Pre-start provisioning of distributed ephemeral volumes.
//!
//! Volumes declared without a host path get a fresh volume from the volume
//! service and are bound from `<base_path>/<volume id>`. The id -> container
//! path map is kept on the record under `tags.metadata.codexd.volumes` for
//! the whole cluster lifetime of the container: when a container comes back
//! (here or on another node) any previously allocated volume that is not
//! present locally is pulled in from its latest snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde_json::json;
use tracing::{debug, info, warn};

use super::types::{Middleware, MiddlewareError, MiddlewareResult, SharedSpec};
use crate::lib::cluster::types::{ClusterError, Membership, REMOVE_SNAPSHOT_EVENT, VolumeService};
use crate::lib::store::types::RecordStore;
use crate::lib::tasks::types::ContainerRecord;

pub const VOLUMES_MIDDLEWARE: &str = "codexd";

pub struct VolumeProvisioner {
    volumes: Arc<dyn VolumeService>,
    records: RecordStore,
    membership: Arc<dyn Membership>,
}

impl VolumeProvisioner {
    pub fn new(
        volumes: Arc<dyn VolumeService>,
        records: RecordStore,
        membership: Arc<dyn Membership>,
    ) -> Self {
        VolumeProvisioner {
            volumes,
            records,
            membership,
        }
    }

    /// Allocates one volume per container path. Failed allocations are left
    /// out of the returned id -> container path map.
    async fn allocate(&self, container_paths: Vec<String>) -> BTreeMap<String, String> {
        let attempts = container_paths.into_iter().map(|path| async move {
            let id = self.volumes.create_id();
            match self.volumes.create_volume(&id).await {
                Ok(()) => Some((id, path)),
                Err(e) => {
                    warn!("Failed to allocate volume for {}: {}", path, e);
                    None
                }
            }
        });

        join_all(attempts).await.into_iter().flatten().collect()
    }

    /// Pulls in snapshots of previously allocated volumes missing on this node.
    async fn restore(&self, previous: &BTreeMap<String, String>) -> Vec<ClusterError> {
        let local = match self.volumes.volumes().await {
            Ok(local) => local,
            Err(e) => return vec![e],
        };

        let fetches = previous
            .keys()
            .filter(|id| !local.contains_key(*id))
            .map(|id| async move {
                debug!("Fetching snapshot of volume {}", id);
                match self.volumes.fetch_snapshot(id).await {
                    Ok(()) => {
                        self.membership
                            .send(REMOVE_SNAPSHOT_EVENT, json!({ "id": id }));
                        None
                    }
                    Err(e) => Some(e),
                }
            });

        join_all(fetches).await.into_iter().flatten().collect()
    }

    async fn persist(&self, record: &ContainerRecord) {
        if let Err(e) = self.records.put(record).await {
            warn!(
                "Failed to persist volume metadata for {} container {}: {}",
                record.application_name, record.id, e
            );
        }
    }
}

#[async_trait]
impl Middleware for VolumeProvisioner {
    async fn handle(&self, spec: SharedSpec) -> MiddlewareResult<()> {
        let (pending, previous) = {
            let spec = spec.lock().await;
            let pending: Vec<String> = spec
                .volumes
                .iter()
                .filter(|volume| volume.host.is_none())
                .map(|volume| volume.container.clone())
                .collect();
            (pending, spec.volume_metadata())
        };

        let allocated = self.allocate(pending).await;
        let by_container: HashMap<&str, &str> = allocated
            .iter()
            .map(|(id, path)| (path.as_str(), id.as_str()))
            .collect();

        let bind = |spec: &mut ContainerRecord| {
            for volume in spec.volumes.iter_mut().filter(|v| v.host.is_none()) {
                if let Some(id) = by_container.get(volume.container.as_str()) {
                    volume.host = Some(format!("{}/{}", self.volumes.base_path(), id));
                }
            }
        };

        let Some(previous) = previous else {
            let record = {
                let mut spec = spec.lock().await;
                bind(&mut *spec);
                spec.set_volume_metadata(&allocated);
                spec.clone()
            };
            info!(
                "Provisioned {} volume(s) for {} container {}",
                allocated.len(),
                record.application_name,
                record.id
            );
            self.persist(&record).await;
            return Ok(());
        };

        let mut errors = self.restore(&previous).await;

        // previously allocated ids win over fresh ones
        let mut merged = allocated.clone();
        merged.extend(previous);

        let record = {
            let mut spec = spec.lock().await;
            bind(&mut *spec);
            spec.set_volume_metadata(&merged);
            spec.clone()
        };
        self.persist(&record).await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MiddlewareError::Volume(errors.remove(0)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::cluster::local::LocalMembership;
    use crate::lib::store::memory::MemoryStore;
    use crate::lib::testing::FakeVolumes;
    use crate::lib::tasks::types::VolumeMount;
    use tokio::sync::Mutex;

    const ID: &str = "3f2a1b4c-0d1e-4f5a-8b9c-0123456789ab";

    struct Fixture {
        volumes: Arc<FakeVolumes>,
        membership: Arc<LocalMembership>,
        records: RecordStore,
        provisioner: VolumeProvisioner,
    }

    fn fixture() -> Fixture {
        let volumes = Arc::new(FakeVolumes::new("/mnt/codexd"));
        let membership = Arc::new(LocalMembership::new("node-1"));
        let records = RecordStore::new(Arc::new(MemoryStore::new()), "containers");
        let provisioner = VolumeProvisioner::new(volumes.clone(), records.clone(), membership.clone());
        Fixture {
            volumes,
            membership,
            records,
            provisioner,
        }
    }

    fn mount(host: Option<&str>, container: &str) -> VolumeMount {
        VolumeMount {
            host: host.map(str::to_string),
            container: container.to_string(),
            propagation: None,
        }
    }

    fn spec(volumes: Vec<VolumeMount>) -> SharedSpec {
        let mut record = ContainerRecord::new("db", ID);
        record.volumes = volumes;
        Arc::new(Mutex::new(record))
    }

    #[tokio::test]
    async fn test_first_provisioning_allocates_and_records() {
        let f = fixture();
        let spec = spec(vec![mount(Some("/etc/ssl"), "/ssl"), mount(None, "/data")]);

        f.provisioner.handle(spec.clone()).await.unwrap();

        let spec = spec.lock().await.clone();
        let metadata = spec.volume_metadata().unwrap();
        assert_eq!(metadata.len(), 1);
        let (id, path) = metadata.iter().next().unwrap();
        assert_eq!(path, "/data");
        assert_eq!(spec.volumes[0].host.as_deref(), Some("/etc/ssl"));
        assert_eq!(spec.volumes[1].host, Some(format!("/mnt/codexd/{}", id)));
        assert_eq!(f.volumes.created(), vec![id.clone()]);

        let stored = f.records.get("db", ID).await.unwrap().unwrap();
        assert_eq!(stored.volume_metadata(), Some(metadata));
    }

    #[tokio::test]
    async fn test_failed_allocation_is_dropped() {
        let f = fixture();
        f.volumes.fail_creates(true);
        let spec = spec(vec![mount(None, "/data")]);

        f.provisioner.handle(spec.clone()).await.unwrap();

        let spec = spec.lock().await.clone();
        assert_eq!(spec.volume_metadata(), Some(BTreeMap::new()));
        assert_eq!(spec.volumes[0].host, None);
    }

    #[tokio::test]
    async fn test_reprovisioning_is_idempotent() {
        let f = fixture();
        let spec = spec(vec![mount(None, "/data")]);
        f.provisioner.handle(spec.clone()).await.unwrap();
        let first = f.records.get("db", ID).await.unwrap().unwrap().volume_metadata();

        // the volume lives on this node, so nothing is fetched
        f.provisioner.handle(spec.clone()).await.unwrap();
        let second = f.records.get("db", ID).await.unwrap().unwrap().volume_metadata();

        assert_eq!(first, second);
        assert_eq!(f.volumes.created().len(), 1);
        assert!(f.volumes.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_missing_volumes_are_restored_from_snapshot() {
        let f = fixture();
        let mut events = f.membership.subscribe();

        let mut previous = BTreeMap::new();
        previous.insert("vol-remote".to_string(), "/data".to_string());
        previous.insert("vol-local".to_string(), "/cache".to_string());
        f.volumes.add_local("vol-local");

        let spec = spec(vec![
            mount(Some("/mnt/codexd/vol-remote"), "/data"),
            mount(Some("/mnt/codexd/vol-local"), "/cache"),
            mount(None, "/scratch"),
        ]);
        spec.lock().await.set_volume_metadata(&previous);

        f.provisioner.handle(spec.clone()).await.unwrap();

        assert_eq!(f.volumes.fetched(), vec!["vol-remote".to_string()]);
        let event = events.try_recv().unwrap();
        assert_eq!(event.event, REMOVE_SNAPSHOT_EVENT);
        assert_eq!(event.data["id"], "vol-remote");

        let stored = f.records.get("db", ID).await.unwrap().unwrap();
        let metadata = stored.volume_metadata().unwrap();
        assert_eq!(metadata.len(), 3);
        assert_eq!(metadata["vol-remote"], "/data");
        assert!(metadata.values().any(|path| path == "/scratch"));
    }

    #[tokio::test]
    async fn test_fetch_error_is_reported_after_persisting() {
        let f = fixture();
        f.volumes.fail_snapshots(true);
        let mut events = f.membership.subscribe();

        let mut previous = BTreeMap::new();
        previous.insert("vol-remote".to_string(), "/data".to_string());
        let spec = spec(vec![mount(Some("/mnt/codexd/vol-remote"), "/data")]);
        spec.lock().await.set_volume_metadata(&previous);

        let err = f.provisioner.handle(spec).await.unwrap_err();
        assert!(matches!(err, MiddlewareError::Volume(ClusterError::Snapshot { .. })));
        assert!(events.try_recv().is_err());

        let stored = f.records.get("db", ID).await.unwrap().unwrap();
        assert_eq!(stored.volume_metadata(), Some(previous));
    }
}
