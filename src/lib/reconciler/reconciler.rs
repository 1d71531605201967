use futures_util::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ports::derive_ports;
use crate::lib::tasks::executor::ATTACH_VERB;
use crate::lib::tasks::state::RecordUpdate;
use crate::lib::tasks::types::{ContainerSummary, ManagedName, ObservedContainer};
use crate::lib::worker::types::{Tracking, Worker};

impl Worker {
    /// Starts a reconciliation pass in the background.
    pub fn reconcile(&self) -> JoinHandle<()> {
        let worker = self.clone();
        tokio::spawn(async move { worker.reconcile_pass().await })
    }

    /// Heals divergence between the engine, the local processes and the
    /// records. Safe to run repeatedly and alongside starts and stops.
    pub(crate) async fn reconcile_pass(&self) {
        let containers = match self.engine.list_containers(true).await {
            Ok(containers) => containers,
            Err(e) => {
                debug!("Skipping {} reconciliation: {}", self.name(), e);
                return;
            }
        };

        let node_id = self.node_id();
        join_all(
            containers
                .into_iter()
                .map(|container| self.reconcile_container(container, &node_id)),
        )
        .await;
    }

    async fn reconcile_container(&self, container: ContainerSummary, node_id: &str) {
        let Some(ManagedName {
            application_name,
            container_id,
        }) = ManagedName::parse(&container.name)
        else {
            return;
        };

        // inspect failures are transient, the next pass retries
        let observed = match self.engine.inspect(&container.runtime_id).await {
            Ok(observed) => observed,
            Err(e) => {
                debug!("Failed to inspect {}: {}", container.name, e);
                return;
            }
        };

        if !observed.running && !observed.restarting {
            if self.engine.remove(&observed.runtime_id, false).await.is_ok() {
                debug!(
                    "Cleaned up dead {} container {}",
                    application_name, container_id
                );
            }
            return;
        }

        let (host_port, container_port) = derive_ports(&observed);
        let update = RecordUpdate::loaded()
            .host(Some(node_id.to_string()))
            .start_time(observed.created)
            .ports(host_port, container_port)
            .engine(self.name());

        if self.tracker.contains(&container_id) {
            self.resync(&application_name, &container_id, &observed, update)
                .await;
        } else {
            self.attach(&application_name, &container_id, &observed, update, node_id)
                .await;
        }
    }

    /// Starts tracking a running container this node lost track of.
    async fn attach(
        &self,
        application_name: &str,
        container_id: &str,
        observed: &ObservedContainer,
        mut update: RecordUpdate,
        node_id: &str,
    ) {
        let record = match self.records.get(application_name, container_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                if self.engine.remove(&observed.runtime_id, true).await.is_ok() {
                    debug!(
                        "Cleaned up untracked {} container {}",
                        application_name, container_id
                    );
                }
                return;
            }
            Err(e) => {
                debug!(
                    "Unable to read {} container {}: {}",
                    application_name, container_id, e
                );
                return;
            }
        };

        if record.tags.contains_key("host") {
            let mut tags = record.tags;
            tags.insert("host".to_string(), json!(node_id));
            update = update.tags(tags);
        }

        let args = vec![
            ATTACH_VERB.to_string(),
            "--container".to_string(),
            observed.runtime_id.clone(),
        ];
        let process = self.process_spec(application_name, container_id, args);

        match self.supervisor.spawn(process).await {
            Ok(supervised) => {
                self.track(
                    application_name,
                    container_id,
                    supervised,
                    Tracking::Attach {
                        runtime_id: observed.runtime_id.clone(),
                        update,
                    },
                );
            }
            Err(e) => warn!(
                "Failed to attach to {} container {}: {}",
                application_name, container_id, e
            ),
        }
    }

    async fn resync(
        &self,
        application_name: &str,
        container_id: &str,
        observed: &ObservedContainer,
        update: RecordUpdate,
    ) {
        match self.records.get(application_name, container_id).await {
            Ok(None) => {
                debug!(
                    "Cleaned up untracked {} container {}",
                    application_name, container_id
                );
                if let Some(handle) = self.tracker.get(container_id) {
                    handle.stop();
                }
            }
            Ok(Some(_)) => {
                info!(
                    "Reconciled running {} container {}",
                    application_name, container_id
                );
                if let Err(e) = self
                    .records
                    .update(application_name, container_id, &update)
                    .await
                {
                    warn!(
                        "Failed to resync {} container {}: {}",
                        application_name, container_id, e
                    );
                    match self.engine.remove(&observed.runtime_id, true).await {
                        Ok(()) => debug!(
                            "Removed unrecorded {} container {}",
                            application_name, container_id
                        ),
                        Err(e) => warn!(
                            "Failed to remove {} container {}: {}",
                            application_name, container_id, e
                        ),
                    }
                }
            }
            Err(e) => debug!(
                "Unable to read {} container {}: {}",
                application_name, container_id, e
            ),
        }
    }
}
