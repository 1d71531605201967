use std::collections::HashMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::types::Scheduler;
use crate::lib::middleware::types::{Middleware, Stage};
use crate::lib::process::types::{ProcessTracker, TrackedCounts};
use crate::lib::store::types::RecordStore;
use crate::lib::tasks::state::RecordUpdate;
use crate::lib::tasks::types::ContainerRecord;
use crate::lib::worker::types::{StartArgument, Worker, WorkerError, WorkerResult};

impl Scheduler {
    pub fn new(records: RecordStore, tracker: ProcessTracker) -> Self {
        Scheduler {
            workers: HashMap::new(),
            records,
            tracker,
        }
    }

    /// Registers `worker` under its engine name, replacing any previous one.
    pub fn add_worker(&mut self, worker: Worker) {
        self.workers.insert(worker.name().to_string(), worker);
    }

    pub fn engines(&self) -> Vec<String> {
        let mut engines: Vec<String> = self.workers.keys().cloned().collect();
        engines.sort();
        engines
    }

    /// Container ids with a live process on this node.
    pub fn tracked(&self) -> Vec<String> {
        self.tracker.ids()
    }

    pub fn counts(&self) -> TrackedCounts {
        self.tracker.counts()
    }

    pub async fn initialize(&self) -> Vec<JoinHandle<()>> {
        let mut pending = Vec::new();
        for worker in self.workers.values() {
            pending.push(worker.initialize().await);
        }
        pending
    }

    pub async fn start(&self, application_name: &str, mut record: ContainerRecord) -> WorkerResult<()> {
        record.application_name = application_name.to_string();

        let Some(worker) = self.workers.get(&record.engine) else {
            error!(
                "Unsupported engine '{}' for {} container {}",
                record.engine, application_name, record.id
            );
            if let Err(e) = self
                .records
                .update(application_name, &record.id, &RecordUpdate::unloaded())
                .await
            {
                warn!(
                    "Failed to unload {} container {}: {}",
                    application_name, record.id, e
                );
            }
            return Err(WorkerError::UnsupportedEngine(record.engine));
        };

        worker.start(record).await
    }

    pub async fn stop(
        &self,
        engine: &str,
        application_name: &str,
        container_id: &str,
    ) -> WorkerResult<()> {
        match self.workers.get(engine) {
            Some(worker) => worker.stop(application_name, container_id).await,
            None => Err(WorkerError::UnsupportedEngine(engine.to_string())),
        }
    }

    /// Starts a reconciliation pass on every engine.
    pub fn reconcile(&self) -> Vec<JoinHandle<()>> {
        self.workers.values().map(Worker::reconcile).collect()
    }

    fn add_middleware(&self, engine: &str, stage: Stage, name: &str, handler: Arc<dyn Middleware>) {
        match self.workers.get(engine) {
            Some(worker) => worker.middleware().add(stage, name, handler),
            None => debug!("Ignoring {} middleware {} for unknown engine {}", stage, name, engine),
        }
    }

    pub fn add_pre_start_middleware(&self, engine: &str, name: &str, handler: Arc<dyn Middleware>) {
        self.add_middleware(engine, Stage::PreStart, name, handler);
    }

    pub fn add_pre_pull_middleware(&self, engine: &str, name: &str, handler: Arc<dyn Middleware>) {
        self.add_middleware(engine, Stage::PrePull, name, handler);
    }

    pub fn set_start_argument(&self, engine: &str, key: &str, value: StartArgument) {
        match self.workers.get(engine) {
            Some(worker) => worker.set_start_argument(key, value),
            None => debug!("Ignoring start argument {} for unknown engine {}", key, engine),
        }
    }
}
