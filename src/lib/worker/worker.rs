use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use nix::sys::signal::Signal;
use serde_json::{Map, Value, json};
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::args::{cpu_shares, start_arguments};
use super::stats::{get_stats, host_capacity};
use super::types::{StartArgument, Tracking, Worker, WorkerConfig, WorkerResult};
use crate::lib::cluster::types::{CONTAINER_UNLOADED_EVENT, Membership};
use crate::lib::middleware::types::{MiddlewareRegistry, SharedSpec, Stage};
use crate::lib::process::types::{
    DEFAULT_KILL_GRACE, DEFAULT_MAX_RUNS, DEFAULT_MIN_UPTIME, ProcessEvent, ProcessHandle,
    ProcessSpec, ProcessSupervisor, ProcessTracker, Supervised, SupervisorError,
};
use crate::lib::store::types::{RecordStore, StoreError};
use crate::lib::tasks::state::RecordUpdate;
use crate::lib::tasks::types::{ContainerRecord, Engine, ManagedName, RegistryAuth};

/// Copies every entry of `defaults` that `target` does not already have,
/// descending into objects present on both sides.
pub(crate) fn merge_missing(target: &mut Map<String, Value>, defaults: Map<String, Value>) {
    for (key, value) in defaults {
        match target.get_mut(&key) {
            Some(Value::Object(existing)) => {
                if let Value::Object(value) = value {
                    merge_missing(existing, value);
                }
            }
            Some(_) => {}
            None => {
                target.insert(key, value);
            }
        }
    }
}

impl Worker {
    pub fn new(
        engine: Arc<dyn Engine>,
        records: RecordStore,
        membership: Arc<dyn Membership>,
        supervisor: Arc<dyn ProcessSupervisor>,
        tracker: ProcessTracker,
        config: WorkerConfig,
    ) -> Self {
        Worker {
            engine,
            records,
            membership,
            supervisor,
            tracker,
            middleware: Arc::new(MiddlewareRegistry::new()),
            start_args: Arc::new(RwLock::new(BTreeMap::new())),
            config: Arc::new(config),
        }
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    pub fn middleware(&self) -> &MiddlewareRegistry {
        &self.middleware
    }

    #[cfg(test)]
    pub fn tracker(&self) -> &ProcessTracker {
        &self.tracker
    }

    pub fn set_start_argument(&self, key: &str, value: StartArgument) {
        let mut args = match self.start_args.write() {
            Ok(args) => args,
            Err(poisoned) => poisoned.into_inner(),
        };
        args.insert(key.to_string(), value);
    }

    fn extra_arguments(&self) -> BTreeMap<String, StartArgument> {
        match self.start_args.read() {
            Ok(args) => args.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub(crate) fn node_id(&self) -> String {
        self.membership.attributes().id
    }

    /// Advertises the engine version and node capacity on the membership
    /// attributes, then schedules the first reconciliation pass.
    pub async fn initialize(&self) -> JoinHandle<()> {
        let mut tags = self.membership.attributes().tags;

        match self.engine.version().await {
            Ok(version) => {
                let mut engines = Map::new();
                engines.insert(self.name().to_string(), json!(version));
                let mut defaults = Map::new();
                defaults.insert("metadata".to_string(), json!({ "engines": engines }));
                merge_missing(&mut tags, defaults);
            }
            Err(e) => warn!("Failed to read {} engine version: {}", self.name(), e),
        }

        let stats = get_stats(&System::new_all(), self.tracker.counts());
        let mut defaults = Map::new();
        defaults.insert(
            "metadata".to_string(),
            json!({ "host": host_capacity(&stats) }),
        );
        merge_missing(&mut tags, defaults);
        self.membership.set_tags(tags);

        for stage in [Stage::PrePull, Stage::PreStart] {
            debug!(
                "{} {} middleware: {:?}",
                self.name(),
                stage,
                self.middleware.names(stage)
            );
        }

        let worker = self.clone();
        let delay = self.config.reconcile_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            worker.reconcile_pass().await;
        })
    }

    async fn mark_unloaded(&self, application_name: &str, container_id: &str) {
        if let Err(e) = self
            .records
            .update(application_name, container_id, &RecordUpdate::unloaded())
            .await
        {
            warn!(
                "Failed to unload {} container {}: {}",
                application_name, container_id, e
            );
        }
    }

    /// Tries each credential set in order until one pull succeeds.
    async fn pull(&self, image: &str, auth: &[RegistryAuth]) -> bool {
        for (attempt, credentials) in auth.iter().enumerate() {
            match self.engine.pull(image, credentials).await {
                Ok(()) => {
                    debug!("Pulled {} (credential set {})", image, attempt);
                    return true;
                }
                Err(e) => debug!(
                    "Pull of {} with credential set {} failed: {}",
                    image, attempt, e
                ),
            }
        }
        false
    }

    pub async fn start(&self, spec: ContainerRecord) -> WorkerResult<()> {
        let application_name = spec.application_name.clone();
        let container_id = spec.id.clone();

        if self.tracker.contains(&container_id) {
            warn!(
                "Refusing to start {} container {}: already tracked",
                application_name, container_id
            );
            return Err(SupervisorError::AlreadyTracked(container_id).into());
        }

        let shared: SharedSpec = Arc::new(Mutex::new(spec));

        if let Err(e) = self.middleware.run(Stage::PrePull, shared.clone()).await {
            warn!(
                "Failed to execute pre-pull middleware for {} container {}: {}",
                application_name, container_id, e
            );
            self.mark_unloaded(&application_name, &container_id).await;
            self.membership.send(
                CONTAINER_UNLOADED_EVENT,
                json!({
                    "id": container_id,
                    "application_name": application_name,
                    "host": self.node_id(),
                    "error": e.to_string(),
                }),
            );
            return Err(e.into());
        }

        let (image, auth) = {
            let mut spec = shared.lock().await;
            let auth = spec
                .auth
                .take()
                .unwrap_or_else(|| vec![RegistryAuth::default()]);
            (spec.image.clone(), auth)
        };

        if auth.is_empty() {
            debug!("No credentials given for {}, skipping pull", image);
        } else if !self.pull(&image, &auth).await {
            // a cached image may still start
            warn!("Failed to pull {}", image);
            self.mark_unloaded(&application_name, &container_id).await;
        }

        if let Err(e) = self.middleware.run(Stage::PreStart, shared.clone()).await {
            warn!(
                "Failed to execute pre-start middleware for {} container {}: {}",
                application_name, container_id, e
            );
            self.mark_unloaded(&application_name, &container_id).await;
            return Err(e.into());
        }

        let spec = shared.lock().await.clone();
        self.launch(spec).await
    }

    async fn launch(&self, spec: ContainerRecord) -> WorkerResult<()> {
        let engine_args = start_arguments(&spec, cpu_shares(spec.cpus), &self.extra_arguments());
        let process = self.process_spec(&spec.application_name, &spec.id, engine_args);

        let supervised = match self.supervisor.spawn(process).await {
            Ok(supervised) => supervised,
            Err(e) => {
                warn!(
                    "Failed to launch {} container {}: {}",
                    spec.application_name, spec.id, e
                );
                self.mark_unloaded(&spec.application_name, &spec.id).await;
                return Err(e.into());
            }
        };

        let tracked = self.track(
            &spec.application_name,
            &spec.id,
            supervised,
            Tracking::Launch {
                respawn: spec.respawn,
            },
        );
        if !tracked {
            return Err(SupervisorError::AlreadyTracked(spec.id).into());
        }
        Ok(())
    }

    pub(crate) fn process_spec(
        &self,
        application_name: &str,
        container_id: &str,
        engine_args: Vec<String>,
    ) -> ProcessSpec {
        let log_dir = self
            .config
            .base_log_dir
            .join("applications")
            .join(application_name)
            .join(container_id);

        let mut args = self.config.executable_args.clone();
        args.extend(engine_args);

        ProcessSpec {
            uid: container_id.to_string(),
            executable: self.config.executable.clone(),
            args,
            max_runs: DEFAULT_MAX_RUNS,
            min_uptime: DEFAULT_MIN_UPTIME,
            kill_signal: Signal::SIGTERM,
            kill_grace: DEFAULT_KILL_GRACE,
            stdout: log_dir.join("stdout"),
            stderr: log_dir.join("stderr"),
        }
    }

    /// Registers a supervised process and listens to its events. Returns
    /// false, after stopping the process, if the container already has one.
    pub(crate) fn track(
        &self,
        application_name: &str,
        container_id: &str,
        supervised: Supervised,
        tracking: Tracking,
    ) -> bool {
        let Supervised { handle, mut events } = supervised;

        if let Err(e) = self.tracker.insert(container_id, handle.clone()) {
            warn!("{}, stopping the duplicate process", e);
            handle.stop();
            return false;
        }

        let worker = self.clone();
        let application_name = application_name.to_string();
        let container_id = container_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ProcessEvent::Started { pid } => {
                        debug!("Process for {} started (pid {:?})", container_id, pid);
                        worker
                            .on_started(&application_name, &container_id, &handle, &tracking)
                            .await;
                    }
                    ProcessEvent::Exited { code } => {
                        debug!("Process for {} exited ({:?})", container_id, code);
                        worker
                            .on_exited(&application_name, &container_id, &tracking)
                            .await;
                        break;
                    }
                }
            }
            worker.tracker.release(&container_id, &handle);
        });

        true
    }

    async fn on_started(
        &self,
        application_name: &str,
        container_id: &str,
        handle: &Arc<dyn ProcessHandle>,
        tracking: &Tracking,
    ) {
        match tracking {
            Tracking::Launch { .. } => {
                info!("Loading {} container {}", application_name, container_id);
                if let Err(e) = self
                    .records
                    .update(application_name, container_id, &RecordUpdate::loaded())
                    .await
                {
                    warn!(
                        "Failed to load {} container {}: {}",
                        application_name, container_id, e
                    );
                    handle.stop();
                }
            }
            Tracking::Attach { runtime_id, update } => {
                info!(
                    "Reconciled running {} container {}",
                    application_name, container_id
                );
                if let Err(e) = self
                    .records
                    .update(application_name, container_id, update)
                    .await
                {
                    warn!(
                        "Failed to resync {} container {}: {}",
                        application_name, container_id, e
                    );
                    // the container is running, only a forced remove takes it down
                    match self.engine.remove(runtime_id, true).await {
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
        }
    }

    async fn on_exited(&self, application_name: &str, container_id: &str, tracking: &Tracking) {
        info!("Unloading {} container {}", application_name, container_id);

        let respawn = match tracking {
            Tracking::Launch { respawn } => *respawn,
            Tracking::Attach { .. } => None,
        };
        let update = RecordUpdate::released().respawn(respawn);

        match self
            .records
            .update(application_name, container_id, &update)
            .await
        {
            Ok(()) => {}
            // stopped containers have no record left to release
            Err(StoreError::NotFound(_)) => {
                debug!(
                    "No record left for {} container {}",
                    application_name, container_id
                );
            }
            Err(e) => warn!(
                "Failed to stop {} container {}: {}",
                application_name, container_id, e
            ),
        }
    }

    /// Deletes the record and stops the local process. An attached process
    /// does not own its container, so the container is killed as well.
    pub async fn stop(&self, application_name: &str, container_id: &str) -> WorkerResult<()> {
        if let Err(e) = self.records.delete(application_name, container_id).await {
            warn!(
                "Failed to delete {} container {}: {}",
                application_name, container_id, e
            );
        }

        let Some(handle) = self.tracker.get(container_id) else {
            debug!(
                "No process tracked for {} container {}",
                application_name, container_id
            );
            return Ok(());
        };
        handle.stop();

        if handle.is_attach() {
            let name = ManagedName::compose(application_name, container_id);
            // listing is best effort, a failed kill leaves it to reconciliation
            let containers = self.engine.list_containers(true).await.unwrap_or_default();
            for container in containers.iter().filter(|c| c.name == name) {
                match self.engine.kill(&container.runtime_id).await {
                    Ok(()) => info!("Killed attached container {}", name),
                    Err(e) => debug!("Failed to kill {}: {}", name, e),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::middleware::types::{MiddlewareError, middleware_fn};
    use crate::lib::tasks::types::Status;
    use crate::lib::testing::{Harness, eventually, harness, record};
    use crate::lib::worker::types::WorkerError;

    const ID: &str = "00000000-0000-0000-0000-000000000001";

    async fn seeded(h: &Harness) -> ContainerRecord {
        let mut spec = record("web", ID);
        spec.image = "nginx:latest".to_string();
        spec.cpus = 0.5;
        spec.host = Some("node-1".to_string());
        h.records.put(&spec).await.unwrap();
        spec
    }

    #[test]
    fn test_merge_missing_keeps_existing() {
        let mut target = json!({"metadata": {"host": {"cpus": 8}}, "zone": "a"})
            .as_object()
            .cloned()
            .unwrap();
        let defaults = json!({"metadata": {"host": {"cpus": 2, "memory": 1}, "engines": {}}, "zone": "b"})
            .as_object()
            .cloned()
            .unwrap();

        merge_missing(&mut target, defaults);
        assert_eq!(
            Value::Object(target),
            json!({"metadata": {"host": {"cpus": 8, "memory": 1}, "engines": {}}, "zone": "a"})
        );
    }

    #[tokio::test]
    async fn test_initialize_advertises_engine_and_capacity() {
        let h = harness();
        let mut tags = Map::new();
        tags.insert(
            "metadata".to_string(),
            json!({"engines": {"docker": {"client_version": "pinned"}}}),
        );
        h.membership.set_tags(tags);

        h.worker.initialize().await.await.unwrap();

        let tags = h.membership.attributes().tags;
        assert_eq!(tags["metadata"]["engines"]["docker"]["client_version"], "pinned");
        assert_eq!(tags["metadata"]["engines"]["docker"]["api_version"], "1.45");
        assert!(tags["metadata"]["host"]["cpus"].is_u64());
    }

    #[tokio::test]
    async fn test_start_loads_record_with_substituted_env() {
        let h = harness();
        let mut spec = seeded(&h).await;
        spec.env_vars.insert("PORT".to_string(), "$PORT0".to_string());
        spec.env_vars.insert("PORT0".to_string(), "4000".to_string());

        h.worker.start(spec).await.unwrap();

        eventually(|| async {
            h.records.get("web", ID).await.unwrap().unwrap().status == Status::Loaded
        })
        .await;
        let stored = h.records.get("web", ID).await.unwrap().unwrap();
        assert_eq!(stored.engine, "docker");
        assert!(h.worker.tracker().contains(ID));

        let process = h.supervisor.specs().pop().unwrap();
        assert_eq!(&process.args[..3], &["executor", "docker", "start"]);
        assert!(process.args.contains(&"--CpuShares=512".to_string()));
        assert!(process.args.contains(&"PORT=4000".to_string()));
        assert!(process.stdout.ends_with(format!("applications/web/{}/stdout", ID)));
        assert_eq!(h.engine.pulls(), vec![("nginx:latest".to_string(), RegistryAuth::default())]);
    }

    #[tokio::test]
    async fn test_exit_releases_record_and_tracker() {
        let h = harness();
        let spec = seeded(&h).await;
        h.worker.start(spec).await.unwrap();
        eventually(|| async {
            h.records.get("web", ID).await.unwrap().unwrap().status == Status::Loaded
        })
        .await;

        h.supervisor.exit(ID);
        eventually(|| async { !h.worker.tracker().contains(ID) }).await;

        let stored = h.records.get("web", ID).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Unloaded);
        assert_eq!(stored.host, None);
        assert_eq!(stored.start_time, None);
    }

    #[tokio::test]
    async fn test_exit_without_respawn_deletes_record() {
        let h = harness();
        let mut spec = seeded(&h).await;
        spec.respawn = Some(false);
        h.worker.start(spec).await.unwrap();
        eventually(|| async { h.worker.tracker().contains(ID) }).await;

        h.supervisor.exit(ID);
        eventually(|| async { h.records.get("web", ID).await.unwrap().is_none() }).await;
    }

    #[tokio::test]
    async fn test_pull_tries_credentials_in_order() {
        let h = harness();
        let mut spec = seeded(&h).await;
        let first = RegistryAuth {
            username: Some("first".to_string()),
            ..Default::default()
        };
        let second = RegistryAuth {
            username: Some("second".to_string()),
            ..Default::default()
        };
        let third = RegistryAuth {
            username: Some("third".to_string()),
            ..Default::default()
        };
        spec.auth = Some(vec![first.clone(), second.clone(), third]);
        h.engine.fail_pulls(1);

        h.worker.start(spec).await.unwrap();

        let tried: Vec<RegistryAuth> = h.engine.pulls().into_iter().map(|(_, a)| a).collect();
        assert_eq!(tried, vec![first, second]);
        let launched = h.supervisor.specs().pop().unwrap();
        assert!(!launched.args.iter().any(|a| a.contains("auth")));
    }

    #[tokio::test]
    async fn test_pull_failure_still_starts() {
        let h = harness();
        let spec = seeded(&h).await;
        h.engine.fail_pulls(usize::MAX);

        h.worker.start(spec).await.unwrap();

        assert_eq!(h.supervisor.specs().len(), 1);
        eventually(|| async {
            h.records.get("web", ID).await.unwrap().unwrap().status == Status::Loaded
        })
        .await;
    }

    #[tokio::test]
    async fn test_pre_pull_failure_prevents_start_and_broadcasts() {
        let h = harness();
        let mut spec = seeded(&h).await;
        spec.status = Status::Loaded;
        h.records.put(&spec).await.unwrap();
        let mut events = h.membership.subscribe();

        h.worker.middleware().add(
            Stage::PrePull,
            "quota",
            middleware_fn(|_| async { Err::<(), _>(MiddlewareError::Failed("over quota".to_string())) }),
        );

        let err = h.worker.start(spec).await.unwrap_err();
        assert!(matches!(err, WorkerError::Middleware(_)));
        assert!(h.supervisor.specs().is_empty());
        assert!(h.engine.pulls().is_empty());

        let stored = h.records.get("web", ID).await.unwrap().unwrap();
        assert_eq!(stored.status, Status::Unloaded);

        let event = events.try_recv().unwrap();
        assert_eq!(event.event, CONTAINER_UNLOADED_EVENT);
        assert_eq!(event.data["id"], ID);
        assert_eq!(event.data["host"], "node-1");
        assert_eq!(event.data["error"], "over quota");
    }

    #[tokio::test]
    async fn test_pre_start_failure_prevents_start() {
        let h = harness();
        let spec = seeded(&h).await;
        h.worker.middleware().add(
            Stage::PreStart,
            "volumes",
            middleware_fn(|_| async { Err::<(), _>(MiddlewareError::Failed("no disk".to_string())) }),
        );

        assert!(h.worker.start(spec).await.is_err());
        assert_eq!(h.engine.pulls().len(), 1);
        assert!(h.supervisor.specs().is_empty());
        assert!(!h.worker.tracker().contains(ID));
    }

    #[tokio::test]
    async fn test_pre_start_changes_reach_arguments() {
        let h = harness();
        let spec = seeded(&h).await;
        h.worker.middleware().add(
            Stage::PreStart,
            "inject",
            middleware_fn(|spec: SharedSpec| async move {
                spec.lock()
                    .await
                    .env_vars
                    .insert("INJECTED".to_string(), "yes".to_string());
                Ok::<(), MiddlewareError>(())
            }),
        );
        h.worker
            .set_start_argument("HostConfig.Dns", StartArgument::Value("10.0.0.2".to_string()));

        h.worker.start(spec).await.unwrap();

        let args = h.supervisor.specs().pop().unwrap().args;
        assert!(args.contains(&"INJECTED=yes".to_string()));
        let dns = args.iter().position(|a| a == "--HostConfig.Dns").unwrap();
        assert_eq!(args[dns + 1], "10.0.0.2");
    }

    #[tokio::test]
    async fn test_failed_load_write_stops_the_process() {
        let h = harness();
        // no record: the loaded write fails
        let mut spec = record("web", ID);
        spec.image = "nginx:latest".to_string();

        h.worker.start(spec).await.unwrap();

        eventually(|| async { !h.worker.tracker().contains(ID) }).await;
        assert!(h.supervisor.handle(ID).unwrap().stopped());
    }

    #[tokio::test]
    async fn test_second_start_is_refused() {
        let h = harness();
        let spec = seeded(&h).await;
        h.worker.start(spec.clone()).await.unwrap();

        let err = h.worker.start(spec).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Supervisor(SupervisorError::AlreadyTracked(_))
        ));
        assert_eq!(h.supervisor.specs().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_launched_container() {
        let h = harness();
        let spec = seeded(&h).await;
        h.worker.start(spec).await.unwrap();
        eventually(|| async { h.worker.tracker().contains(ID) }).await;

        h.worker.stop("web", ID).await.unwrap();

        assert!(h.records.get("web", ID).await.unwrap().is_none());
        assert!(h.supervisor.handle(ID).unwrap().stopped());
        assert!(h.engine.killed().is_empty());
        eventually(|| async { !h.worker.tracker().contains(ID) }).await;
    }

    #[tokio::test]
    async fn test_stop_untracked_only_deletes_record() {
        let h = harness();
        seeded(&h).await;
        h.worker.stop("web", ID).await.unwrap();
        assert!(h.records.get("web", ID).await.unwrap().is_none());
        assert!(h.engine.killed().is_empty());
    }

    #[tokio::test]
    async fn test_launch_rejected_by_tracker_fails() {
        let h = harness();
        let spec = seeded(&h).await;
        let existing = crate::lib::testing::FakeHandle::new(&["start"]);
        h.worker.tracker().insert(ID, existing.clone()).unwrap();

        let err = h.worker.launch(spec).await.unwrap_err();
        assert!(matches!(
            err,
            WorkerError::Supervisor(SupervisorError::AlreadyTracked(_))
        ));
        assert!(h.supervisor.handle(ID).unwrap().stopped());
        assert!(!existing.stopped());
        assert!(h.worker.tracker().contains(ID));
    }

    #[tokio::test]
    async fn test_stop_grace_outlasts_engine_stop() {
        let h = harness();
        let spec = seeded(&h).await;
        h.worker.start(spec).await.unwrap();

        let process = h.supervisor.specs().pop().unwrap();
        let engine_stop =
            std::time::Duration::from_secs(crate::lib::tasks::docker::STOP_TIMEOUT_SECS as u64);
        assert!(process.kill_grace >= engine_stop * 2);
    }
}
