//! In-process fakes of the engine, supervisor and volume collaborators, and a
//! worker wired to them.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::lib::cluster::local::LocalMembership;
use crate::lib::cluster::types::{ClusterError, ClusterResult, VolumeService};
use crate::lib::process::types::{
    ProcessEvent, ProcessHandle, ProcessSpec, ProcessSupervisor, ProcessTracker, Supervised,
    SupervisorResult,
};
use crate::lib::store::types::{KvStore, RecordStore, StoreError, StoreResult};
use crate::lib::tasks::docker::DOCKER_ENGINE;
use crate::lib::tasks::types::{
    ContainerRecord, ContainerSummary, Engine, EngineError, EngineResult, EngineVersion,
    ObservedContainer, RegistryAuth,
};
use crate::lib::worker::types::{Worker, WorkerConfig};

#[derive(Default)]
pub struct FakeEngine {
    containers: Mutex<Vec<(ContainerSummary, Option<ObservedContainer>)>>,
    pulls: Mutex<Vec<(String, RegistryAuth)>>,
    failing_pulls: AtomicUsize,
    removed: Mutex<Vec<(String, bool)>>,
    killed: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_container(&self, observed: ObservedContainer) {
        let summary = ContainerSummary {
            runtime_id: observed.runtime_id.clone(),
            name: observed.name.clone(),
        };
        self.containers.lock().unwrap().push((summary, Some(observed)));
    }

    /// A container that shows up in listings but cannot be inspected.
    pub fn add_listed(&self, runtime_id: &str, name: &str) {
        let summary = ContainerSummary {
            runtime_id: runtime_id.to_string(),
            name: name.to_string(),
        };
        self.containers.lock().unwrap().push((summary, None));
    }

    /// Fails the next `count` pulls.
    pub fn fail_pulls(&self, count: usize) {
        self.failing_pulls.store(count, Ordering::SeqCst);
    }

    pub fn pulls(&self) -> Vec<(String, RegistryAuth)> {
        self.pulls.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<(String, bool)> {
        self.removed.lock().unwrap().clone()
    }

    pub fn killed(&self) -> Vec<String> {
        self.killed.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Ids still known to the engine.
    pub fn runtime_ids(&self) -> Vec<String> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .map(|(summary, _)| summary.runtime_id.clone())
            .collect()
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn name(&self) -> &str {
        DOCKER_ENGINE
    }

    async fn version(&self) -> EngineResult<EngineVersion> {
        Ok(EngineVersion {
            client_version: Some("27.0.1".to_string()),
            api_version: Some("1.45".to_string()),
            go_version: Some("go1.22.4".to_string()),
        })
    }

    async fn list_containers(&self, _all: bool) -> EngineResult<Vec<ContainerSummary>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .map(|(summary, _)| summary.clone())
            .collect())
    }

    async fn inspect(&self, runtime_id: &str) -> EngineResult<ObservedContainer> {
        self.containers
            .lock()
            .unwrap()
            .iter()
            .find(|(summary, _)| summary.runtime_id == runtime_id)
            .and_then(|(_, observed)| observed.clone())
            .ok_or_else(|| EngineError::NotFound(runtime_id.to_string()))
    }

    async fn pull(&self, image: &str, auth: &RegistryAuth) -> EngineResult<()> {
        self.pulls
            .lock()
            .unwrap()
            .push((image.to_string(), auth.clone()));

        let failing = self.failing_pulls.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_pulls.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::Pull {
                image: image.to_string(),
                reason: "denied".to_string(),
            });
        }
        Ok(())
    }

    async fn kill(&self, runtime_id: &str) -> EngineResult<()> {
        self.killed.lock().unwrap().push(runtime_id.to_string());
        Ok(())
    }

    /// Like the daemon, refuses a non-forced remove of a running container.
    async fn remove(&self, runtime_id: &str, force: bool) -> EngineResult<()> {
        self.removed
            .lock()
            .unwrap()
            .push((runtime_id.to_string(), force));

        let mut containers = self.containers.lock().unwrap();
        let running = containers.iter().any(|(summary, observed)| {
            summary.runtime_id == runtime_id && observed.as_ref().is_some_and(|o| o.running)
        });
        if running && !force {
            return Err(EngineError::Conflict(format!(
                "container {} is running",
                runtime_id
            )));
        }
        containers.retain(|(summary, _)| summary.runtime_id != runtime_id);
        Ok(())
    }
}

pub struct FakeHandle {
    args: Vec<String>,
    events: Option<mpsc::UnboundedSender<ProcessEvent>>,
    stopped: AtomicBool,
}

impl FakeHandle {
    /// A handle with nobody listening to its events.
    pub fn new(args: &[&str]) -> Arc<Self> {
        Arc::new(FakeHandle {
            args: args.iter().map(|arg| arg.to_string()).collect(),
            events: None,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn send(&self, event: ProcessEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

impl ProcessHandle for FakeHandle {
    fn args(&self) -> &[String] {
        &self.args
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.send(ProcessEvent::Exited { code: None });
        }
    }
}

#[derive(Default)]
pub struct FakeSupervisor {
    specs: Mutex<Vec<ProcessSpec>>,
    handles: Mutex<HashMap<String, Arc<FakeHandle>>>,
    manual_start: AtomicBool,
}

impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// With auto start off, `Started` is only sent by [`FakeSupervisor::start`].
    pub fn auto_start(&self, enabled: bool) {
        self.manual_start.store(!enabled, Ordering::SeqCst);
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().unwrap().clone()
    }

    /// The most recent handle spawned for `uid`.
    pub fn handle(&self, uid: &str) -> Option<Arc<FakeHandle>> {
        self.handles.lock().unwrap().get(uid).cloned()
    }

    pub fn start(&self, uid: &str) {
        if let Some(handle) = self.handle(uid) {
            handle.send(ProcessEvent::Started { pid: Some(4242) });
        }
    }

    /// Simulates the process exiting on its own.
    pub fn exit(&self, uid: &str) {
        if let Some(handle) = self.handle(uid) {
            handle.send(ProcessEvent::Exited { code: Some(0) });
        }
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn spawn(&self, spec: ProcessSpec) -> SupervisorResult<Supervised> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let handle = Arc::new(FakeHandle {
            args: spec.args.clone(),
            events: Some(events_tx),
            stopped: AtomicBool::new(false),
        });

        self.handles
            .lock()
            .unwrap()
            .insert(spec.uid.clone(), handle.clone());
        self.specs.lock().unwrap().push(spec);

        if !self.manual_start.load(Ordering::SeqCst) {
            handle.send(ProcessEvent::Started { pid: Some(4242) });
        }

        Ok(Supervised { handle, events })
    }
}

/// Key-value store whose reads and writes can be made to fail.
#[derive(Default)]
pub struct FakeStore {
    entries: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
    read_only: AtomicBool,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }

    /// Every operation fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reads keep working, writes and deletes fail.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    fn check_write(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) || self.read_only.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store rejects writes".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for FakeStore {
    async fn get(&self, key: &str, _local: bool) -> StoreResult<Option<String>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(self.raw(key))
    }

    async fn set(&self, key: &str, value: String) -> StoreResult<()> {
        self.check_write()?;
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check_write()?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

pub struct FakeVolumes {
    base_path: String,
    local: Mutex<HashMap<String, String>>,
    created: Mutex<Vec<String>>,
    fetched: Mutex<Vec<String>>,
    fail_creates: AtomicBool,
    fail_snapshots: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeVolumes {
    pub fn new(base_path: &str) -> Self {
        FakeVolumes {
            base_path: base_path.to_string(),
            local: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            fetched: Mutex::new(Vec::new()),
            fail_creates: AtomicBool::new(false),
            fail_snapshots: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
        }
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_snapshots(&self, fail: bool) {
        self.fail_snapshots.store(fail, Ordering::SeqCst);
    }

    pub fn add_local(&self, id: &str) {
        self.local
            .lock()
            .unwrap()
            .insert(id.to_string(), format!("{}/{}", self.base_path, id));
    }
}

#[async_trait]
impl VolumeService for FakeVolumes {
    fn base_path(&self) -> &str {
        &self.base_path
    }

    fn create_id(&self) -> String {
        format!("vol-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn create_volume(&self, id: &str) -> ClusterResult<()> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ClusterError::CreateVolume {
                id: id.to_string(),
                reason: "out of space".to_string(),
            });
        }
        self.created.lock().unwrap().push(id.to_string());
        self.add_local(id);
        Ok(())
    }

    async fn volumes(&self) -> ClusterResult<HashMap<String, String>> {
        Ok(self.local.lock().unwrap().clone())
    }

    async fn fetch_snapshot(&self, id: &str) -> ClusterResult<()> {
        self.fetched.lock().unwrap().push(id.to_string());
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(ClusterError::Snapshot {
                id: id.to_string(),
                reason: "no replica".to_string(),
            });
        }
        self.add_local(id);
        Ok(())
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

pub fn record(application_name: &str, container_id: &str) -> ContainerRecord {
    let mut record = ContainerRecord::new(application_name, container_id);
    record.engine = DOCKER_ENGINE.to_string();
    record.image = "nginx:latest".to_string();
    record
}

pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub supervisor: Arc<FakeSupervisor>,
    pub kv: Arc<FakeStore>,
    pub records: RecordStore,
    pub membership: Arc<LocalMembership>,
    pub worker: Worker,
}

/// A docker worker on `node-1` backed entirely by fakes.
pub fn harness() -> Harness {
    let engine = Arc::new(FakeEngine::new());
    let supervisor = Arc::new(FakeSupervisor::new());
    let kv = Arc::new(FakeStore::new());
    let records = RecordStore::new(kv.clone(), "containers");
    let membership = Arc::new(LocalMembership::new("node-1"));

    let worker = Worker::new(
        engine.clone(),
        records.clone(),
        membership.clone(),
        supervisor.clone(),
        ProcessTracker::new(),
        WorkerConfig {
            base_log_dir: PathBuf::from("/var/log/corral"),
            executable: PathBuf::from("/usr/local/bin/corral"),
            executable_args: vec!["executor".to_string(), DOCKER_ENGINE.to_string()],
            reconcile_delay: Duration::ZERO,
        },
    );

    Harness {
        engine,
        supervisor,
        kv,
        records,
        membership,
        worker,
    }
}
