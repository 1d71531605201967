use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::lib::cluster::types::Membership;
use crate::lib::middleware::types::{MiddlewareError, MiddlewareRegistry};
use crate::lib::process::types::{ProcessSupervisor, ProcessTracker, SupervisorError, TrackedCounts};
use crate::lib::scheduler::types::Scheduler;
use crate::lib::store::types::{RecordStore, StoreError};
use crate::lib::tasks::state::RecordUpdate;
use crate::lib::tasks::types::{ContainerRecord, Engine, EngineError};

pub const DEFAULT_RECONCILE_DELAY: Duration = Duration::from_secs(2);

/// An engine-specific start argument: a fixed value, or one derived from the
/// full start spec at launch time.
#[derive(Clone)]
pub enum StartArgument {
    Value(String),
    Computed(Arc<dyn Fn(&ContainerRecord) -> String + Send + Sync>),
}

impl StartArgument {
    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&ContainerRecord) -> String + Send + Sync + 'static,
    {
        StartArgument::Computed(Arc::new(f))
    }

    /// Parses a configured value; `{application}` and `{id}` expand per
    /// container.
    pub fn template(template: &str) -> Self {
        if !template.contains("{application}") && !template.contains("{id}") {
            return StartArgument::Value(template.to_string());
        }

        let template = template.to_string();
        StartArgument::computed(move |spec| {
            template
                .replace("{application}", &spec.application_name)
                .replace("{id}", &spec.id)
        })
    }

    pub fn resolve(&self, spec: &ContainerRecord) -> String {
        match self {
            StartArgument::Value(value) => value.clone(),
            StartArgument::Computed(f) => f(spec),
        }
    }
}

impl fmt::Debug for StartArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartArgument::Value(value) => write!(f, "Value({:?})", value),
            StartArgument::Computed(_) => write!(f, "Computed(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub base_log_dir: PathBuf,
    /// Program run for every tracked container, followed by
    /// `executable_args` and then the engine arguments.
    pub executable: PathBuf,
    pub executable_args: Vec<String>,
    pub reconcile_delay: Duration,
}

/// Lifecycle command processor for one engine adapter.
#[derive(Clone)]
pub struct Worker {
    pub(crate) engine: Arc<dyn Engine>,
    pub(crate) records: RecordStore,
    pub(crate) membership: Arc<dyn Membership>,
    pub(crate) supervisor: Arc<dyn ProcessSupervisor>,
    pub(crate) tracker: ProcessTracker,
    pub(crate) middleware: Arc<MiddlewareRegistry>,
    pub(crate) start_args: Arc<RwLock<BTreeMap<String, StartArgument>>>,
    pub(crate) config: Arc<WorkerConfig>,
}

/// What the listener of a tracked handle writes back to the record.
#[derive(Debug, Clone)]
pub(crate) enum Tracking {
    /// A fresh start by this node.
    Launch { respawn: Option<bool> },
    /// An attach to a container the engine already runs. `update` is written
    /// once the attach is confirmed.
    Attach {
        runtime_id: String,
        update: RecordUpdate,
    },
}

/// Node report served on `/stats`. Sizes are in megabytes.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemStats {
    pub hostname: String,
    pub system_name: String,
    pub total_cpus: u64,
    pub cpu_usage: f32,
    pub load_average: [f64; 3],
    pub total_memory: u64,
    pub used_memory: u64,
    pub total_swap: u64,
    pub used_swap: u64,
    pub disk_usage: f32,
    pub containers: TrackedCounts,
}

pub struct AgentServer {
    pub scheduler: Arc<Scheduler>,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("middleware: {0}")]
    Middleware(#[from] MiddlewareError),

    #[error("record store: {0}")]
    Store(#[from] StoreError),

    #[error("supervisor: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("engine: {0}")]
    Engine(#[from] EngineError),

    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),
}

pub type WorkerResult<T> = Result<T, WorkerError>;
