use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::sync::mpsc;

use crate::lib::tasks::executor::ATTACH_VERB;

pub const DEFAULT_MAX_RUNS: u32 = 1;
pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(5);
/// Outlasts the executor's own stop-then-remove of its container.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(30);

/// How to run and babysit one container's executor process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub uid: String,
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Total runs allowed, the first one included.
    pub max_runs: u32,
    /// A run shorter than this counts as a crash loop and ends supervision.
    pub min_uptime: Duration,
    pub kill_signal: Signal,
    /// Time between `kill_signal` and SIGKILL.
    pub kill_grace: Duration,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessEvent {
    Started { pid: Option<u32> },
    Exited { code: Option<i32> },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to spawn {executable}: {source}")]
    Spawn {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to prepare log files for {uid}: {source}")]
    Logs {
        uid: String,
        #[source]
        source: std::io::Error,
    },

    #[error("container {0} is already tracked on this node")]
    AlreadyTracked(String),
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// A live supervised process.
pub trait ProcessHandle: Send + Sync {
    fn args(&self) -> &[String];

    /// Asks the process to terminate; supervision ends and `Exited` follows.
    fn stop(&self);

    /// Attached processes only observe a container someone else started.
    fn is_attach(&self) -> bool {
        self.args().iter().any(|arg| arg == ATTACH_VERB)
    }
}

pub struct Supervised {
    pub handle: Arc<dyn ProcessHandle>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn spawn(&self, spec: ProcessSpec) -> SupervisorResult<Supervised>;
}

/// Supervised processes on this node, at most one per container id.
#[derive(Clone, Default)]
pub struct ProcessTracker {
    pub(super) processes: Arc<Mutex<HashMap<String, Arc<dyn ProcessHandle>>>>,
}

/// Tracked processes, split by how they came to be tracked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackedCounts {
    pub launched: u64,
    pub attached: u64,
}
