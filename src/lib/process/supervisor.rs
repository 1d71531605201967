use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::types::{
    ProcessEvent, ProcessHandle, ProcessSpec, ProcessSupervisor, Supervised, SupervisorError,
    SupervisorResult,
};

/// Supervises executor processes spawned from the local filesystem.
#[derive(Debug, Default, Clone)]
pub struct CommandSupervisor;

struct CommandHandle {
    args: Vec<String>,
    stop: watch::Sender<bool>,
}

impl ProcessHandle for CommandHandle {
    fn args(&self) -> &[String] {
        &self.args
    }

    fn stop(&self) {
        self.stop.send_replace(true);
    }
}

async fn open_log(uid: &str, path: &std::path::Path) -> SupervisorResult<std::fs::File> {
    let logs = |source| SupervisorError::Logs {
        uid: uid.to_string(),
        source,
    };

    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await.map_err(logs)?;
    }

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(logs)?;
    Ok(file.into_std().await)
}

async fn launch(spec: &ProcessSpec) -> SupervisorResult<Child> {
    let stdout = open_log(&spec.uid, &spec.stdout).await?;
    let stderr = open_log(&spec.uid, &spec.stderr).await?;

    Command::new(&spec.executable)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr))
        .spawn()
        .map_err(|source| SupervisorError::Spawn {
            executable: spec.executable.display().to_string(),
            source,
        })
}

/// Resolves once a stop was requested. A dropped sender never stops.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    if stop.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn terminate(uid: &str, child: &mut Child, signal: Signal, grace: Duration) -> Option<i32> {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
            warn!("Failed to signal {} ({}): {}", uid, pid, e);
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status.ok().and_then(|status| status.code()),
        Err(_) => {
            warn!("{} ignored {}, killing", uid, signal);
            let _ = child.kill().await;
            None
        }
    }
}

async fn supervise(
    spec: ProcessSpec,
    mut child: Child,
    events: mpsc::UnboundedSender<ProcessEvent>,
    mut stop: watch::Receiver<bool>,
) {
    let mut runs = 0;
    loop {
        runs += 1;
        let _ = events.send(ProcessEvent::Started { pid: child.id() });
        let started = Instant::now();

        let exited = tokio::select! {
            status = child.wait() => Some(status),
            _ = stop_requested(&mut stop) => None,
        };

        let (code, stopped) = match exited {
            Some(status) => (status.ok().and_then(|status| status.code()), false),
            None => (
                terminate(&spec.uid, &mut child, spec.kill_signal, spec.kill_grace).await,
                true,
            ),
        };

        let spinning = started.elapsed() < spec.min_uptime;
        if stopped || *stop.borrow() || runs >= spec.max_runs || spinning {
            debug!("{} exited with {:?} after {} run(s)", spec.uid, code, runs);
            let _ = events.send(ProcessEvent::Exited { code });
            return;
        }

        info!("Restarting {} (exit {:?})", spec.uid, code);
        child = match launch(&spec).await {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to restart {}: {}", spec.uid, e);
                let _ = events.send(ProcessEvent::Exited { code });
                return;
            }
        };
    }
}

#[async_trait]
impl ProcessSupervisor for CommandSupervisor {
    async fn spawn(&self, spec: ProcessSpec) -> SupervisorResult<Supervised> {
        let child = launch(&spec).await?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let (stop, stop_rx) = watch::channel(false);
        let handle = Arc::new(CommandHandle {
            args: spec.args.clone(),
            stop,
        });

        tokio::spawn(supervise(spec, child, events_tx, stop_rx));

        Ok(Supervised { handle, events })
    }
}
