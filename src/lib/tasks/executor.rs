//! The supervised subprocess behind every tracked container.
//!
//! The agent re-executes itself as `executor <engine> <verb> <args..>`:
//! `start` launches a fresh container from synthesized arguments and removes
//! it on SIGTERM, `wait` only observes a container that is already running.

use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use super::docker::{DOCKER_ENGINE, DockerEngine};
use super::types::{EngineError, EngineResult};

pub const START_VERB: &str = "start";
pub const ATTACH_VERB: &str = "wait";

/// Everything `start` needs to create a container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSpec {
    pub cpu_shares: i64,
    pub memory: u64,
    pub image: String,
    pub name: String,
    pub host_port: Option<u16>,
    pub container_port: Option<u16>,
    pub network_mode: String,
    pub privileged: bool,
    pub command: Option<String>,
    pub binds: Vec<String>,
    pub env: Vec<String>,
    /// Engine-specific arguments this executor does not interpret.
    pub extra: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorCommand {
    Start(LaunchSpec),
    Wait { container: String },
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> EngineResult<T> {
    value
        .parse()
        .map_err(|_| EngineError::InvalidArguments(format!("{}={}", key, value)))
}

fn parse_port(key: &str, value: &str) -> EngineResult<Option<u16>> {
    if value.is_empty() {
        Ok(None)
    } else {
        parse_number(key, value).map(Some)
    }
}

impl ExecutorCommand {
    /// Parses `--key=value` and `--key value` pairs following the verb.
    pub fn parse(args: &[String]) -> EngineResult<Self> {
        let (verb, rest) = args
            .split_first()
            .ok_or_else(|| EngineError::InvalidArguments("missing verb".to_string()))?;

        let mut pairs = Vec::new();
        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            let flag = arg
                .strip_prefix("--")
                .ok_or_else(|| EngineError::InvalidArguments(format!("unexpected '{}'", arg)))?;
            match flag.split_once('=') {
                Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
                None => {
                    let value = iter.next().ok_or_else(|| {
                        EngineError::InvalidArguments(format!("missing value for --{}", flag))
                    })?;
                    pairs.push((flag.to_string(), value.clone()));
                }
            }
        }

        match verb.as_str() {
            START_VERB => Self::parse_start(pairs).map(ExecutorCommand::Start),
            ATTACH_VERB => pairs
                .into_iter()
                .find(|(key, _)| key == "container")
                .map(|(_, container)| ExecutorCommand::Wait { container })
                .ok_or_else(|| EngineError::InvalidArguments("missing --container".to_string())),
            other => Err(EngineError::InvalidArguments(format!("unknown verb '{}'", other))),
        }
    }

    fn parse_start(pairs: Vec<(String, String)>) -> EngineResult<LaunchSpec> {
        let mut spec = LaunchSpec::default();
        for (key, value) in pairs {
            match key.as_str() {
                "CpuShares" => spec.cpu_shares = parse_number(&key, &value)?,
                "Memory" => spec.memory = parse_number(&key, &value)?,
                "Image" => spec.image = value,
                "name" => spec.name = value,
                "host-port" => spec.host_port = parse_port(&key, &value)?,
                "container-port" => spec.container_port = parse_port(&key, &value)?,
                "HostConfig.NetworkMode" => spec.network_mode = value,
                "HostConfig.Privileged" => spec.privileged = value == "true",
                "Cmd" => spec.command = Some(value),
                "HostConfig.Binds" => {
                    spec.binds = value.split_whitespace().map(str::to_string).collect()
                }
                "Env" => spec.env.push(value),
                _ => spec.extra.push((key, value)),
            }
        }

        if spec.image.is_empty() || spec.name.is_empty() {
            return Err(EngineError::InvalidArguments(
                "--Image and --name are required".to_string(),
            ));
        }

        Ok(spec)
    }
}

async fn terminated() {
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Unable to listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// Runs the executor to completion and returns the process exit code.
pub async fn run_executor(engine: &str, args: &[String]) -> EngineResult<i32> {
    if engine != DOCKER_ENGINE {
        return Err(EngineError::Unavailable(format!("unsupported engine '{}'", engine)));
    }

    let docker = DockerEngine::connect()?;

    match ExecutorCommand::parse(args)? {
        ExecutorCommand::Start(spec) => {
            for (key, value) in &spec.extra {
                warn!("Ignoring engine argument --{} {}", key, value);
            }

            let runtime_id = docker.launch(&spec).await?;
            tokio::select! {
                code = docker.wait(&runtime_id) => {
                    let code = code?;
                    info!("Container {} exited with {}", spec.name, code);
                    Ok(code as i32)
                }
                _ = terminated() => {
                    info!("Stopping container {}", spec.name);
                    docker.stop_and_remove(&runtime_id).await?;
                    Ok(0)
                }
            }
        }
        ExecutorCommand::Wait { container } => {
            tokio::select! {
                code = docker.wait(&container) => Ok(code? as i32),
                _ = terminated() => Ok(0),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_start_arguments() {
        let command = ExecutorCommand::parse(&args(&[
            "start",
            "--CpuShares=512",
            "--Memory=128",
            "--Image=nginx:latest",
            "--name=web-3f2a1b4c-0d1e-4f5a-8b9c-0123456789ab",
            "--host-port=31000",
            "--HostConfig.NetworkMode=bridge",
            "--HostConfig.Privileged=false",
            "--HostConfig.Binds",
            "/a:/data /b:/logs:shared",
            "--HostConfig.Dns",
            "1.1.1.1",
            "--Env",
            "NAME=web=prod",
            "--Env",
            "PORT=8080",
            "--container-port",
            "8080",
        ]))
        .unwrap();

        let ExecutorCommand::Start(spec) = command else {
            panic!("expected start");
        };
        assert_eq!(spec.cpu_shares, 512);
        assert_eq!(spec.memory, 128);
        assert_eq!(spec.host_port, Some(31000));
        assert_eq!(spec.container_port, Some(8080));
        assert!(!spec.privileged);
        assert_eq!(spec.binds, vec!["/a:/data", "/b:/logs:shared"]);
        assert_eq!(spec.env, vec!["NAME=web=prod", "PORT=8080"]);
        assert_eq!(spec.extra, vec![("HostConfig.Dns".to_string(), "1.1.1.1".to_string())]);
        assert_eq!(spec.command, None);
    }

    #[test]
    fn test_parse_wait() {
        let command = ExecutorCommand::parse(&args(&["wait", "--container", "abc123"])).unwrap();
        assert_eq!(
            command,
            ExecutorCommand::Wait {
                container: "abc123".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ExecutorCommand::parse(&[]).is_err());
        assert!(ExecutorCommand::parse(&args(&["restart"])).is_err());
        assert!(ExecutorCommand::parse(&args(&["wait"])).is_err());
        assert!(ExecutorCommand::parse(&args(&["start", "--Image=nginx"])).is_err());
        assert!(ExecutorCommand::parse(&args(&["start", "--Image=nginx", "--name"])).is_err());
        assert!(
            ExecutorCommand::parse(&args(&["start", "--Image=nginx", "--name=x", "--CpuShares=a"]))
                .is_err()
        );
    }
}
