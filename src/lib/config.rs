use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Serialize;
use sysinfo::System;

use crate::lib::store::types::DEFAULT_CONTAINERS_PREFIX;
use crate::lib::tasks::types::RegistryAuth;
use crate::lib::worker::types::DEFAULT_RECONCILE_DELAY;

#[derive(Debug, Parser)]
#[command(name = "corral", about = "Per-node container lifecycle agent")]
pub struct Cli {
    #[command(flatten)]
    pub options: Options,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Agent options. Also handed to every container as JSON.
#[derive(Debug, Clone, clap::Args, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Options {
    /// Id of this node in the cluster, defaults to the host name
    #[arg(long, env = "CORRAL_NODE_ID")]
    pub node_id: Option<String>,

    #[arg(long, env = "CORRAL_LISTEN_ADDRESS", default_value = "0.0.0.0")]
    pub listen_address: String,

    #[arg(long, env = "CORRAL_API_PORT", default_value_t = 8080)]
    pub api_port: u16,

    /// Container logs go to <dir>/applications/<application>/<id>
    #[arg(long, env = "CORRAL_BASE_LOG_DIR", default_value = "/var/log/corral")]
    pub base_log_dir: PathBuf,

    #[arg(long, env = "CORRAL_RECORD_PREFIX", default_value = DEFAULT_CONTAINERS_PREFIX)]
    pub record_prefix: String,

    #[arg(long, env = "CORRAL_VOLUME_BASE_PATH", default_value = "/var/lib/corral/volumes")]
    pub volume_base_path: String,

    /// Delay before the first reconciliation pass
    #[arg(long, env = "CORRAL_RECONCILE_DELAY_MS", default_value_t = DEFAULT_RECONCILE_DELAY.as_millis() as u64)]
    pub reconcile_delay_ms: u64,

    /// Extra engine start argument; `{application}` and `{id}` in the value
    /// expand per container. Repeatable.
    #[arg(long = "start-arg", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    #[serde(skip)]
    pub start_args: Vec<(String, String)>,

    /// Registry login for records without credentials of their own
    #[arg(long, env = "CORRAL_REGISTRY_USERNAME")]
    #[serde(skip)]
    pub registry_username: Option<String>,

    #[arg(long, env = "CORRAL_REGISTRY_PASSWORD", hide_env_values = true)]
    #[serde(skip)]
    pub registry_password: Option<String>,

    #[arg(long, env = "CORRAL_REGISTRY_SERVER")]
    #[serde(skip)]
    pub registry_server: Option<String>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

impl Options {
    pub fn node_id(&self) -> String {
        self.node_id
            .clone()
            .or_else(System::host_name)
            .unwrap_or_else(|| "localhost".to_string())
    }

    pub fn reconcile_delay(&self) -> Duration {
        Duration::from_millis(self.reconcile_delay_ms)
    }

    pub fn registry_auth(&self) -> Option<RegistryAuth> {
        let username = self.registry_username.clone()?;
        Some(RegistryAuth {
            username: Some(username),
            password: self.registry_password.clone(),
            serveraddress: self.registry_server.clone(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the agent (the default)
    Serve,

    /// Run the supervised executor of one container
    Executor {
        engine: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["corral", "--node-id", "node-1"]).unwrap();
        assert_eq!(cli.command, None);
        assert_eq!(cli.options.node_id(), "node-1");
        assert_eq!(cli.options.api_port, 8080);
        assert_eq!(cli.options.record_prefix, DEFAULT_CONTAINERS_PREFIX);
        assert_eq!(cli.options.reconcile_delay(), DEFAULT_RECONCILE_DELAY);
    }

    #[test]
    fn test_executor_keeps_engine_arguments() {
        let cli = Cli::try_parse_from([
            "corral",
            "executor",
            "docker",
            "start",
            "--CpuShares=512",
            "--Env",
            "PORT=8080",
        ])
        .unwrap();

        assert_eq!(
            cli.command,
            Some(Command::Executor {
                engine: "docker".to_string(),
                args: vec![
                    "start".to_string(),
                    "--CpuShares=512".to_string(),
                    "--Env".to_string(),
                    "PORT=8080".to_string(),
                ],
            })
        );
    }

    #[test]
    fn test_start_arguments_and_registry_login() {
        let cli = Cli::try_parse_from([
            "corral",
            "--start-arg",
            "HostConfig.Dns=10.0.0.2",
            "--start-arg",
            "Labels.owner={application}",
            "--registry-username",
            "robot",
            "--registry-password",
            "hunter2",
        ])
        .unwrap();

        assert_eq!(
            cli.options.start_args,
            vec![
                ("HostConfig.Dns".to_string(), "10.0.0.2".to_string()),
                ("Labels.owner".to_string(), "{application}".to_string()),
            ]
        );
        let auth = cli.options.registry_auth().unwrap();
        assert_eq!(auth.username.as_deref(), Some("robot"));
        assert_eq!(auth.password.as_deref(), Some("hunter2"));

        let value = serde_json::to_value(&cli.options).unwrap();
        assert!(value.get("registry-password").is_none());
        assert!(value.get("start-args").is_none());
    }

    #[test]
    fn test_start_argument_needs_key() {
        assert!(Cli::try_parse_from(["corral", "--start-arg", "=x"]).is_err());
        assert!(Cli::try_parse_from(["corral", "--start-arg", "novalue"]).is_err());
    }

    #[test]
    fn test_serialized_keys() {
        let cli = Cli::try_parse_from(["corral", "--base-log-dir", "/tmp/logs", "serve"]).unwrap();
        assert_eq!(cli.command, Some(Command::Serve));

        let value = serde_json::to_value(&cli.options).unwrap();
        assert_eq!(value["base-log-dir"], "/tmp/logs");
        assert_eq!(value["reconcile-delay-ms"], 2000);
    }
}
