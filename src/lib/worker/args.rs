use std::cmp::Reverse;
use std::collections::BTreeMap;

use super::types::StartArgument;
use crate::lib::tasks::executor::START_VERB;
use crate::lib::tasks::types::ContainerRecord;

/// Fraction of a CPU (0..1) to engine shares of 1024.
pub fn cpu_shares(cpus: f64) -> i64 {
    (1024.0 * cpus).floor() as i64
}

/// Resolves `$NAME` references to other declared variables. Longer names
/// are tried first so `$PORT0` is never read as `$PORT` followed by `0`.
pub fn substitute_env(env_vars: &BTreeMap<String, String>) -> Vec<(String, String)> {
    let mut names: Vec<&String> = env_vars.keys().collect();
    names.sort_by_key(|name| Reverse(name.len()));

    env_vars
        .iter()
        .map(|(key, value)| {
            let mut value = value.clone();
            for name in names.iter().filter(|name| **name != key) {
                let token = format!("${}", name);
                if value.contains(&token) {
                    value = value.replace(&token, &env_vars[*name]);
                }
            }
            (key.clone(), value)
        })
        .collect()
}

/// Engine arguments for a fresh start of `spec`.
pub fn start_arguments(
    spec: &ContainerRecord,
    cpu_shares: i64,
    extra: &BTreeMap<String, StartArgument>,
) -> Vec<String> {
    let host_port = spec.host_port.map(|p| p.to_string()).unwrap_or_default();

    let mut args = vec![
        START_VERB.to_string(),
        format!("--CpuShares={}", cpu_shares),
        format!("--Memory={}", spec.memory),
        format!("--Image={}", spec.image),
        format!("--name={}", spec.container_name()),
        format!("--host-port={}", host_port),
        format!("--HostConfig.NetworkMode={}", spec.network_mode),
        format!("--HostConfig.Privileged={}", spec.privileged),
    ];

    if let Some(command) = spec.command.as_deref().filter(|c| !c.is_empty()) {
        args.push(format!("--Cmd={}", command));
    }

    let binds: Vec<String> = spec
        .volumes
        .iter()
        .filter_map(|volume| {
            let host = volume.host.as_deref()?;
            Some(match &volume.propagation {
                Some(propagation) => format!("{}:{}:{}", host, volume.container, propagation),
                None => format!("{}:{}", host, volume.container),
            })
        })
        .collect();
    if !binds.is_empty() {
        args.push("--HostConfig.Binds".to_string());
        args.push(binds.join(" "));
    }

    for (key, value) in extra {
        args.push(format!("--{}", key));
        args.push(value.resolve(spec));
    }

    for (key, value) in substitute_env(&spec.env_vars) {
        args.push("--Env".to_string());
        args.push(format!("{}={}", key, value));
    }

    // every container sees a usable port, its own if negotiated
    if let Some(port) = spec.container_port.or(spec.host_port) {
        args.push("--Env".to_string());
        args.push(format!("PORT={}", port));
        args.push("--Env".to_string());
        args.push(format!("PORT0={}", port));
        args.push("--container-port".to_string());
        args.push(port.to_string());
    }

    args
}
