use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::{Map, Value};

/// Lifecycle status persisted on a container record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Loaded,
    #[default]
    Unloaded,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Loaded => write!(f, "loaded"),
            Status::Unloaded => write!(f, "unloaded"),
        }
    }
}

/// A bind mount declared on a container. `host` is `None` until a host path
/// has been fixed, either by placement or by volume provisioning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub container: String,
    #[serde(default, alias = "propogation", skip_serializing_if = "Option::is_none")]
    pub propagation: Option<String>,
}

/// One set of registry credentials. An empty value means an anonymous pull.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serveraddress: Option<String>,
}

/// The cluster-wide record for one container, and also the start spec handed
/// to the lifecycle processor. Fields this agent does not know about are kept
/// in `extra` so a read-modify-write never drops them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    /// Taken from the record key, never persisted in the value.
    #[serde(default, skip_serializing)]
    pub application_name: String,
    #[serde(default, deserialize_with = "de_nullable")]
    pub status: Status,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default, deserialize_with = "de_nullable")]
    pub engine: String,
    #[serde(default, deserialize_with = "de_nullable")]
    pub image: String,
    #[serde(default, deserialize_with = "de_port")]
    pub host_port: Option<u16>,
    #[serde(default, deserialize_with = "de_port")]
    pub container_port: Option<u16>,
    #[serde(default, deserialize_with = "de_nullable")]
    pub random_host_port: bool,
    #[serde(default, deserialize_with = "de_nullable")]
    pub tags: Map<String, Value>,
    #[serde(default, deserialize_with = "de_env_vars")]
    pub env_vars: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "de_nullable")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, deserialize_with = "de_nullable")]
    pub cpus: f64,
    /// Memory limit in megabytes.
    #[serde(default, deserialize_with = "de_nullable")]
    pub memory: u64,
    #[serde(default, deserialize_with = "de_nullable")]
    pub network_mode: String,
    #[serde(default, deserialize_with = "de_nullable")]
    pub privileged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respawn: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Vec<RegistryAuth>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContainerRecord {
    #[cfg(test)]
    pub fn new(application_name: &str, id: &str) -> Self {
        ContainerRecord {
            id: id.to_string(),
            application_name: application_name.to_string(),
            ..Default::default()
        }
    }

    /// Engine-level container name, `<application>-<id>`.
    pub fn container_name(&self) -> String {
        ManagedName::compose(&self.application_name, &self.id)
    }

    /// Volume id -> container path map kept under `tags.metadata.codexd.volumes`.
    pub fn volume_metadata(&self) -> Option<BTreeMap<String, String>> {
        let volumes = self
            .tags
            .get("metadata")?
            .get("codexd")?
            .get("volumes")?
            .as_object()?;

        Some(
            volumes
                .iter()
                .map(|(id, path)| (id.clone(), scalar_to_string(path.clone())))
                .collect(),
        )
    }

    pub fn set_volume_metadata(&mut self, volumes: &BTreeMap<String, String>) {
        let metadata = self
            .tags
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }

        let codexd = metadata
            .as_object_mut()
            .map(|m| m.entry("codexd").or_insert_with(|| Value::Object(Map::new())));
        if let Some(codexd) = codexd {
            if !codexd.is_object() {
                *codexd = Value::Object(Map::new());
            }
            if let Some(codexd) = codexd.as_object_mut() {
                let map = volumes
                    .iter()
                    .map(|(id, path)| (id.clone(), Value::String(path.clone())))
                    .collect();
                codexd.insert("volumes".to_string(), Value::Object(map));
            }
        }
    }
}

fn scalar_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn de_port<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|p| u16::try_from(p).ok())
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("port out of range: {}", n))),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => s.parse::<u16>().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("invalid port: {}", other))),
    }
}

/// Reads an explicit `null` the same as a missing field.
fn de_nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn de_env_vars<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<BTreeMap<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw
        .into_iter()
        .map(|(key, value)| (key, scalar_to_string(value)))
        .collect())
}

/// `<application>-<8>-<4>-<4>-<4>-<12>` where the trailing five segments are
/// lowercase hex. Containers whose names do not have this shape are not ours.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedName {
    pub application_name: String,
    pub container_id: String,
}

const ID_SEGMENT_LENGTHS: [usize; 5] = [8, 4, 4, 4, 12];

impl ManagedName {
    pub fn compose(application_name: &str, container_id: &str) -> String {
        format!("{}-{}", application_name, container_id)
    }

    pub fn parse(name: &str) -> Option<Self> {
        let name = name.strip_prefix('/').unwrap_or(name);
        let parts: Vec<&str> = name.split('-').collect();
        if parts.len() <= ID_SEGMENT_LENGTHS.len() {
            return None;
        }

        let split = parts.len() - ID_SEGMENT_LENGTHS.len();
        let (application, id) = parts.split_at(split);

        let shaped = id.iter().zip(ID_SEGMENT_LENGTHS).all(|(segment, len)| {
            segment.len() == len
                && segment
                    .chars()
                    .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        });
        let application_name = application.join("-");
        if !shaped || application_name.is_empty() {
            return None;
        }

        Some(ManagedName {
            application_name,
            container_id: id.join("-"),
        })
    }
}

/// A container as listed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub runtime_id: String,
    pub name: String,
}

/// A container as inspected on the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObservedContainer {
    pub runtime_id: String,
    pub name: String,
    pub running: bool,
    pub restarting: bool,
    /// Creation time in milliseconds since the epoch.
    pub created: Option<i64>,
    pub network_mode: Option<String>,
    /// Container-side port spec (e.g. `8080/tcp`) -> host ports bound to it.
    pub port_bindings: BTreeMap<String, Vec<String>>,
    pub env: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineVersion {
    pub client_version: Option<String>,
    pub api_version: Option<String>,
    pub go_version: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("failed to pull image '{image}': {reason}")]
    Pull { image: String, reason: String },

    #[error("invalid executor arguments: {0}")]
    InvalidArguments(String),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// Capability contract every container runtime adapter implements.
#[async_trait]
pub trait Engine: Send + Sync {
    fn name(&self) -> &str;

    async fn version(&self) -> EngineResult<EngineVersion>;

    async fn list_containers(&self, all: bool) -> EngineResult<Vec<ContainerSummary>>;

    async fn inspect(&self, runtime_id: &str) -> EngineResult<ObservedContainer>;

    async fn pull(&self, image: &str, auth: &RegistryAuth) -> EngineResult<()>;

    async fn kill(&self, runtime_id: &str) -> EngineResult<()>;

    async fn remove(&self, runtime_id: &str, force: bool) -> EngineResult<()>;
}
