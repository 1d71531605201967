use serde_json::{Map, Value};

use super::types::{ContainerRecord, Status};

/// A partial write against a container record. Only the fields that are set
/// are applied; `host`, `start_time` and the ports distinguish "leave alone"
/// (`None`) from "clear" (`Some(None)`).
#[derive(Debug, Clone, PartialEq)]
pub struct RecordUpdate {
    pub status: Status,
    pub host: Option<Option<String>>,
    pub start_time: Option<Option<i64>>,
    pub tags: Option<Map<String, Value>>,
    pub engine: Option<String>,
    pub host_port: Option<Option<u16>>,
    pub container_port: Option<Option<u16>>,
    pub respawn: Option<bool>,
}

impl RecordUpdate {
    pub fn new(status: Status) -> Self {
        RecordUpdate {
            status,
            host: None,
            start_time: None,
            tags: None,
            engine: None,
            host_port: None,
            container_port: None,
            respawn: None,
        }
    }

    pub fn loaded() -> Self {
        Self::new(Status::Loaded)
    }

    pub fn unloaded() -> Self {
        Self::new(Status::Unloaded)
    }

    /// `unloaded` with host and start time cleared.
    pub fn released() -> Self {
        Self::unloaded().host(None).start_time(None)
    }

    pub fn host(mut self, host: Option<String>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn start_time(mut self, start_time: Option<i64>) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn tags(mut self, tags: Map<String, Value>) -> Self {
        self.tags = Some(tags);
        self
    }

    pub fn engine(mut self, engine: &str) -> Self {
        self.engine = Some(engine.to_string());
        self
    }

    pub fn ports(mut self, host_port: Option<u16>, container_port: Option<u16>) -> Self {
        self.host_port = Some(host_port);
        self.container_port = Some(container_port);
        self
    }

    pub fn respawn(mut self, respawn: Option<bool>) -> Self {
        self.respawn = respawn;
        self
    }

    /// An update carrying `respawn=false` removes the record instead.
    pub fn deletes_record(&self) -> bool {
        self.respawn == Some(false)
    }
}

impl ContainerRecord {
    pub fn apply(&mut self, update: &RecordUpdate) {
        self.status = update.status;

        if let Some(host) = &update.host {
            self.host = host.clone();
        }
        if let Some(start_time) = update.start_time {
            self.start_time = start_time;
        }
        if let Some(tags) = &update.tags {
            self.tags = tags.clone();
        }
        if let Some(engine) = &update.engine {
            self.engine = engine.clone();
        }
        if let Some(host_port) = update.host_port {
            self.host_port = host_port;
        }
        if let Some(container_port) = update.container_port {
            self.container_port = container_port;
        }

        // a randomly assigned host port is given back on unload
        if self.status == Status::Unloaded && self.random_host_port {
            self.host_port = None;
        }
    }
}
