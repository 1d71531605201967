use async_trait::async_trait;
use tracing::debug;

use super::types::{Middleware, MiddlewareError, MiddlewareResult, SharedSpec};
use crate::lib::store::types::RecordStore;

pub const OPTIONS_MIDDLEWARE: &str = "CORRAL_OPTS";
pub const OPTIONS_ENV_VAR: &str = "CORRAL_OPTS";

/// Pre-start handler exposing the agent's configuration to the container as
/// a JSON env variable, then persisting the updated spec.
pub struct OptionInjector {
    options: String,
    records: RecordStore,
}

impl OptionInjector {
    pub fn new<T: serde::Serialize>(options: &T, records: RecordStore) -> MiddlewareResult<Self> {
        let options = serde_json::to_string(options)
            .map_err(|e| MiddlewareError::Failed(format!("unserializable options: {}", e)))?;
        Ok(OptionInjector { options, records })
    }
}

#[async_trait]
impl Middleware for OptionInjector {
    async fn handle(&self, spec: SharedSpec) -> MiddlewareResult<()> {
        let record = {
            let mut spec = spec.lock().await;
            spec.env_vars
                .insert(OPTIONS_ENV_VAR.to_string(), self.options.clone());
            spec.clone()
        };

        debug!(
            "Injected options into {} container {}",
            record.application_name, record.id
        );
        self.records.put(&record).await?;
        Ok(())
    }
}
