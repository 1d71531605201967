use async_trait::async_trait;
use tracing::debug;

use super::types::{Middleware, MiddlewareResult, SharedSpec};
use crate::lib::tasks::types::RegistryAuth;

pub const CREDENTIALS_MIDDLEWARE: &str = "registry-credentials";

/// Pre-pull handler lending the agent's registry login to records that carry
/// no credentials of their own. An anonymous pull stays as the fallback.
pub struct CredentialInjector {
    auth: RegistryAuth,
}

impl CredentialInjector {
    pub fn new(auth: RegistryAuth) -> Self {
        CredentialInjector { auth }
    }
}

#[async_trait]
impl Middleware for CredentialInjector {
    async fn handle(&self, spec: SharedSpec) -> MiddlewareResult<()> {
        let mut spec = spec.lock().await;
        if spec.auth.is_none() {
            debug!(
                "Using agent registry credentials for {} container {}",
                spec.application_name, spec.id
            );
            spec.auth = Some(vec![self.auth.clone(), RegistryAuth::default()]);
        }
        Ok(())
    }
}
