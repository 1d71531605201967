use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::lib::cluster::types::ClusterError;
use crate::lib::store::types::StoreError;
use crate::lib::tasks::types::ContainerRecord;

/// The start spec shared by every handler of a stage. Handlers that
/// read-modify-write the same field must do so under one lock acquisition.
pub type SharedSpec = Arc<Mutex<ContainerRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    PrePull,
    PreStart,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::PrePull => write!(f, "pre-pull"),
            Stage::PreStart => write!(f, "pre-start"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MiddlewareError {
    #[error("{0}")]
    Failed(String),

    #[error("record store: {0}")]
    Store(#[from] StoreError),

    #[error("volume service: {0}")]
    Volume(#[from] ClusterError),

    #[error("middleware '{name}' aborted: {reason}")]
    Aborted { name: String, reason: String },
}

pub type MiddlewareResult<T> = Result<T, MiddlewareError>;

#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, spec: SharedSpec) -> MiddlewareResult<()>;
}

/// Adapts an async closure into a [`Middleware`].
#[cfg(test)]
pub struct FnMiddleware<F>(F);

#[cfg(test)]
#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: Fn(SharedSpec) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = MiddlewareResult<()>> + Send + 'static,
{
    async fn handle(&self, spec: SharedSpec) -> MiddlewareResult<()> {
        (self.0)(spec).await
    }
}

#[cfg(test)]
pub fn middleware_fn<F, Fut>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(SharedSpec) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = MiddlewareResult<()>> + Send + 'static,
{
    Arc::new(FnMiddleware(f))
}

pub(super) type Handlers = RwLock<HashMap<String, Arc<dyn Middleware>>>;

/// Named pre-pull and pre-start handlers of one engine adapter.
#[derive(Default)]
pub struct MiddlewareRegistry {
    pub(super) pre_pull: Handlers,
    pub(super) pre_start: Handlers,
}
