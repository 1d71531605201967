use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, warn};

use super::types::{
    Handlers, Middleware, MiddlewareError, MiddlewareRegistry, MiddlewareResult, SharedSpec, Stage,
};

impl MiddlewareRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self, stage: Stage) -> &Handlers {
        match stage {
            Stage::PrePull => &self.pre_pull,
            Stage::PreStart => &self.pre_start,
        }
    }

    /// Registers `handler` under `name`, replacing any previous one.
    pub fn add(&self, stage: Stage, name: &str, handler: Arc<dyn Middleware>) {
        let mut handlers = match self.handlers(stage).write() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        if handlers.insert(name.to_string(), handler).is_some() {
            debug!("Replaced {} middleware {}", stage, name);
        }
    }

    pub fn names(&self, stage: Stage) -> Vec<String> {
        let handlers = match self.handlers(stage).read() {
            Ok(handlers) => handlers,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut names: Vec<String> = handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Runs every handler of `stage` concurrently. All of them run to
    /// completion; the first error to come back is returned.
    pub async fn run(&self, stage: Stage, spec: SharedSpec) -> MiddlewareResult<()> {
        let handlers: Vec<(String, Arc<dyn Middleware>)> = {
            let handlers = match self.handlers(stage).read() {
                Ok(handlers) => handlers,
                Err(poisoned) => poisoned.into_inner(),
            };
            handlers
                .iter()
                .map(|(name, handler)| (name.clone(), handler.clone()))
                .collect()
        };

        let mut pending: FuturesUnordered<_> = handlers
            .into_iter()
            .map(|(name, handler)| {
                let spec = spec.clone();
                let task = tokio::spawn(async move { handler.handle(spec).await });
                async move { (name, task.await) }
            })
            .collect();

        let mut first_error = None;
        while let Some((name, outcome)) = pending.next().await {
            let result = match outcome {
                Ok(result) => result,
                Err(e) => Err(MiddlewareError::Aborted {
                    name: name.clone(),
                    reason: e.to_string(),
                }),
            };

            if let Err(e) = result {
                warn!("{} middleware {} failed: {}", stage, name, e);
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::middleware::types::middleware_fn;
    use crate::lib::tasks::types::ContainerRecord;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    fn spec() -> SharedSpec {
        Arc::new(Mutex::new(ContainerRecord::new(
            "web",
            "3f2a1b4c-0d1e-4f5a-8b9c-0123456789ab",
        )))
    }

    #[tokio::test]
    async fn test_empty_stage_succeeds() {
        let registry = MiddlewareRegistry::new();
        assert!(registry.run(Stage::PrePull, spec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_handlers_share_the_spec() {
        let registry = MiddlewareRegistry::new();
        for key in ["A", "B", "C"] {
            registry.add(
                Stage::PreStart,
                key,
                middleware_fn(move |spec: SharedSpec| async move {
                    spec.lock()
                        .await
                        .env_vars
                        .insert(key.to_string(), "1".to_string());
                    Ok::<(), MiddlewareError>(())
                }),
            );
        }

        let shared = spec();
        registry.run(Stage::PreStart, shared.clone()).await.unwrap();
        assert_eq!(shared.lock().await.env_vars.len(), 3);
        assert!(registry.run(Stage::PrePull, shared).await.is_ok());
    }

    #[tokio::test]
    async fn test_reregistering_replaces() {
        let registry = MiddlewareRegistry::new();
        registry.add(
            Stage::PrePull,
            "auth",
            middleware_fn(|_| async { Err::<(), _>(MiddlewareError::Failed("old".to_string())) }),
        );
        registry.add(Stage::PrePull, "auth", middleware_fn(|_| async { Ok::<(), MiddlewareError>(()) }));

        assert_eq!(registry.names(Stage::PrePull), vec!["auth"]);
        assert!(registry.run(Stage::PrePull, spec()).await.is_ok());
    }

    #[tokio::test]
    async fn test_first_error_wins_and_others_complete() {
        let registry = MiddlewareRegistry::new();
        let completed = Arc::new(AtomicUsize::new(0));

        registry.add(
            Stage::PreStart,
            "fast-fail",
            middleware_fn(|_| async { Err::<(), _>(MiddlewareError::Failed("fast".to_string())) }),
        );
        registry.add(
            Stage::PreStart,
            "slow-fail",
            middleware_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Err::<(), _>(MiddlewareError::Failed("slow".to_string()))
            }),
        );
        let counter = completed.clone();
        registry.add(
            Stage::PreStart,
            "slow-ok",
            middleware_fn(move |_| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), MiddlewareError>(())
                }
            }),
        );

        let err = registry.run(Stage::PreStart, spec()).await.unwrap_err();
        assert_eq!(err.to_string(), "fast");
        assert_eq!(completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_is_an_error() {
        let registry = MiddlewareRegistry::new();
        registry.add(
            Stage::PreStart,
            "broken",
            middleware_fn(|_| async {
                if true {
                    panic!("boom");
                }
                Ok::<(), MiddlewareError>(())
            }),
        );

        let err = registry.run(Stage::PreStart, spec()).await.unwrap_err();
        assert!(matches!(err, MiddlewareError::Aborted { ref name, .. } if name == "broken"));
    }
}
