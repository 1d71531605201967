use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::stats::get_stats;
use super::types::{AgentServer, SystemStats, WorkerError};
use crate::lib::scheduler::types::Scheduler;
use crate::lib::tasks::types::ContainerRecord;
use std::sync::Arc;

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRequest {
    pub application: String,
    pub container: ContainerRecord,
}

impl AgentServer {
    pub fn new(scheduler: Arc<Scheduler>, address: &str, port: u16) -> Self {
        Self {
            scheduler,
            address: address.to_string(),
            port,
        }
    }

    async fn list_containers(State(scheduler): State<Arc<Scheduler>>) -> Json<Vec<String>> {
        Json(scheduler.tracked())
    }

    async fn start_container(
        State(scheduler): State<Arc<Scheduler>>,
        Json(request): Json<StartRequest>,
    ) -> impl IntoResponse {
        info!(
            "Start requested for {} container {}",
            request.application, request.container.id
        );
        tokio::spawn(async move {
            let StartRequest {
                application,
                container,
            } = request;
            let id = container.id.clone();
            if let Err(e) = scheduler.start(&application, container).await {
                warn!("Failed to start {} container {}: {}", application, id, e);
            }
        });
        StatusCode::ACCEPTED
    }

    async fn stop_container(
        State(scheduler): State<Arc<Scheduler>>,
        Path((engine, application, id)): Path<(String, String, String)>,
    ) -> impl IntoResponse {
        match scheduler.stop(&engine, &application, &id).await {
            Ok(()) => (
                StatusCode::OK,
                format!("Container {} of {} stopped", id, application),
            ),
            Err(WorkerError::UnsupportedEngine(engine)) => (
                StatusCode::NOT_FOUND,
                format!("Engine {} not found", engine),
            ),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    async fn reconcile(State(scheduler): State<Arc<Scheduler>>) -> impl IntoResponse {
        scheduler.reconcile();
        StatusCode::ACCEPTED
    }

    async fn stats(State(scheduler): State<Arc<Scheduler>>) -> Json<SystemStats> {
        let counts = scheduler.counts();
        let stats = tokio::task::spawn_blocking(move || get_stats(&System::new_all(), counts))
            .await
            .unwrap_or_else(|_| get_stats(&System::new(), counts));
        Json(stats)
    }

    pub fn router(scheduler: Arc<Scheduler>) -> Router {
        Router::new()
            .route(
                "/containers",
                get(AgentServer::list_containers).post(AgentServer::start_container),
            )
            .route(
                "/containers/{engine}/{application}/{id}",
                delete(AgentServer::stop_container),
            )
            .route("/reconcile", post(AgentServer::reconcile))
            .route("/stats", get(AgentServer::stats))
            .with_state(scheduler)
    }

    pub async fn start_server(self) -> std::io::Result<()> {
        let app = AgentServer::router(self.scheduler);

        let listener = TcpListener::bind((self.address.as_str(), self.port)).await?;
        info!("Listening on {}:{}", self.address, self.port);

        axum::serve(listener, app).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::tasks::types::Status;
    use crate::lib::testing::{Harness, eventually, harness, record};

    const ID: &str = "00000000-0000-0000-0000-000000000001";

    fn scheduler(h: &Harness) -> Arc<Scheduler> {
        let mut scheduler = Scheduler::new(h.records.clone(), h.worker.tracker().clone());
        scheduler.add_worker(h.worker.clone());
        Arc::new(scheduler)
    }

    #[tokio::test]
    async fn test_start_then_list_then_stop() {
        let h = harness();
        h.records.put(&record("web", ID)).await.unwrap();
        let scheduler = scheduler(&h);

        let request = StartRequest {
            application: "web".to_string(),
            container: record("web", ID),
        };
        let response =
            AgentServer::start_container(State(scheduler.clone()), Json(request)).await;
        assert_eq!(response.into_response().status(), StatusCode::ACCEPTED);

        eventually(|| async {
            h.records.get("web", ID).await.unwrap().unwrap().status == Status::Loaded
        })
        .await;
        let Json(listed) = AgentServer::list_containers(State(scheduler.clone())).await;
        assert_eq!(listed, vec![ID.to_string()]);

        let response = AgentServer::stop_container(
            State(scheduler.clone()),
            Path(("docker".to_string(), "web".to_string(), ID.to_string())),
        )
        .await;
        assert_eq!(response.into_response().status(), StatusCode::OK);
        assert!(h.records.get("web", ID).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_engine() {
        let h = harness();
        let response = AgentServer::stop_container(
            State(scheduler(&h)),
            Path(("rkt".to_string(), "web".to_string(), ID.to_string())),
        )
        .await;
        assert_eq!(response.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_reconcile_is_accepted() {
        let h = harness();
        let response = AgentServer::reconcile(State(scheduler(&h))).await;
        assert_eq!(response.into_response().status(), StatusCode::ACCEPTED);
        eventually(|| async { h.engine.list_calls() == 1 }).await;
    }

    #[test]
    fn test_start_request_shape() {
        let request: StartRequest = serde_json::from_value(serde_json::json!({
            "application": "web",
            "container": {"id": ID, "engine": "docker", "cpus": 0.5}
        }))
        .unwrap();
        assert_eq!(request.container.cpus, 0.5);
        assert!(request.container.application_name.is_empty());
    }
}
