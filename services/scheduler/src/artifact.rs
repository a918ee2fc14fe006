//! HTTP artifact server and read-only admin surface.
//!
//! Hosts the two artifacts executors download (`/executor/<jar>` and
//! `/kafka/<distribution>`), a health endpoint, and a read-only broker
//! snapshot at `/api/brokers`. The snapshot is a copy; nothing on this
//! surface can mutate the cluster.

use std::path::Path;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use serde::Serialize;
use tower_http::services::ServeDir;

use crate::broker::Broker;
use crate::reconciler::Reconciler;

#[derive(Clone)]
struct ApiState {
    reconciler: Arc<Reconciler>,
}

/// Health check response.
#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct HealthResponse {
    status: String,
    service: String,
    version: String,
    timestamp: String,
}

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
struct BrokersResponse {
    brokers: Vec<Broker>,
}

/// Build the artifact/admin router.
pub fn create_router(reconciler: Arc<Reconciler>, artifact_dir: &Path) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/brokers", get(list_brokers))
        .nest_service("/executor", ServeDir::new(artifact_dir))
        .nest_service("/kafka", ServeDir::new(artifact_dir))
        .with_state(ApiState { reconciler })
}

async fn healthz() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "kfleet-scheduler".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

async fn list_brokers(State(state): State<ApiState>) -> impl IntoResponse {
    Json(BrokersResponse {
        brokers: state.reconciler.broker_snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;

    use crate::broker::Failover;
    use crate::cluster::Cluster;
    use crate::launch::TaskBuilder;

    use super::*;

    fn test_state(dir: &tempfile::TempDir) -> ApiState {
        let mut cluster = Cluster::new(dir.path().join("cluster.json"));
        cluster
            .add_broker(Broker {
                id: "0".to_string(),
                active: true,
                cpus: 1.0,
                mem: 512,
                heap: 256,
                options: Default::default(),
                task: None,
                failover: Failover::new(
                    Duration::from_secs(10),
                    Duration::from_secs(60),
                    Some(3),
                ),
            })
            .unwrap();

        let builder = TaskBuilder::new(
            "http://sched-1.dc:7000",
            "kfleet-executor.jar",
            "kafka.tgz",
            "zk-1:2181",
            false,
        );
        ApiState {
            reconciler: Arc::new(Reconciler::new(cluster, builder)),
        }
    }

    #[tokio::test]
    async fn test_healthz_returns_ok() {
        let response = healthz().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_list_brokers_returns_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);

        let response = list_brokers(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let parsed: BrokersResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed.brokers.len(), 1);
        assert_eq!(parsed.brokers[0].id, "0");
    }
}
