//! Operator HTTP surface for the migration.
//!
//! The communication listener itself belongs to the host process; this
//! module only builds the router it mounts. Two routes:
//! `GET /migration/result` returns the JSON [`MigrationResult`], and
//! `POST /migration/abort` triggers [`MigrationOrchestrator::abort`].

use crate::orchestrator::MigrationOrchestrator;
use crate::types::MigrationResult;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;

/// Build the migration operator router.
pub fn migration_router(orchestrator: Arc<MigrationOrchestrator>) -> Router {
    Router::new()
        .route("/migration/result", get(get_result))
        .route("/migration/abort", post(post_abort))
        .with_state(orchestrator)
}

async fn get_result(State(orchestrator): State<Arc<MigrationOrchestrator>>) -> Response {
    match orchestrator.get_result().await {
        Ok(result) => (StatusCode::OK, Json::<MigrationResult>(result)).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to read migration result");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn post_abort(State(orchestrator): State<Arc<MigrationOrchestrator>>) -> Response {
    match orchestrator.abort().await {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to abort migration");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MigrationSettings;
    use crate::source::SourceService;
    use crate::store::{InMemoryReplicaStore, ReplicaStore};
    use crate::testing::MockSource;
    use crate::types::MigrationState;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn orchestrator(source: Arc<MockSource>) -> Arc<MigrationOrchestrator> {
        let store: Arc<dyn ReplicaStore> = Arc::new(InMemoryReplicaStore::new());
        let settings = MigrationSettings::new("http://source/KvsMigration")
            .with_copy_workers(2)
            .with_downtime_threshold(10);
        Arc::new(
            MigrationOrchestrator::new(settings, store, source as Arc<dyn SourceService>).unwrap(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_result_route_reports_durable_state() {
        let source = Arc::new(MockSource::with_range(1, 20));
        let orch = orchestrator(Arc::clone(&source));
        orch.run().await.unwrap();

        let response = migration_router(Arc::clone(&orch))
            .oneshot(
                Request::builder()
                    .uri("/migration/result")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "Completed");
        assert_eq!(body["end_sn"], 20);
        assert_eq!(body["keys_migrated"], 20);

        // The body round-trips as a MigrationResult.
        let parsed: MigrationResult = serde_json::from_value(body).unwrap();
        assert_eq!(parsed.status, MigrationState::Completed);
    }

    #[tokio::test]
    async fn test_abort_route_sets_aborted_and_resumes_writes() {
        let source = Arc::new(MockSource::with_range(1, 20));
        let orch = orchestrator(Arc::clone(&source));

        let response = migration_router(Arc::clone(&orch))
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/migration/abort")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(source.resume_calls(), 1);
        assert!(orch.cancellation_token().is_cancelled());

        let result = orch.get_result().await.unwrap();
        assert_eq!(result.status, MigrationState::Aborted);
    }
}
