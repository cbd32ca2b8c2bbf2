use super::{ApiError, ApiResult};
use crate::config::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use capflow_core::metrics::MetricsSnapshot;
use capflow_core::{execution_id_for, Value, WorkflowExecution};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const DEFAULT_PAGE_LIMIT: usize = 100;

/// Get a single execution with its steps
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(execution_id): Path<String>,
) -> ApiResult<Json<WorkflowExecution>> {
    let execution = state.store.get(&execution_id).await?;
    Ok(Json(execution))
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListExecutionsResponse {
    pub executions: Vec<WorkflowExecution>,
}

/// List executions still in progress, ordered by id
pub async fn list_unfinished(
    State(state): State<Arc<AppState>>,
    Query(page): Query<PageQuery>,
) -> ApiResult<Json<ListExecutionsResponse>> {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let executions = state.store.get_unfinished(page.offset, limit).await?;
    Ok(Json(ListExecutionsResponse { executions }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowGraphResponse {
    pub workflow_id: String,
    /// step ref -> refs of the steps depending on it
    pub dependents: BTreeMap<String, Vec<String>>,
}

/// Dependency graph of a hosted workflow
pub async fn workflow_graph(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<WorkflowGraphResponse>> {
    let engine = state
        .engines
        .get(&workflow_id)
        .ok_or_else(|| ApiError::not_found(format!("workflow `{}` not found", workflow_id)))?;

    Ok(Json(WorkflowGraphResponse {
        workflow_id,
        dependents: engine.graph().adjacency(),
    }))
}

/// Snapshot of every engine metric
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    /// Event id; a fresh one is generated when absent
    pub id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub workflow_id: String,
    pub event_id: String,
    pub execution_id: String,
    pub delivered: usize,
}

/// Fire the webhook triggers of a workflow
pub async fn trigger_workflow(
    State(state): State<Arc<AppState>>,
    Path(workflow_id): Path<String>,
    Json(req): Json<TriggerRequest>,
) -> ApiResult<(StatusCode, Json<TriggerResponse>)> {
    if !state.engines.contains_key(&workflow_id) {
        return Err(ApiError::not_found(format!("workflow `{}` not found", workflow_id)));
    }

    let event_id = req.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let delivered = state.webhooks.deliver(&workflow_id, &event_id, req.payload).await;
    if delivered == 0 {
        return Err(ApiError::not_found(format!(
            "workflow `{}` has no webhook trigger",
            workflow_id
        )));
    }

    tracing::info!("Delivered event {} to workflow {}", event_id, workflow_id);

    Ok((
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            execution_id: execution_id_for(&workflow_id, &event_id),
            workflow_id,
            event_id,
            delivered,
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::super::create_router;
    use super::*;
    use crate::capabilities::{LOG_TARGET_ID, WEBHOOK_TRIGGER_ID};
    use crate::config::{NodeSettings, WorkflowEntry};
    use axum::body::Body;
    use axum::http::Request;
    use axum::Router;
    use capflow_core::config::EngineConfig;
    use capflow_core::storage::InMemoryExecutionStore;
    use capflow_core::{CapabilityType, ExecutionStatus, StepDefinition, WorkflowSpec};
    use serde_json::json;
    use std::time::Duration;
    use tower::ServiceExt;

    fn price_feed() -> (WorkflowEntry, WorkflowSpec) {
        let spec = WorkflowSpec {
            name: "price-feed".into(),
            owner: "0xabc".into(),
            triggers: vec![StepDefinition::new(WEBHOOK_TRIGGER_ID, CapabilityType::Trigger)],
            targets: vec![StepDefinition::new(LOG_TARGET_ID, CapabilityType::Target)
                .with_ref("report")
                .with_inputs(json!({"price": "$(trigger.outputs.price)"}))],
            ..Default::default()
        };
        let entry = WorkflowEntry {
            id: "price-feed".into(),
            owner: "0xabc".into(),
            name: "price-feed".into(),
            spec: "price-feed.json".into(),
        };
        (entry, spec)
    }

    async fn setup() -> (AppState, Router) {
        let state = AppState::build(
            NodeSettings::default().to_node(),
            Arc::new(InMemoryExecutionStore::new()),
            &EngineConfig::default(),
            vec![price_feed()],
        )
        .await
        .unwrap();
        let router = create_router(state.clone());
        (state, router)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (state, router) = setup().await;
        let response = router.oneshot(get("/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["service"], "capflow");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_trigger_runs_workflow_to_completion() {
        let (state, router) = setup().await;
        let mut finished = state.engines["price-feed"].subscribe();

        let response = router
            .clone()
            .oneshot(post_json(
                "/api/workflows/price-feed/trigger",
                json!({"id": "evt-1", "payload": {"price": 42}}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = body_json(response).await;
        let execution_id = execution_id_for("price-feed", "evt-1");
        assert_eq!(body["execution_id"], execution_id.as_str());
        assert_eq!(body["delivered"], 1);

        let event = tokio::time::timeout(Duration::from_secs(5), finished.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.execution_id, execution_id);
        assert_eq!(event.status, ExecutionStatus::Completed);

        let response = router
            .oneshot(get(&format!("/api/executions/{}", execution_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "completed");
        assert_eq!(body["steps"]["report"]["outputs"]["value"], json!({"price": 42}));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_workflow_and_execution_are_not_found() {
        let (state, router) = setup().await;

        let response = router
            .clone()
            .oneshot(post_json("/api/workflows/nope/trigger", json!({"payload": {}})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router.clone().oneshot(get("/api/workflows/nope/graph")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router.oneshot(get("/api/executions/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("missing"));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_workflow_graph_lists_dependents() {
        let (state, router) = setup().await;
        let response = router.oneshot(get("/api/workflows/price-feed/graph")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["dependents"]["trigger"], json!(["report"]));
        assert_eq!(body["dependents"]["report"], json!([]));

        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_unfinished_is_empty_on_fresh_node() {
        let (state, router) = setup().await;
        let response = router
            .clone()
            .oneshot(get("/api/executions/unfinished?offset=0&limit=10"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["executions"], json!([]));

        let response = router.oneshot(get("/api/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_json(response).await["counters"].is_array());

        state.shutdown().await;
    }
}
