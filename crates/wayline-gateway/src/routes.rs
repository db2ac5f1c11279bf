use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use wayline_core::definition::WorkflowDefinition;
use wayline_core::types::{ApprovalRequest, ApprovalResponse, Checkpoint, ExecutionId, WorkflowExecution};

use crate::error::ApiError;
use crate::state::AppState;

type ApiResult<T> = Result<Json<T>, ApiError>;

// GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Definitions ─────────────────────────────────────────────────

// GET /definitions
pub async fn list_definitions(State(state): State<Arc<AppState>>) -> Json<Value> {
    let definitions: Vec<Value> = state
        .engine
        .definitions()
        .iter()
        .map(|g| json!({"id": g.id, "version": g.version, "nodes": g.node_count()}))
        .collect();
    Json(json!({ "definitions": definitions }))
}

// POST /definitions
pub async fn register_definition(
    State(state): State<Arc<AppState>>,
    Json(definition): Json<WorkflowDefinition>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let graph = state.engine.register(&definition)?;
    info!(definition = %graph.id, version = %graph.version, "Definition registered via API");
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": graph.id, "version": graph.version, "nodes": graph.node_count()})),
    ))
}

// GET /tools
pub async fn list_tools(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "tools": state.engine.tools().definitions() }))
}

// ── Executions ──────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct StartBody {
    pub definition_id: String,
    pub version: String,
    #[serde(default)]
    pub input: Value,
}

// POST /executions (runs in the background)
pub async fn start_execution(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let exec = state
        .engine
        .create(&body.definition_id, &body.version, body.input)
        .await?;

    let engine = state.engine.clone();
    let execution_id = exec.execution_id.clone();
    tokio::spawn(async move {
        if let Err(e) = engine.run(&execution_id).await {
            error!(execution_id = %execution_id, error = %e, "Background run failed");
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({"execution_id": exec.execution_id, "status": exec.status})),
    ))
}

// GET /executions
pub async fn list_executions(State(state): State<Arc<AppState>>) -> ApiResult<Vec<WorkflowExecution>> {
    Ok(Json(state.engine.executions().await?))
}

// GET /executions/{id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkflowExecution> {
    let id = ExecutionId::from_string(&id);
    Ok(Json(state.engine.execution(&id).await?))
}

#[derive(Deserialize)]
pub struct CheckpointQuery {
    #[serde(default = "default_from")]
    pub from: u64,
}

fn default_from() -> u64 {
    1
}

// GET /executions/{id}/checkpoints?from=N
pub async fn list_checkpoints(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<CheckpointQuery>,
) -> ApiResult<Vec<Checkpoint>> {
    let id = ExecutionId::from_string(&id);
    // Unknown executions are a 404, not an empty list.
    state.engine.execution(&id).await?;
    Ok(Json(state.engine.checkpoints(&id, q.from).await?))
}

// GET /executions/{id}/approvals
pub async fn pending_approvals(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Vec<ApprovalRequest>> {
    let id = ExecutionId::from_string(&id);
    state.engine.execution(&id).await?;
    Ok(Json(state.engine.pending_approvals(&id).await?))
}

// POST /executions/{id}/resume
pub async fn resume_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(response): Json<ApprovalResponse>,
) -> ApiResult<WorkflowExecution> {
    let id = ExecutionId::from_string(&id);
    Ok(Json(state.engine.resume(&id, response).await?))
}

// POST /executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<WorkflowExecution> {
    let id = ExecutionId::from_string(&id);
    Ok(Json(state.engine.cancel(&id).await?))
}

#[derive(Deserialize)]
pub struct ReplayBody {
    pub from_sequence_number: u64,
}

// POST /executions/{id}/replay
pub async fn replay_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ReplayBody>,
) -> ApiResult<WorkflowExecution> {
    let id = ExecutionId::from_string(&id);
    Ok(Json(state.engine.replay(&id, body.from_sequence_number).await?))
}
