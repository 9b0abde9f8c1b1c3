//! Workflow lifecycle and callback handlers for the REST API.
//!
//! Endpoints for starting instances, driving them through pause / resume /
//! stop / restart, inspecting execution state, and receiving worker
//! completion callbacks.

use std::collections::HashMap;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

use stepflow_core::queue::broker::{MessageBroker, RESULT_QUEUE};
use stepflow_types::callback::CallbackMessage;
use stepflow_types::error::EngineError;
use stepflow_types::execution::WorkflowExecution;

use crate::http::error::AppError;
use crate::http::response::ApiResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

/// Query parameters for listing executions.
#[derive(Debug, Deserialize)]
pub struct ListExecutionsQuery {
    /// Maximum number of executions to return (default 20).
    #[serde(default = "default_execution_limit")]
    pub limit: u32,
}

fn default_execution_limit() -> u32 {
    20
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the workflow sub-router.
///
/// Mounted at the root by the main router; the paths here are the ones
/// workers and operators see, and `/workflow/callback` is the route the
/// dispatcher advertises as `callBackUrl`.
pub fn workflow_routes() -> Router<AppState> {
    Router::new()
        // Lifecycle
        .route(
            "/workflow/start/{workflow_id}",
            get(start_workflow_get).post(start_workflow_post),
        )
        .route("/workflow/stop/{execution_id}", get(stop_workflow))
        .route("/workflow/pause/{execution_id}", get(pause_workflow))
        .route("/workflow/resume/{execution_id}", get(resume_workflow))
        .route("/workflow/state/{execution_id}", get(execution_state))
        .route("/workflow/restart/{execution_id}", get(restart_workflow))
        // Audit
        .route("/workflow/executions/{workflow_id}", get(list_executions))
        // Worker ingress
        .route("/workflow/callback", post(receive_callback))
}

// ---------------------------------------------------------------------------
// Lifecycle handlers
// ---------------------------------------------------------------------------

/// GET /workflow/start/:workflow_id - Start an instance with no input.
pub async fn start_workflow_get(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    start_workflow(&state, &workflow_id, HashMap::new()).await
}

/// POST /workflow/start/:workflow_id - Start an instance with input
/// parameters from the JSON body.
pub async fn start_workflow_post(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(input): Json<HashMap<String, serde_json::Value>>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    start_workflow(&state, &workflow_id, input).await
}

async fn start_workflow(
    state: &AppState,
    workflow_id: &Uuid,
    input: HashMap<String, serde_json::Value>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.runner.start(workflow_id, input).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/workflow/state/{}", execution.id);
    let executions_link = format!("/workflow/executions/{workflow_id}");
    let resp = ApiResponse::success(execution, request_id, elapsed)
        .with_link("self", &self_link)
        .with_link("executions", &executions_link);

    Ok(Json(resp))
}

/// GET /workflow/stop/:execution_id - Terminate an execution.
pub async fn stop_workflow(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.runner.stop(&execution_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/workflow/state/{execution_id}");
    Ok(Json(
        ApiResponse::success(execution, request_id, elapsed).with_link("self", &self_link),
    ))
}

/// GET /workflow/pause/:execution_id - Defer the next dispatch until resume.
pub async fn pause_workflow(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.runner.pause(&execution_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/workflow/state/{execution_id}");
    let resume_link = format!("/workflow/resume/{execution_id}");
    Ok(Json(
        ApiResponse::success(execution, request_id, elapsed)
            .with_link("self", &self_link)
            .with_link("resume", &resume_link),
    ))
}

/// GET /workflow/resume/:execution_id - Resume a paused execution,
/// dispatching the deferred step if one accumulated.
pub async fn resume_workflow(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.runner.resume(&execution_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/workflow/state/{execution_id}");
    Ok(Json(
        ApiResponse::success(execution, request_id, elapsed).with_link("self", &self_link),
    ))
}

/// GET /workflow/state/:execution_id - Current execution record.
pub async fn execution_state(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.runner.execution_state(&execution_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/workflow/state/{execution_id}");
    let executions_link = format!("/workflow/executions/{}", execution.workflow_id);
    Ok(Json(
        ApiResponse::success(execution, request_id, elapsed)
            .with_link("self", &self_link)
            .with_link("executions", &executions_link),
    ))
}

/// GET /workflow/restart/:execution_id - Re-run a terminal execution of a
/// restartable definition as a fresh instance with the same input.
pub async fn restart_workflow(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ApiResponse<WorkflowExecution>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let execution = state.runner.restart(&execution_id).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/workflow/state/{}", execution.id);
    Ok(Json(
        ApiResponse::success(execution, request_id, elapsed).with_link("self", &self_link),
    ))
}

// ---------------------------------------------------------------------------
// Audit handlers
// ---------------------------------------------------------------------------

/// GET /workflow/executions/:workflow_id - Recent executions for a
/// definition, newest first.
pub async fn list_executions(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Query(query): Query<ListExecutionsQuery>,
) -> Result<Json<ApiResponse<Vec<WorkflowExecution>>>, AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    let executions = state.runner.list_executions(&workflow_id, query.limit).await?;

    let elapsed = start.elapsed().as_millis() as u64;
    let self_link = format!("/workflow/executions/{workflow_id}");
    Ok(Json(
        ApiResponse::success(executions, request_id, elapsed).with_link("self", &self_link),
    ))
}

// ---------------------------------------------------------------------------
// Worker ingress
// ---------------------------------------------------------------------------

/// POST /workflow/callback - Worker-facing completion ingress.
///
/// Validates the message shape, then publishes it onto the result queue
/// for the intake consumers. Returns 202: the state transition happens
/// asynchronously, and the queue's at-least-once delivery makes a retried
/// POST harmless.
pub async fn receive_callback(
    State(state): State<AppState>,
    Json(message): Json<CallbackMessage>,
) -> Result<(StatusCode, Json<ApiResponse<serde_json::Value>>), AppError> {
    let start = Instant::now();
    let request_id = Uuid::now_v7().to_string();

    message
        .validate()
        .map_err(|err| AppError::Engine(EngineError::PayloadNotValid(err.to_string())))?;

    let payload =
        serde_json::to_value(&message).map_err(|err| AppError::Internal(err.to_string()))?;
    state
        .broker
        .publish(RESULT_QUEUE, payload)
        .await
        .map_err(|err| AppError::Internal(err.to_string()))?;

    debug!(
        instance_id = %message.workflow_instance_id,
        step_instance_id = %message.step_instance_id,
        "callback accepted"
    );

    let elapsed = start.elapsed().as_millis() as u64;
    let resp = ApiResponse::success(
        serde_json::json!({
            "workflowInstanceId": message.workflow_instance_id,
            "stepInstanceId": message.step_instance_id,
            "status": "accepted",
        }),
        request_id,
        elapsed,
    );

    Ok((StatusCode::ACCEPTED, Json(resp)))
}
