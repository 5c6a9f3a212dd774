use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use uuid::Uuid;

use engine::{NodeExecutionRecord, TriggerInstance};

use crate::{ApiError, AppState};

#[derive(serde::Deserialize)]
pub struct CreateTriggerInstanceDto {
    pub context: Value,
}

pub async fn create(
    Path(workflow_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(payload): Json<CreateTriggerInstanceDto>,
) -> Result<(StatusCode, Json<TriggerInstance>), ApiError> {
    let instance = state
        .manager
        .create_trigger_instance(workflow_id, payload.context)
        .await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub async fn get(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<TriggerInstance>, ApiError> {
    Ok(Json(state.manager.get_trigger_instance(id).await?))
}

pub async fn cancel(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<TriggerInstance>, ApiError> {
    Ok(Json(state.manager.cancel_trigger_instance(id).await?))
}

pub async fn executions(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Vec<NodeExecutionRecord>>, ApiError> {
    Ok(Json(state.manager.list_execution_records(id).await?))
}
