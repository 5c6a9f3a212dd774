use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use engine::{DeletionKind, EngineError, StoreError};

use crate::{ApiError, AppState};

/// The delete guard predicate, for callers deciding whether to offer a
/// delete at all.
pub async fn active_instances(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let active = state.manager.has_active_instances(id).await?;
    Ok(Json(json!({ "workflow_id": id, "has_active_instances": active })))
}

pub async fn delete(
    Path(id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.manager.ensure_deletable(id, DeletionKind::Hard).await?;
    // The store re-checks under its own lock; an instance created since the
    // guard ran still blocks the delete.
    match state.workflows.remove_workflow(id).await {
        Err(StoreError::InUse { instances }) => {
            return Err(EngineError::WorkflowInUse {
                workflow_id: id,
                instances,
            }
            .into())
        }
        other => other?,
    }
    info!(workflow_id = %id, "workflow deleted");
    Ok(StatusCode::NO_CONTENT)
}
