//! Read access to workflow definitions, plus the guarded hard delete.

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{EdgeRow, NodeTemplateRow, WorkflowRow},
};

/// Fetch one version of a workflow (soft-deleted versions are invisible).
pub async fn get_workflow(pool: &PgPool, id: Uuid, version: i32) -> Result<WorkflowRow, DbError> {
    let row = sqlx::query_as::<_, WorkflowRow>(
        r#"
        SELECT id, version, code, name, is_active, entry_node_id, deleted_at, created_at
        FROM workflows
        WHERE id = $1 AND version = $2 AND deleted_at IS NULL
        "#,
    )
    .bind(id)
    .bind(version)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// The highest active, non-deleted version of a workflow, if any.
pub async fn active_version(pool: &PgPool, id: Uuid) -> Result<Option<i32>, DbError> {
    let version: Option<i32> = sqlx::query_scalar(
        r#"
        SELECT MAX(version)
        FROM workflows
        WHERE id = $1 AND is_active AND deleted_at IS NULL
        "#,
    )
    .bind(id)
    .fetch_one(pool)
    .await?;

    Ok(version)
}

/// Nodes of a workflow version in declaration order.
pub async fn list_nodes(
    pool: &PgPool,
    workflow_id: Uuid,
    version: i32,
) -> Result<Vec<NodeTemplateRow>, DbError> {
    let rows = sqlx::query_as::<_, NodeTemplateRow>(
        r#"
        SELECT t.id, t.code, t.name, t.node_type, t.template_body
        FROM workflow_nodes n
        JOIN node_templates t ON t.id = n.node_id
        WHERE n.workflow_id = $1 AND n.version = $2
        ORDER BY n.position ASC
        "#,
    )
    .bind(workflow_id)
    .bind(version)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Edges of a workflow version in declaration order.
pub async fn list_edges(
    pool: &PgPool,
    workflow_id: Uuid,
    version: i32,
) -> Result<Vec<EdgeRow>, DbError> {
    let rows = sqlx::query_as::<_, EdgeRow>(
        r#"
        SELECT workflow_id, version, position, from_node_id, to_node_id, condition
        FROM workflow_edges
        WHERE workflow_id = $1 AND version = $2
        ORDER BY position ASC
        "#,
    )
    .bind(workflow_id)
    .bind(version)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Permanently delete every version of a workflow, unless a trigger
/// instance references it.
///
/// The workflow rows are locked `FOR UPDATE` before the reference count. A
/// concurrent instance insert takes a key-share lock on the same rows for its
/// foreign key check, so either it commits first and is counted, or it waits
/// for this transaction and then fails its foreign key.
///
/// Returns `DbError::NotFound` if the workflow does not exist and
/// `DbError::InUse` if instances reference it.
pub async fn delete_workflow(pool: &PgPool, id: Uuid) -> Result<(), DbError> {
    let mut tx = pool.begin().await?;

    let locked: Vec<i32> =
        sqlx::query_scalar("SELECT version FROM workflows WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_all(&mut *tx)
            .await?;
    if locked.is_empty() {
        return Err(DbError::NotFound);
    }

    let instances: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM trigger_instances WHERE workflow_id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
    if instances > 0 {
        return Err(DbError::InUse(instances));
    }

    sqlx::query("DELETE FROM workflows WHERE id = $1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}
