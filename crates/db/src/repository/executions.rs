//! Node execution repository functions.

use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{DbError, models::NodeExecutionRow};

/// Append a node execution record.
///
/// Takes a connection rather than the pool so the insert can share the
/// transaction of the instance update it belongs to.
pub async fn insert_node_execution(
    conn: &mut PgConnection,
    row: &NodeExecutionRow,
) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO node_executions
            (id, trigger_instance_id, node_id, attempt_number, started_at, finished_at,
             outcome, rendered_payload_ref, error)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(row.id)
    .bind(row.trigger_instance_id)
    .bind(&row.node_id)
    .bind(row.attempt_number)
    .bind(row.started_at)
    .bind(row.finished_at)
    .bind(&row.outcome)
    .bind(&row.rendered_payload_ref)
    .bind(&row.error)
    .execute(conn)
    .await?;

    Ok(())
}

/// All execution records of one trigger instance, in the order they were
/// committed.
pub async fn list_node_executions(
    pool: &PgPool,
    trigger_instance_id: Uuid,
) -> Result<Vec<NodeExecutionRow>, DbError> {
    let rows = sqlx::query_as::<_, NodeExecutionRow>(
        r#"
        SELECT id, trigger_instance_id, node_id, attempt_number, started_at, finished_at,
               outcome, rendered_payload_ref, error
        FROM node_executions
        WHERE trigger_instance_id = $1
        ORDER BY seq ASC
        "#,
    )
    .bind(trigger_instance_id)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}
