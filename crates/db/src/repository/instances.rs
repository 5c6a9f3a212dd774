//! Trigger instance repository functions.
//!
//! Workers never lock rows. Every state change is a conditional update on
//! the `revision` column: the caller reads a row, computes the next state and
//! writes it back only if nobody else wrote in between.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    DbError,
    models::{NodeExecutionRow, TriggerInstanceRow},
    repository::executions,
};

const INSTANCE_COLUMNS: &str = "id, workflow_id, workflow_version, context, current_node_id, \
     status, attempt, wake_at, owner, claim_token, lease_expires_at, last_error, revision, \
     created_at, updated_at";

/// Insert a freshly created trigger instance.
pub async fn insert_instance(pool: &PgPool, row: &TriggerInstanceRow) -> Result<(), DbError> {
    sqlx::query(
        r#"
        INSERT INTO trigger_instances
            (id, workflow_id, workflow_version, context, current_node_id, status, attempt,
             wake_at, owner, claim_token, lease_expires_at, last_error, revision,
             created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(row.id)
    .bind(row.workflow_id)
    .bind(row.workflow_version)
    .bind(&row.context)
    .bind(&row.current_node_id)
    .bind(&row.status)
    .bind(row.attempt)
    .bind(row.wake_at)
    .bind(&row.owner)
    .bind(row.claim_token)
    .bind(row.lease_expires_at)
    .bind(&row.last_error)
    .bind(row.revision)
    .bind(row.created_at)
    .bind(row.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

/// Fetch a single trigger instance by its primary key.
pub async fn get_instance(pool: &PgPool, id: Uuid) -> Result<TriggerInstanceRow, DbError> {
    let row = sqlx::query_as::<_, TriggerInstanceRow>(&format!(
        "SELECT {INSTANCE_COLUMNS} FROM trigger_instances WHERE id = $1"
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?
    .ok_or(DbError::NotFound)?;

    Ok(row)
}

/// Instances a worker may claim at `now`: pending ones, and delayed ones whose
/// wake time has passed. Oldest first.
pub async fn find_claimable(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<TriggerInstanceRow>, DbError> {
    let rows = sqlx::query_as::<_, TriggerInstanceRow>(&format!(
        r#"
        SELECT {INSTANCE_COLUMNS}
        FROM trigger_instances
        WHERE status = 'pending'
           OR (status = 'waiting_delay' AND wake_at <= $1)
        ORDER BY COALESCE(wake_at, created_at) ASC, created_at ASC
        LIMIT $2
        "#
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Running instances whose lease ran out before `now`.
pub async fn find_expired_leases(
    pool: &PgPool,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<TriggerInstanceRow>, DbError> {
    let rows = sqlx::query_as::<_, TriggerInstanceRow>(&format!(
        r#"
        SELECT {INSTANCE_COLUMNS}
        FROM trigger_instances
        WHERE status = 'running' AND lease_expires_at < $1
        ORDER BY lease_expires_at ASC
        LIMIT $2
        "#
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Write `next` over the stored row if the stored revision still equals
/// `expected_revision`, appending `record` in the same transaction.
///
/// Returns `false` (and writes nothing) when another writer got there first.
pub async fn compare_and_swap(
    pool: &PgPool,
    expected_revision: i64,
    next: &TriggerInstanceRow,
    record: Option<&NodeExecutionRow>,
) -> Result<bool, DbError> {
    let mut tx = pool.begin().await?;

    let result = sqlx::query(
        r#"
        UPDATE trigger_instances
        SET current_node_id = $1,
            status = $2,
            attempt = $3,
            wake_at = $4,
            owner = $5,
            claim_token = $6,
            lease_expires_at = $7,
            last_error = $8,
            revision = $9,
            updated_at = $10
        WHERE id = $11 AND revision = $12
        "#,
    )
    .bind(&next.current_node_id)
    .bind(&next.status)
    .bind(next.attempt)
    .bind(next.wake_at)
    .bind(&next.owner)
    .bind(next.claim_token)
    .bind(next.lease_expires_at)
    .bind(&next.last_error)
    .bind(next.revision)
    .bind(next.updated_at)
    .bind(next.id)
    .bind(expected_revision)
    .execute(&mut *tx)
    .await?;

    if result.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    if let Some(record) = record {
        executions::insert_node_execution(&mut *tx, record).await?;
    }

    tx.commit().await?;
    Ok(true)
}

/// Number of instances referencing a workflow (any version); with
/// `active_only`, terminal instances are excluded.
pub async fn count_instances(
    pool: &PgPool,
    workflow_id: Uuid,
    active_only: bool,
) -> Result<i64, DbError> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*)
        FROM trigger_instances
        WHERE workflow_id = $1
          AND (NOT $2 OR status NOT IN ('completed', 'failed', 'cancelled'))
        "#,
    )
    .bind(workflow_id)
    .bind(active_only)
    .fetch_one(pool)
    .await?;

    Ok(count)
}
