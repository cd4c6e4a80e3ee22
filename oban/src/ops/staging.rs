use std::collections::BTreeSet;

use crate::error::QueueError;

/// Flip matured `scheduled` and `retryable` rows to `available`, bounded by
/// `limit`. Returns the distinct queues that gained rows.
///
/// Staging is idempotent: a row is only flipped once, so a second pass over
/// the same rows is a no-op.
pub(crate) async fn stage_jobs<'c, E>(executor: E, limit: i64) -> Result<Vec<String>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let queues: Vec<String> = sqlx::query_scalar(
        r#"
WITH staged AS (
    SELECT id, queue
    FROM oban_jobs
    WHERE state IN ('scheduled', 'retryable')
      AND scheduled_at <= timezone('UTC', now())
    ORDER BY scheduled_at ASC, id ASC
    LIMIT $1
    FOR UPDATE SKIP LOCKED
)
UPDATE oban_jobs
SET state = 'available'
FROM staged
WHERE oban_jobs.id = staged.id
RETURNING staged.queue
        "#,
    )
    .bind(limit)
    .fetch_all(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "stage_jobs",
        error,
    })?;

    let distinct: BTreeSet<String> = queues.into_iter().collect();

    Ok(distinct.into_iter().collect())
}

/// Distinct queues that currently hold `available` rows. Producers for these
/// queues are notified on every stage tick, which also covers jobs that were
/// inserted directly as `available`.
pub(crate) async fn check_available_queues<'c, E>(executor: E) -> Result<Vec<String>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query_scalar("SELECT DISTINCT queue FROM oban_jobs WHERE state = 'available'")
        .fetch_all(executor)
        .await
        .map_err(|error| QueueError::Query {
            command: "check_available_queues",
            error,
        })
}
