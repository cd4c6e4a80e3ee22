use crate::error::QueueError;

/// Reset `executing` rows whose producer has gone silent.
///
/// A producer is live when its registry row's heartbeat is within
/// `rescue_after_seconds`; a missing row counts as dead. Rescued rows go back
/// to `available` with their attempt count intact and `meta.rescued` bumped.
pub(crate) async fn rescue_jobs<'c, E>(
    executor: E,
    rescue_after_seconds: f64,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
WITH orphaned AS (
    SELECT j.id
    FROM oban_jobs j
    WHERE j.state = 'executing'
      AND NOT EXISTS (
          SELECT 1
          FROM oban_producers p
          WHERE p.uuid = j.attempted_by[array_upper(j.attempted_by, 1)]
            AND p.updated_at > timezone('UTC', now()) - make_interval(secs => $1)
      )
    FOR UPDATE SKIP LOCKED
)
UPDATE oban_jobs
SET
    state = 'available',
    meta = jsonb_set(meta, '{rescued}', to_jsonb(COALESCE((meta->>'rescued')::int, 0) + 1))
FROM orphaned
WHERE oban_jobs.id = orphaned.id
        "#,
    )
    .bind(rescue_after_seconds)
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "rescue_jobs",
        error,
    })?;

    Ok(result.rows_affected())
}

/// Delete terminal rows whose terminal timestamp is older than
/// `max_age_seconds`, at most `limit` per call to keep transactions short.
pub(crate) async fn prune_jobs<'c, E>(
    executor: E,
    max_age_seconds: f64,
    limit: i64,
) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
WITH pruned AS (
    SELECT id
    FROM oban_jobs
    WHERE (state = 'completed' AND completed_at <= timezone('UTC', now()) - make_interval(secs => $1))
       OR (state = 'cancelled' AND cancelled_at <= timezone('UTC', now()) - make_interval(secs => $1))
       OR (state = 'discarded' AND discarded_at <= timezone('UTC', now()) - make_interval(secs => $1))
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
DELETE FROM oban_jobs
USING pruned
WHERE oban_jobs.id = pruned.id
        "#,
    )
    .bind(max_age_seconds)
    .bind(limit)
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "prune_jobs",
        error,
    })?;

    Ok(result.rows_affected())
}
