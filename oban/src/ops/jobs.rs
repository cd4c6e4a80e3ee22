use chrono::Utc;
use sqlx::types::Json;
use sqlx::QueryBuilder;

use crate::error::QueueError;
use crate::job::{ErrorEntry, Job, JobRow, JobState, NewJob};

/// Bulk insert jobs in a single statement, returning the stored rows.
///
/// Rows whose `scheduled_at` is absent or in the past are inserted
/// `available` with `scheduled_at` pinned to now; future rows are inserted
/// `scheduled`. Every job is validated before anything is written.
pub(crate) async fn insert_jobs<'c, E>(executor: E, jobs: &[NewJob]) -> Result<Vec<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    for job in jobs {
        job.validate()?;
    }

    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();

    let mut builder = QueryBuilder::new(
        "INSERT INTO oban_jobs \
         (state, queue, worker, args, meta, tags, attempt, max_attempts, priority, inserted_at, scheduled_at) ",
    );

    builder.push_values(jobs, |mut row, job| {
        let scheduled_at = job.scheduled_at.unwrap_or(now);
        let state = if scheduled_at <= now {
            JobState::Available
        } else {
            JobState::Scheduled
        };

        row.push_bind(state.as_str())
            .push_bind(&job.queue)
            .push_bind(&job.worker)
            .push_bind(Json(&job.args))
            .push_bind(Json(&job.meta))
            .push_bind(&job.tags)
            .push_bind(0_i32)
            .push_bind(job.max_attempts)
            .push_bind(job.priority)
            .push_bind(now.naive_utc())
            .push_bind(scheduled_at.naive_utc());
    });

    builder.push(" RETURNING *");

    let rows: Vec<JobRow> = builder
        .build_query_as()
        .fetch_all(executor)
        .await
        .map_err(|error| QueueError::Query {
            command: "insert_jobs",
            error,
        })?;

    rows.into_iter().map(Job::try_from).collect()
}

/// Atomically claim up to `demand` available jobs for a producer.
///
/// Selected rows move to `executing` with their attempt incremented and the
/// `(node, uuid)` pair appended to `attempted_by`. The `FOR UPDATE SKIP
/// LOCKED` clause keeps concurrent producers from claiming the same rows.
pub(crate) async fn fetch_jobs<'c, E>(
    executor: E,
    queue: &str,
    demand: i64,
    node: &str,
    uuid: &str,
) -> Result<Vec<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let rows: Vec<JobRow> = sqlx::query_as(
        r#"
WITH fetched AS (
    SELECT id
    FROM oban_jobs
    WHERE state = 'available' AND queue = $1
    ORDER BY priority ASC, scheduled_at ASC, id ASC
    LIMIT $2
    FOR UPDATE SKIP LOCKED
)
UPDATE oban_jobs
SET
    state = 'executing',
    attempt = oban_jobs.attempt + 1,
    attempted_at = timezone('UTC', now()),
    attempted_by = oban_jobs.attempted_by || ARRAY[$3, $4]
FROM fetched
WHERE oban_jobs.id = fetched.id
RETURNING oban_jobs.*
        "#,
    )
    .bind(queue)
    .bind(demand)
    .bind(node)
    .bind(uuid)
    .fetch_all(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "fetch_jobs",
        error,
    })?;

    rows.into_iter().map(Job::try_from).collect()
}

pub(crate) async fn get_job<'c, E>(executor: E, id: i64) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let row: Option<JobRow> = sqlx::query_as("SELECT * FROM oban_jobs WHERE id = $1")
        .bind(id)
        .fetch_optional(executor)
        .await
        .map_err(|error| QueueError::Query {
            command: "get_job",
            error,
        })?;

    row.map(Job::try_from).transpose()
}

pub(crate) async fn complete_job<'c, E>(executor: E, id: i64) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        "UPDATE oban_jobs SET state = 'completed', completed_at = timezone('UTC', now()) WHERE id = $1",
    )
    .bind(id)
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "complete_job",
        error,
    })?;

    Ok(())
}

pub(crate) async fn cancel_job<'c, E>(
    executor: E,
    id: i64,
    attempt: i32,
    reason: &str,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let entry = ErrorEntry {
        at: Utc::now(),
        attempt,
        error: reason.to_owned(),
    };

    sqlx::query(
        r#"
UPDATE oban_jobs
SET
    state = 'cancelled',
    cancelled_at = timezone('UTC', now()),
    errors = errors || $2
WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(Json(entry))
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "cancel_job",
        error,
    })?;

    Ok(())
}

/// Put a job back to sleep without consuming an attempt.
pub(crate) async fn snooze_job<'c, E>(executor: E, id: i64, seconds: u64) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
UPDATE oban_jobs
SET
    state = 'scheduled',
    scheduled_at = timezone('UTC', now()) + make_interval(secs => $2),
    attempt = GREATEST(attempt - 1, 0)
WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(seconds as f64)
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "snooze_job",
        error,
    })?;

    Ok(())
}

/// Record a failed attempt: schedule a retry after `backoff_seconds`, or
/// discard the job when its attempts are exhausted. The error is appended to
/// the job's history either way.
pub(crate) async fn error_job<'c, E>(
    executor: E,
    job: &Job,
    error: &str,
    backoff_seconds: u64,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let entry = ErrorEntry {
        at: Utc::now(),
        attempt: job.attempt,
        error: error.to_owned(),
    };

    sqlx::query(
        r#"
UPDATE oban_jobs
SET
    state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'retryable' END,
    discarded_at = CASE WHEN attempt >= max_attempts THEN timezone('UTC', now()) ELSE discarded_at END,
    scheduled_at = CASE
        WHEN attempt >= max_attempts THEN scheduled_at
        ELSE timezone('UTC', now()) + make_interval(secs => $2)
    END,
    errors = errors || $3
WHERE id = $1
        "#,
    )
    .bind(job.id)
    .bind(backoff_seconds as f64)
    .bind(Json(entry))
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "error_job",
        error,
    })?;

    Ok(())
}
