use crate::error::QueueError;

/// Try to claim leadership for an instance name.
///
/// The conditional upsert grants the claim when there is no prior lease, the
/// prior lease has expired, or the claimant already holds it (in which case
/// this doubles as an extension). Returns whether the claim succeeded.
pub(crate) async fn acquire_leader<'c, E>(
    executor: E,
    name: &str,
    node: &str,
    uuid: &str,
    ttl_seconds: f64,
) -> Result<bool, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let claimed: Option<String> = sqlx::query_scalar(
        r#"
INSERT INTO oban_peers (name, node, uuid, expires_at)
VALUES ($1, $2, $3, timezone('UTC', now()) + make_interval(secs => $4))
ON CONFLICT (name) DO UPDATE
SET node = EXCLUDED.node, uuid = EXCLUDED.uuid, expires_at = EXCLUDED.expires_at
WHERE oban_peers.expires_at <= timezone('UTC', now()) OR oban_peers.uuid = EXCLUDED.uuid
RETURNING uuid
        "#,
    )
    .bind(name)
    .bind(node)
    .bind(uuid)
    .bind(ttl_seconds)
    .fetch_optional(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "acquire_leader",
        error,
    })?;

    Ok(claimed.is_some())
}

/// Bump the lease while it is still held. Returns false when the lease has
/// been taken over, signalling the caller to demote itself.
pub(crate) async fn extend_leader<'c, E>(
    executor: E,
    name: &str,
    uuid: &str,
    ttl_seconds: f64,
) -> Result<bool, QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    let result = sqlx::query(
        r#"
UPDATE oban_peers
SET expires_at = timezone('UTC', now()) + make_interval(secs => $3)
WHERE name = $1 AND uuid = $2
        "#,
    )
    .bind(name)
    .bind(uuid)
    .bind(ttl_seconds)
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "extend_leader",
        error,
    })?;

    Ok(result.rows_affected() > 0)
}

/// Drop the lease on graceful shutdown, only if still owned.
pub(crate) async fn release_leader<'c, E>(
    executor: E,
    name: &str,
    uuid: &str,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("DELETE FROM oban_peers WHERE name = $1 AND uuid = $2")
        .bind(name)
        .bind(uuid)
        .execute(executor)
        .await
        .map_err(|error| QueueError::Query {
            command: "release_leader",
            error,
        })?;

    Ok(())
}
