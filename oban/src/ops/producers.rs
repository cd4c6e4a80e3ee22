use serde_json::Value;
use sqlx::types::Json;

use crate::error::QueueError;

pub(crate) async fn insert_producer<'c, E>(
    executor: E,
    uuid: &str,
    name: &str,
    node: &str,
    queue: &str,
    meta: &Value,
) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query(
        r#"
INSERT INTO oban_producers (uuid, name, node, queue, meta, updated_at)
VALUES ($1, $2, $3, $4, $5, timezone('UTC', now()))
        "#,
    )
    .bind(uuid)
    .bind(name)
    .bind(node)
    .bind(queue)
    .bind(Json(meta))
    .execute(executor)
    .await
    .map_err(|error| QueueError::Query {
        command: "insert_producer",
        error,
    })?;

    Ok(())
}

pub(crate) async fn delete_producer<'c, E>(executor: E, uuid: &str) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("DELETE FROM oban_producers WHERE uuid = $1")
        .bind(uuid)
        .execute(executor)
        .await
        .map_err(|error| QueueError::Query {
            command: "delete_producer",
            error,
        })?;

    Ok(())
}

/// Refresh a producer's liveness timestamp. The lifeline treats producers
/// with stale heartbeats as dead.
pub(crate) async fn heartbeat_producer<'c, E>(executor: E, uuid: &str) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = sqlx::Postgres>,
{
    sqlx::query("UPDATE oban_producers SET updated_at = timezone('UTC', now()) WHERE uuid = $1")
        .bind(uuid)
        .execute(executor)
        .await
        .map_err(|error| QueueError::Query {
            command: "heartbeat_producer",
            error,
        })?;

    Ok(())
}
