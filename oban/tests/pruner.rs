use sqlx::PgPool;

use oban::Store;

/// Insert a job in the given state with its terminal timestamp `ago` seconds
/// in the past.
async fn insert_aged_job(pool: &PgPool, state: &str, ago: i64) -> i64 {
    let timestamp_column = format!("{state}_at");

    let query = format!(
        r#"
INSERT INTO oban_jobs (state, worker, {timestamp_column})
VALUES ($1, 'test.Worker', timezone('UTC', now()) - make_interval(secs => $2))
RETURNING id
        "#
    );

    sqlx::query_scalar(&query)
        .bind(state)
        .bind(ago as f64)
        .fetch_one(pool)
        .await
        .expect("failed to insert aged job")
}

async fn insert_scheduled_job(pool: &PgPool) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO oban_jobs (state, worker) VALUES ('scheduled', 'test.Worker') RETURNING id",
    )
    .fetch_one(pool)
    .await
    .expect("failed to insert scheduled job")
}

async fn remaining_ids(pool: &PgPool) -> Vec<i64> {
    sqlx::query_scalar("SELECT id FROM oban_jobs ORDER BY id")
        .fetch_all(pool)
        .await
        .expect("failed to list jobs")
}

#[sqlx::test(migrations = "../migrations")]
async fn test_prune_deletes_only_expired_terminal_jobs(db: PgPool) {
    let store = Store::new(db.clone());

    insert_aged_job(&db, "completed", 61).await;
    insert_aged_job(&db, "cancelled", 61).await;
    insert_aged_job(&db, "cancelled", 61).await;
    insert_aged_job(&db, "discarded", 61).await;

    let keep_1 = insert_scheduled_job(&db).await;
    let keep_2 = insert_aged_job(&db, "completed", 59).await;
    let keep_3 = insert_aged_job(&db, "discarded", 59).await;

    let pruned = store.prune_jobs(60.0, 20_000).await.expect("prune failed");
    assert_eq!(pruned, 4);

    assert_eq!(remaining_ids(&db).await, vec![keep_1, keep_2, keep_3]);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_prune_never_touches_non_terminal_jobs(db: PgPool) {
    let store = Store::new(db.clone());

    let executing = sqlx::query_scalar::<_, i64>(
        r#"
INSERT INTO oban_jobs (state, worker, attempted_at)
VALUES ('executing', 'test.Worker', timezone('UTC', now()) - interval '1 hour')
RETURNING id
        "#,
    )
    .fetch_one(&db)
    .await
    .expect("failed to insert executing job");

    let pruned = store.prune_jobs(60.0, 20_000).await.expect("prune failed");
    assert_eq!(pruned, 0);

    assert_eq!(remaining_ids(&db).await, vec![executing]);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_prune_respects_the_batch_limit(db: PgPool) {
    let store = Store::new(db.clone());

    for _ in 0..5 {
        insert_aged_job(&db, "completed", 120).await;
    }

    let pruned = store.prune_jobs(60.0, 2).await.expect("prune failed");
    assert_eq!(pruned, 2);

    assert_eq!(remaining_ids(&db).await.len(), 3);

    let pruned = store.prune_jobs(60.0, 20_000).await.expect("prune failed");
    assert_eq!(pruned, 3);
}
