use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use sqlx::PgPool;

use oban::{
    telemetry, ExecutionMode, Executor, Job, JobState, NewJob, Outcome, Store, Worker,
    WorkerRegistry,
};

struct ActWorker;

#[async_trait]
impl Worker for ActWorker {
    async fn process(&self, job: &Job) -> anyhow::Result<Outcome> {
        match job.args["act"].as_str() {
            Some("er") => Err(anyhow::anyhow!("this failed")),
            Some("ca") => Ok(Outcome::Cancel("no reason".to_owned())),
            Some("sn") => Ok(Outcome::Snooze(5)),
            _ => Ok(Outcome::Complete),
        }
    }
}

struct FixedBackoffWorker;

#[async_trait]
impl Worker for FixedBackoffWorker {
    async fn process(&self, _job: &Job) -> anyhow::Result<Outcome> {
        Err(anyhow::anyhow!("this failed"))
    }

    fn backoff(&self, _job: &Job) -> Option<u64> {
        Some(3600)
    }
}

fn test_registry() -> Arc<WorkerRegistry> {
    let mut registry = WorkerRegistry::new();
    registry.register("test.ActWorker", || ActWorker);
    registry.register("test.FixedBackoffWorker", || FixedBackoffWorker);

    Arc::new(registry)
}

async fn fetch_one(store: &Store, job: NewJob) -> Job {
    store.insert_jobs(&[job]).await.expect("failed to insert job");

    store
        .fetch_jobs("default", 1, "node-1", "producer-1")
        .await
        .expect("failed to fetch job")
        .remove(0)
}

#[sqlx::test(migrations = "../migrations")]
async fn test_completed_outcomes_are_recorded(db: PgPool) {
    let store = Store::new(db);
    let job = fetch_one(&store, NewJob::new("test.ActWorker", json!({"act": "ok"}))).await;
    let id = job.id;

    let execution = Executor::new(job, store.clone(), test_registry(), ExecutionMode::Record)
        .execute()
        .await
        .expect("execution failed");

    assert_eq!(execution.state, JobState::Completed);
    assert!(execution.error.is_none());

    let stored = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Completed);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_handler_errors_are_swallowed_in_record_mode(db: PgPool) {
    let store = Store::new(db);
    let job = fetch_one(&store, NewJob::new("test.ActWorker", json!({"act": "er"}))).await;
    let id = job.id;

    let execution = Executor::new(job, store.clone(), test_registry(), ExecutionMode::Record)
        .execute()
        .await
        .expect("execution failed");

    assert_eq!(execution.state, JobState::Retryable);
    assert!(execution.error.is_none());

    let stored = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Retryable);
    assert_eq!(stored.errors.len(), 1);
    assert!(stored.errors[0].error.contains("this failed"));
}

#[sqlx::test(migrations = "../migrations")]
async fn test_handler_errors_surface_in_propagate_mode(db: PgPool) {
    let store = Store::new(db);
    let job = fetch_one(&store, NewJob::new("test.ActWorker", json!({"act": "er"}))).await;
    let id = job.id;

    let execution = Executor::new(job, store.clone(), test_registry(), ExecutionMode::Propagate)
        .execute()
        .await
        .expect("execution failed");

    assert_eq!(execution.state, JobState::Retryable);

    let error = execution.error.expect("the handler error should surface");
    assert!(error.to_string().contains("this failed"));

    // The transition is still recorded before the error surfaces.
    let stored = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Retryable);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_cancel_and_snooze_sentinels(db: PgPool) {
    let store = Store::new(db);

    let job = fetch_one(&store, NewJob::new("test.ActWorker", json!({"act": "ca"}))).await;
    let id = job.id;

    let execution = Executor::new(job, store.clone(), test_registry(), ExecutionMode::Record)
        .execute()
        .await
        .expect("execution failed");

    assert_eq!(execution.state, JobState::Cancelled);

    let stored = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.errors[0].error, "no reason");

    let job = fetch_one(&store, NewJob::new("test.ActWorker", json!({"act": "sn"}))).await;
    let id = job.id;

    let execution = Executor::new(job, store.clone(), test_registry(), ExecutionMode::Record)
        .execute()
        .await
        .expect("execution failed");

    assert_eq!(execution.state, JobState::Scheduled);

    let stored = store.get_job(id).await.unwrap().unwrap();
    assert_eq!(stored.attempt, 0);
}

#[sqlx::test(migrations = "../migrations")]
async fn test_worker_backoff_overrides_the_default(db: PgPool) {
    let store = Store::new(db);
    let job = fetch_one(&store, NewJob::new("test.FixedBackoffWorker", json!({}))).await;
    let id = job.id;

    let before = chrono::Utc::now();

    Executor::new(job, store.clone(), test_registry(), ExecutionMode::Record)
        .execute()
        .await
        .expect("execution failed");

    let stored = store.get_job(id).await.unwrap().unwrap();

    // An hour of backoff puts the retry well past the default curve.
    assert_eq!(stored.state, JobState::Retryable);
    assert!(stored.scheduled_at > before + chrono::Duration::seconds(3000));
}

#[sqlx::test(migrations = "../migrations")]
async fn test_job_lifecycle_telemetry(db: PgPool) {
    let calls: Arc<Mutex<Vec<(String, serde_json::Value)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&calls);

    telemetry::attach(
        "executor-telemetry",
        &["oban.job.start", "oban.job.stop", "oban.job.exception"],
        move |name, meta| {
            sink.lock().unwrap().push((name.to_owned(), meta.clone()));
        },
    );

    let store = Store::new(db);

    let job = fetch_one(&store, NewJob::new("test.ActWorker", json!({"act": "ok"}))).await;
    let ok_id = job.id;
    Executor::new(job, store.clone(), test_registry(), ExecutionMode::Record)
        .execute()
        .await
        .expect("execution failed");

    let job = fetch_one(&store, NewJob::new("test.ActWorker", json!({"act": "er"}))).await;
    let er_id = job.id;
    Executor::new(job, store.clone(), test_registry(), ExecutionMode::Record)
        .execute()
        .await
        .expect("execution failed");

    // The bus is process-wide, so only look at events for our own jobs.
    let calls: Vec<(String, serde_json::Value)> = calls
        .lock()
        .unwrap()
        .iter()
        .filter(|(_, meta)| meta["job"]["id"] == ok_id || meta["job"]["id"] == er_id)
        .cloned()
        .collect();

    let names: Vec<&str> = calls.iter().map(|(name, _)| name.as_str()).collect();

    assert_eq!(
        names,
        vec![
            "oban.job.start",
            "oban.job.stop",
            "oban.job.start",
            "oban.job.exception"
        ]
    );

    let (_, stop_meta) = &calls[1];
    assert_eq!(stop_meta["state"], "completed");
    assert!(stop_meta["duration"].as_u64().is_some());
    assert!(stop_meta["queue_time"].as_i64().is_some());
    assert!(stop_meta["job"]["id"].as_i64().is_some());

    let (_, exception_meta) = &calls[3];
    assert_eq!(exception_meta["state"], "retryable");
    assert!(exception_meta["error_message"]
        .as_str()
        .unwrap()
        .contains("this failed"));
    assert!(exception_meta.get("traceback").is_some());

    telemetry::detach("executor-telemetry");
}
