use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::QueueError;
use crate::job::{Job, NewJob};
use crate::ops;

/// Thin layer on top of the raw query operations, so the rest of the engine
/// holds a single cloneable handle instead of passing a pool around.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool against `url` and wrap it.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| QueueError::PoolCreation { error })?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn insert_jobs(&self, jobs: &[NewJob]) -> Result<Vec<Job>, QueueError> {
        ops::jobs::insert_jobs(&self.pool, jobs).await
    }

    pub async fn fetch_jobs(
        &self,
        queue: &str,
        demand: i64,
        node: &str,
        uuid: &str,
    ) -> Result<Vec<Job>, QueueError> {
        ops::jobs::fetch_jobs(&self.pool, queue, demand, node, uuid).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>, QueueError> {
        ops::jobs::get_job(&self.pool, id).await
    }

    pub async fn complete_job(&self, id: i64) -> Result<(), QueueError> {
        ops::jobs::complete_job(&self.pool, id).await
    }

    pub async fn cancel_job(&self, id: i64, attempt: i32, reason: &str) -> Result<(), QueueError> {
        ops::jobs::cancel_job(&self.pool, id, attempt, reason).await
    }

    pub async fn snooze_job(&self, id: i64, seconds: u64) -> Result<(), QueueError> {
        ops::jobs::snooze_job(&self.pool, id, seconds).await
    }

    pub async fn error_job(
        &self,
        job: &Job,
        error: &str,
        backoff_seconds: u64,
    ) -> Result<(), QueueError> {
        ops::jobs::error_job(&self.pool, job, error, backoff_seconds).await
    }

    pub async fn stage_jobs(&self, limit: i64) -> Result<Vec<String>, QueueError> {
        ops::staging::stage_jobs(&self.pool, limit).await
    }

    pub async fn check_available_queues(&self) -> Result<Vec<String>, QueueError> {
        ops::staging::check_available_queues(&self.pool).await
    }

    pub async fn rescue_jobs(&self, rescue_after_seconds: f64) -> Result<u64, QueueError> {
        ops::maintenance::rescue_jobs(&self.pool, rescue_after_seconds).await
    }

    pub async fn prune_jobs(&self, max_age_seconds: f64, limit: i64) -> Result<u64, QueueError> {
        ops::maintenance::prune_jobs(&self.pool, max_age_seconds, limit).await
    }

    pub async fn insert_producer(
        &self,
        uuid: &str,
        name: &str,
        node: &str,
        queue: &str,
        meta: &Value,
    ) -> Result<(), QueueError> {
        ops::producers::insert_producer(&self.pool, uuid, name, node, queue, meta).await
    }

    pub async fn delete_producer(&self, uuid: &str) -> Result<(), QueueError> {
        ops::producers::delete_producer(&self.pool, uuid).await
    }

    pub async fn heartbeat_producer(&self, uuid: &str) -> Result<(), QueueError> {
        ops::producers::heartbeat_producer(&self.pool, uuid).await
    }

    pub async fn acquire_leader(
        &self,
        name: &str,
        node: &str,
        uuid: &str,
        ttl_seconds: f64,
    ) -> Result<bool, QueueError> {
        ops::peers::acquire_leader(&self.pool, name, node, uuid, ttl_seconds).await
    }

    pub async fn extend_leader(
        &self,
        name: &str,
        uuid: &str,
        ttl_seconds: f64,
    ) -> Result<bool, QueueError> {
        ops::peers::extend_leader(&self.pool, name, uuid, ttl_seconds).await
    }

    pub async fn release_leader(&self, name: &str, uuid: &str) -> Result<(), QueueError> {
        ops::peers::release_leader(&self.pool, name, uuid).await
    }
}
