use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::json;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::cron::{CronEntry, Scheduler};
use crate::error::{ConfigError, QueueError};
use crate::job::{Job, NewJob};
use crate::leader::{Leader, Leadership};
use crate::lifeline::Lifeline;
use crate::producer::Producer;
use crate::pruner::Pruner;
use crate::stager::Stager;
use crate::store::Store;
use crate::worker::WorkerRegistry;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Construction parameters for an [`Oban`] instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name for this instance in the process-wide registry.
    pub name: String,
    /// Node identifier, defaulting to the host name.
    pub node: Option<String>,
    /// Queue names mapped to their local concurrency limits.
    pub queues: HashMap<String, usize>,
    /// How often scheduled jobs are staged.
    pub stage_interval: Duration,
    /// Maximum rows flipped per staging pass.
    pub stage_limit: i64,
    /// Whether this node takes part in leader election. Without leadership
    /// the lifeline, pruner, and cron scheduler stay dormant.
    pub leadership: bool,
    /// Leader lease duration; the lease is extended at a third of this.
    pub leader_ttl: Duration,
    /// How often the lifeline looks for orphaned jobs.
    pub rescue_interval: Duration,
    /// Producer heartbeat age past which its jobs are considered orphaned.
    pub rescue_after: Duration,
    /// How often the pruner deletes old terminal jobs.
    pub prune_interval: Duration,
    /// Terminal job age past which rows are deleted.
    pub prune_max_age: Duration,
    /// Maximum rows deleted per prune pass.
    pub prune_limit: i64,
    /// How long producers wait for in-flight jobs when stopping before
    /// aborting them.
    pub shutdown_grace: Duration,
    /// Workers to enqueue on a cron schedule, evaluated on the leader.
    pub cron: Vec<CronEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "oban".to_owned(),
            node: None,
            queues: HashMap::new(),
            stage_interval: Duration::from_secs(1),
            stage_limit: 20_000,
            leadership: true,
            leader_ttl: Duration::from_secs(30),
            rescue_interval: Duration::from_secs(60),
            rescue_after: Duration::from_secs(60),
            prune_interval: Duration::from_secs(60),
            prune_max_age: Duration::from_secs(86_400),
            prune_limit: 20_000,
            shutdown_grace: Duration::from_secs(15),
            cron: Vec::new(),
        }
    }
}

impl Config {
    fn validate(&self) -> Result<(), ConfigError> {
        for (queue, limit) in &self.queues {
            if *limit < 1 {
                return Err(ConfigError::QueueLimit {
                    queue: queue.clone(),
                });
            }
        }

        if self.stage_interval.is_zero() {
            return Err(ConfigError::StageInterval);
        }

        for (field, interval) in [
            ("leader_ttl", self.leader_ttl),
            ("rescue_interval", self.rescue_interval),
            ("rescue_after", self.rescue_after),
            ("prune_interval", self.prune_interval),
            ("prune_max_age", self.prune_max_age),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::NonPositive { field });
            }
        }

        if self.stage_limit < 1 {
            return Err(ConfigError::NonPositive {
                field: "stage_limit",
            });
        }

        if self.prune_limit < 1 {
            return Err(ConfigError::NonPositive {
                field: "prune_limit",
            });
        }

        Ok(())
    }
}

struct ProducerSlot {
    queue: String,
    limit: usize,
    uuid: Uuid,
    notify: Arc<Notify>,
}

struct TaskGroup {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl TaskGroup {
    async fn stop(self) {
        self.token.cancel();

        for handle in self.handles {
            handle.await.ok();
        }
    }
}

#[derive(Default)]
struct RunState {
    running: bool,
    stager: Option<TaskGroup>,
    producers: Option<TaskGroup>,
    maintenance: Option<TaskGroup>,
}

static INSTANCES: Lazy<std::sync::Mutex<HashMap<String, Arc<Oban>>>> =
    Lazy::new(|| std::sync::Mutex::new(HashMap::new()));

/// Look up a started or constructed instance by name.
pub fn get_instance(name: &str) -> Option<Arc<Oban>> {
    INSTANCES
        .lock()
        .expect("instance registry lock poisoned")
        .get(name)
        .cloned()
}

/// The single public surface of the engine.
///
/// Wires producers, the stager, leader election, and the leader-only
/// maintenance loops over one connection pool, and exposes job insertion.
pub struct Oban {
    config: Config,
    node: String,
    store: Store,
    workers: Arc<WorkerRegistry>,
    leadership: Arc<Leadership>,
    slots: Vec<ProducerSlot>,
    owns_pool: bool,
    state: Mutex<RunState>,
}

impl Oban {
    /// Build an instance on a freshly opened pool.
    pub async fn connect(
        config: Config,
        workers: WorkerRegistry,
        database_url: &str,
    ) -> Result<Arc<Self>, QueueError> {
        let store = Store::connect(database_url, DEFAULT_MAX_CONNECTIONS).await?;

        Self::build(config, workers, store, true)
    }

    /// Build an instance on an existing pool. The pool stays open when the
    /// instance stops.
    pub fn from_pool(
        config: Config,
        workers: WorkerRegistry,
        pool: PgPool,
    ) -> Result<Arc<Self>, QueueError> {
        Self::build(config, workers, Store::new(pool), false)
    }

    fn build(
        config: Config,
        workers: WorkerRegistry,
        store: Store,
        owns_pool: bool,
    ) -> Result<Arc<Self>, QueueError> {
        config.validate()?;

        let node = config.node.clone().unwrap_or_else(default_node);

        let slots = config
            .queues
            .iter()
            .map(|(queue, limit)| ProducerSlot {
                queue: queue.clone(),
                limit: *limit,
                uuid: Uuid::now_v7(),
                notify: Arc::new(Notify::new()),
            })
            .collect();

        let instance = Arc::new(Self {
            node,
            store,
            workers: Arc::new(workers),
            leadership: Arc::new(Leadership::default()),
            slots,
            owns_pool,
            state: Mutex::new(RunState::default()),
            config,
        });

        INSTANCES
            .lock()
            .expect("instance registry lock poisoned")
            .insert(instance.config.name.clone(), Arc::clone(&instance));

        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    pub fn pool(&self) -> &PgPool {
        self.store.pool()
    }

    /// Acquire a connection from the instance pool for user transactions.
    pub async fn get_connection(&self) -> Result<PoolConnection<Postgres>, QueueError> {
        self.store
            .pool()
            .acquire()
            .await
            .map_err(|error| QueueError::Query {
                command: "acquire_connection",
                error,
            })
    }

    /// Insert a single job, returning the stored row.
    pub async fn enqueue(&self, job: NewJob) -> Result<Job, QueueError> {
        let mut jobs = self.store.insert_jobs(&[job]).await?;

        Ok(jobs.pop().expect("insert of one job returned no rows"))
    }

    /// Insert many jobs in a single statement.
    pub async fn enqueue_many(&self, jobs: Vec<NewJob>) -> Result<Vec<Job>, QueueError> {
        self.store.insert_jobs(&jobs).await
    }

    pub async fn get_job(&self, id: i64) -> Result<Option<Job>, QueueError> {
        self.store.get_job(id).await
    }

    /// Start the producers, stager, and maintenance loops. Idempotent while
    /// already running.
    pub async fn start(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;

        if state.running {
            return Ok(());
        }

        let producer_token = CancellationToken::new();
        let mut producer_handles = Vec::with_capacity(self.slots.len());

        for slot in &self.slots {
            self.store
                .insert_producer(
                    &slot.uuid.to_string(),
                    &self.config.name,
                    &self.node,
                    &slot.queue,
                    &json!({"local_limit": slot.limit}),
                )
                .await?;

            let producer = Producer {
                queue: slot.queue.clone(),
                limit: slot.limit,
                node: self.node.clone(),
                uuid: slot.uuid,
                store: self.store.clone(),
                registry: Arc::clone(&self.workers),
                notify: Arc::clone(&slot.notify),
                shutdown: producer_token.child_token(),
                grace: self.config.shutdown_grace,
            };

            producer_handles.push(tokio::spawn(producer.run()));
        }

        state.producers = Some(TaskGroup {
            token: producer_token,
            handles: producer_handles,
        });

        let stager_token = CancellationToken::new();
        let stager = Stager {
            store: self.store.clone(),
            notifiers: self
                .slots
                .iter()
                .map(|slot| (slot.queue.clone(), Arc::clone(&slot.notify)))
                .collect(),
            interval: self.config.stage_interval,
            limit: self.config.stage_limit,
            shutdown: stager_token.child_token(),
        };

        state.stager = Some(TaskGroup {
            token: stager_token,
            handles: vec![tokio::spawn(stager.run())],
        });

        let maintenance_token = CancellationToken::new();
        let mut maintenance_handles = Vec::new();

        if self.config.leadership {
            let leader = Leader {
                name: self.config.name.clone(),
                node: self.node.clone(),
                uuid: Uuid::now_v7(),
                ttl: self.config.leader_ttl,
                store: self.store.clone(),
                leadership: Arc::clone(&self.leadership),
                shutdown: maintenance_token.child_token(),
            };

            maintenance_handles.push(tokio::spawn(leader.run()));
        }

        let lifeline = Lifeline {
            store: self.store.clone(),
            leadership: Arc::clone(&self.leadership),
            interval: self.config.rescue_interval,
            rescue_after: self.config.rescue_after,
            shutdown: maintenance_token.child_token(),
        };
        maintenance_handles.push(tokio::spawn(lifeline.run()));

        let pruner = Pruner {
            store: self.store.clone(),
            leadership: Arc::clone(&self.leadership),
            interval: self.config.prune_interval,
            max_age: self.config.prune_max_age,
            limit: self.config.prune_limit,
            shutdown: maintenance_token.child_token(),
        };
        maintenance_handles.push(tokio::spawn(pruner.run()));

        if !self.config.cron.is_empty() {
            let scheduler = Scheduler {
                entries: self.config.cron.clone(),
                store: self.store.clone(),
                leadership: Arc::clone(&self.leadership),
                shutdown: maintenance_token.child_token(),
            };

            maintenance_handles.push(tokio::spawn(scheduler.run()));
        }

        state.maintenance = Some(TaskGroup {
            token: maintenance_token,
            handles: maintenance_handles,
        });

        state.running = true;
        info!(name = %self.config.name, node = %self.node, "instance started");

        Ok(())
    }

    /// Stop everything: the stager first so no new work is staged, then the
    /// producers (waiting on in-flight jobs), then the maintenance loops.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        if !state.running {
            return;
        }

        if let Some(group) = state.stager.take() {
            group.stop().await;
        }

        if let Some(group) = state.producers.take() {
            group.stop().await;
        }

        if let Some(group) = state.maintenance.take() {
            group.stop().await;
        }

        if self.owns_pool {
            self.store.pool().close().await;
        }

        state.running = false;
        info!(name = %self.config.name, "instance stopped");
    }
}

fn default_node() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|hostname| !hostname.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_limits_must_be_positive() {
        let config = Config {
            queues: HashMap::from([("default".to_owned(), 0)]),
            ..Config::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::QueueLimit { queue }) if queue == "default"
        ));
    }

    #[test]
    fn test_stage_interval_must_be_positive() {
        let config = Config {
            stage_interval: Duration::ZERO,
            ..Config::default()
        };

        assert!(matches!(config.validate(), Err(ConfigError::StageInterval)));
    }

    #[test]
    fn test_maintenance_intervals_must_be_positive() {
        let config = Config {
            prune_max_age: Duration::ZERO,
            ..Config::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositive { field: "prune_max_age" })
        ));

        let config = Config {
            prune_limit: 0,
            ..Config::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositive { field: "prune_limit" })
        ));
    }

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }
}
