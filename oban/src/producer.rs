use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::executor::{ExecutionMode, Executor};
use crate::store::Store;
use crate::telemetry;
use crate::worker::WorkerRegistry;

/// Producers wake on notification, but also on this ceiling so a missed
/// signal delays a fetch instead of losing it.
pub(crate) const POLL_CEILING: Duration = Duration::from_secs(1);

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Per-queue fetch-and-dispatch loop.
///
/// The loop owns its set of in-flight executor tasks; finished executors
/// re-signal `notify` so freed capacity triggers another fetch without
/// waiting for the next stage tick.
pub(crate) struct Producer {
    pub(crate) queue: String,
    pub(crate) limit: usize,
    pub(crate) node: String,
    pub(crate) uuid: Uuid,
    pub(crate) store: Store,
    pub(crate) registry: Arc<WorkerRegistry>,
    pub(crate) notify: Arc<Notify>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) grace: Duration,
}

impl Producer {
    pub(crate) async fn run(self) {
        let uuid = self.uuid.to_string();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let running = Arc::new(AtomicUsize::new(0));

        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = heartbeat.tick() => {
                    if let Err(err) = self.store.heartbeat_producer(&uuid).await {
                        warn!(queue = %self.queue, error = %err, "producer heartbeat failed");
                    }
                }
                // Reaping completed handles as they finish keeps the set small.
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                _ = tokio::time::timeout(POLL_CEILING, self.notify.notified()) => {
                    self.fetch_and_dispatch(&uuid, &mut tasks, &running).await;
                }
            }
        }

        self.drain(tasks).await;

        if let Err(err) = self.store.delete_producer(&uuid).await {
            warn!(queue = %self.queue, error = %err, "failed to delete producer record");
        }
    }

    async fn fetch_and_dispatch(
        &self,
        uuid: &str,
        tasks: &mut JoinSet<()>,
        running: &Arc<AtomicUsize>,
    ) {
        let demand = self.limit.saturating_sub(running.load(Ordering::Acquire));

        if demand == 0 {
            return;
        }

        let fetched = self
            .store
            .fetch_jobs(&self.queue, demand as i64, &self.node, uuid)
            .await;

        let jobs = match fetched {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(queue = %self.queue, error = %err, "job fetch failed");
                return;
            }
        };

        telemetry::execute(
            "oban.producer.get.stop",
            json!({"queue": self.queue, "count": jobs.len()}),
        );

        let gauge_labels = [("queue", self.queue.clone())];
        metrics::gauge!("oban_producer_saturation", &gauge_labels)
            .set(running.load(Ordering::Acquire) as f64 / self.limit as f64);

        for job in jobs {
            let executor = Executor::new(
                job,
                self.store.clone(),
                Arc::clone(&self.registry),
                ExecutionMode::Record,
            );
            let notify = Arc::clone(&self.notify);
            let running = Arc::clone(running);

            running.fetch_add(1, Ordering::AcqRel);

            tasks.spawn(async move {
                match executor.execute().await {
                    Ok(execution) => {
                        debug!(
                            job_id = execution.job_id,
                            state = execution.state.as_str(),
                            "job finished"
                        );
                    }
                    Err(err) => error!(error = %err, "failed to record job outcome"),
                }

                running.fetch_sub(1, Ordering::AcqRel);
                notify.notify_one();
            });
        }
    }

    /// Give in-flight executors a grace period, then abort the stragglers.
    /// Aborted jobs stay `executing` and are rescued by the lifeline.
    async fn drain(&self, mut tasks: JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(self.grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                queue = %self.queue,
                remaining = tasks.len(),
                "grace period elapsed, aborting in-flight jobs"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}
