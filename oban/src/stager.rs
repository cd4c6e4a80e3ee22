use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::QueueError;
use crate::store::Store;

/// Promotes matured `scheduled` and `retryable` rows to `available` on a
/// fixed interval, then wakes the local producers whose queues have work.
///
/// Staging runs on every node concurrently; the flip is idempotent, so
/// double-staging is a no-op.
pub(crate) struct Stager {
    pub(crate) store: Store,
    pub(crate) notifiers: HashMap<String, Arc<Notify>>,
    pub(crate) interval: Duration,
    pub(crate) limit: i64,
    pub(crate) shutdown: CancellationToken,
}

impl Stager {
    pub(crate) async fn run(self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = self.stage().await {
                        error!(error = %err, "staging pass failed");
                    }
                }
            }
        }
    }

    async fn stage(&self) -> Result<(), QueueError> {
        let staged = self.store.stage_jobs(self.limit).await?;

        let mut queues: BTreeSet<String> = staged.into_iter().collect();
        queues.extend(self.store.check_available_queues().await?);

        for queue in &queues {
            if let Some(notify) = self.notifiers.get(queue) {
                debug!(queue = %queue, "waking producer");
                notify.notify_one();
            }
        }

        Ok(())
    }
}
