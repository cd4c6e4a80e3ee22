use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::leader::Leadership;
use crate::store::Store;

/// Leader-only reaper for terminal jobs.
///
/// Deletes `completed`, `cancelled`, and `discarded` rows whose terminal
/// timestamp is older than `max_age`, capped per tick to keep transactions
/// short.
pub(crate) struct Pruner {
    pub(crate) store: Store,
    pub(crate) leadership: Arc<Leadership>,
    pub(crate) interval: Duration,
    pub(crate) max_age: Duration,
    pub(crate) limit: i64,
    pub(crate) shutdown: CancellationToken,
}

impl Pruner {
    pub(crate) async fn run(self) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut tick = tokio::time::interval_at(start, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => self.prune().await,
            }
        }
    }

    async fn prune(&self) {
        if !self.leadership.is_leader() {
            return;
        }

        match self
            .store
            .prune_jobs(self.max_age.as_secs_f64(), self.limit)
            .await
        {
            Ok(pruned) => {
                metrics::counter!("oban_pruner_deleted").increment(pruned);

                if pruned > 0 {
                    debug!(pruned, "pruned terminal jobs");
                }
            }
            Err(err) => error!(error = %err, "prune pass failed"),
        }
    }
}
