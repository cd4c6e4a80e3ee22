use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::leader::Leadership;
use crate::store::Store;
use crate::telemetry;

/// Leader-only rescue loop.
///
/// Jobs stuck in `executing` whose producer stopped heartbeating are reset
/// to `available` with their attempt count intact, giving at-least-once
/// delivery despite crashed workers.
pub(crate) struct Lifeline {
    pub(crate) store: Store,
    pub(crate) leadership: Arc<Leadership>,
    pub(crate) interval: Duration,
    pub(crate) rescue_after: Duration,
    pub(crate) shutdown: CancellationToken,
}

impl Lifeline {
    pub(crate) async fn run(self) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut tick = tokio::time::interval_at(start, self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => self.rescue().await,
            }
        }
    }

    async fn rescue(&self) {
        if !self.leadership.is_leader() {
            return;
        }

        let mut span = telemetry::span("oban.lifeline.rescue", json!({}));

        match self
            .store
            .rescue_jobs(self.rescue_after.as_secs_f64())
            .await
        {
            Ok(rescued) => {
                metrics::counter!("oban_lifeline_rescued").increment(rescued);

                if rescued > 0 {
                    warn!(rescued, "rescued orphaned jobs");
                }

                span.add(json!({"rescued_count": rescued}));
                span.finish();
            }
            Err(err) => {
                error!(error = %err, "rescue pass failed");
                span.fail(&err.to_string());
            }
        }
    }
}
