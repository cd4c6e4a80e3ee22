use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::store::Store;

/// Shared view of this node's leadership status. Handed to the lifeline,
/// pruner, and cron scheduler instead of the election loop itself.
#[derive(Default)]
pub struct Leadership {
    leader: AtomicBool,
}

impl Leadership {
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, leader: bool) {
        self.leader.store(leader, Ordering::Release);
    }
}

/// Peer-election loop. At most one node holds the lease for an instance name
/// at a time, modulo clock skew bounded by the ttl; the leases are extended
/// at a third of the ttl so a healthy leader never lapses.
pub(crate) struct Leader {
    pub(crate) name: String,
    pub(crate) node: String,
    pub(crate) uuid: Uuid,
    pub(crate) ttl: Duration,
    pub(crate) store: Store,
    pub(crate) leadership: Arc<Leadership>,
    pub(crate) shutdown: CancellationToken,
}

impl Leader {
    pub(crate) async fn run(self) {
        let mut tick = tokio::time::interval(self.ttl / 3);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => self.election().await,
            }
        }

        if self.leadership.is_leader() {
            if let Err(err) = self
                .store
                .release_leader(&self.name, &self.uuid.to_string())
                .await
            {
                warn!(name = %self.name, error = %err, "failed to release leadership");
            }

            self.leadership.set(false);
        }
    }

    async fn election(&self) {
        let uuid = self.uuid.to_string();
        let ttl = self.ttl.as_secs_f64();

        if self.leadership.is_leader() {
            match self.store.extend_leader(&self.name, &uuid, ttl).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(name = %self.name, node = %self.node, "leadership lost");
                    self.leadership.set(false);
                }
                // The lease outlives one missed extension, keep the flag.
                Err(err) => warn!(name = %self.name, error = %err, "leader extend failed"),
            }
        } else {
            match self
                .store
                .acquire_leader(&self.name, &self.node, &uuid, ttl)
                .await
            {
                Ok(true) => {
                    info!(name = %self.name, node = %self.node, "leadership acquired");
                    self.leadership.set(true);
                }
                Ok(false) => {}
                Err(err) => warn!(name = %self.name, error = %err, "leader acquire failed"),
            }
        }
    }
}
