//! Periodic snapshot publication.
//!
//! Every tick writes the full graph to the snapshot slot, changed or not, and
//! publishes the services and edges facets on the delta topic so running
//! replicas follow topology changes. A TTL several times the interval lets
//! one missed tick pass without the snapshot expiring.

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{channel::SharedChannel, error::MeshResult, graph::GraphStore};

pub struct SnapshotPublisher {
    store: GraphStore,
    channel: SharedChannel,
    interval: Duration,
    ttl: Duration,
}

impl SnapshotPublisher {
    pub fn new(store: GraphStore, channel: SharedChannel, interval: Duration, ttl: Duration) -> Self {
        if ttl <= interval {
            warn!(?interval, ?ttl, "Snapshot TTL does not exceed the publish interval");
        }
        Self {
            store,
            channel,
            interval,
            ttl,
        }
    }

    /// Serialize the current graph and write it to the snapshot slot.
    /// Returns the number of bytes written.
    pub async fn publish_once(&self) -> MeshResult<usize> {
        let bytes = self.store.to_json()?;
        self.channel.set_snapshot(&bytes, self.ttl).await?;
        Ok(bytes.len())
    }

    /// Publish services and edges as a delta. Policies are not included;
    /// they travel with `ApplyPolicy`.
    pub async fn publish_topology(&self) -> MeshResult<usize> {
        let bytes = serde_json::to_vec(&self.store.topology_delta())?;
        self.channel.publish_delta(&bytes).await?;
        Ok(bytes.len())
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, ttl = ?self.ttl, "Starting snapshot publisher");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.publish_once().await {
                        Ok(bytes) => {
                            let (services, edges, policies) = self.store.counts();
                            debug!(bytes, services, edges, policies, "Published mesh snapshot");
                        }
                        Err(e) => warn!(error = %e, "Snapshot publish failed; retrying next tick"),
                    }
                    match self.publish_topology().await {
                        Ok(bytes) => debug!(bytes, "Published topology delta"),
                        Err(e) => warn!(error = %e, "Topology delta publish failed; retrying next tick"),
                    }
                }
            }
        }

        info!("Snapshot publisher stopped");
    }
}
