//! Snapshot hydration and delta application for a graph replica.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{DeltaHandler, SharedChannel, DELTA_TOPIC, SNAPSHOT_KEY},
    error::MeshResult,
    graph::{Facets, GraphStore, MeshGraph, MeshGraphDelta},
};

/// Result of the start-up snapshot read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydrationOutcome {
    /// Accepted facets replaced with those of the decoded snapshot.
    Loaded,
    /// Nothing published yet, or the last snapshot expired.
    Absent,
    /// Snapshot present but undecodable; store left untouched.
    Malformed,
    /// Channel read failed; store left untouched.
    Unavailable,
}

pub struct Hydrator {
    store: GraphStore,
    channel: SharedChannel,
    facets: Facets,
}

impl Hydrator {
    /// `facets` selects which parts of incoming deltas this replica accepts.
    pub fn new(store: GraphStore, channel: SharedChannel, facets: Facets) -> Self {
        Self {
            store,
            channel,
            facets,
        }
    }

    pub fn facets(&self) -> Facets {
        self.facets
    }

    /// One snapshot read. The accepted facets of the snapshot replace the
    /// local ones; every outcome other than `Loaded` leaves the store
    /// untouched and is logged.
    pub async fn hydrate(&self) -> HydrationOutcome {
        let bytes = match self.channel.get_snapshot().await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                info!(key = SNAPSHOT_KEY, "No snapshot found; starting from an empty graph");
                return HydrationOutcome::Absent;
            }
            Err(e) => {
                warn!(key = SNAPSHOT_KEY, error = %e, "Snapshot read failed; starting from an empty graph");
                return HydrationOutcome::Unavailable;
            }
        };

        match MeshGraph::from_json(&bytes) {
            Ok(graph) => {
                self.store
                    .apply_delta(MeshGraphDelta::from(graph).restrict(self.facets));
                let (services, edges, policies) = self.store.counts();
                info!(services, edges, policies, "Hydrated graph from snapshot");
                HydrationOutcome::Loaded
            }
            Err(e) => {
                warn!(key = SNAPSHOT_KEY, error = %e, bytes = bytes.len(), "Malformed snapshot; starting from an empty graph");
                HydrationOutcome::Malformed
            }
        }
    }

    /// Decode one delta message and apply the accepted facets.
    pub fn apply_message(&self, payload: &[u8]) -> MeshResult<Facets> {
        let delta = MeshGraphDelta::from_json(payload)?;
        let received = delta.facets();
        let applied = self.store.apply_delta(delta.restrict(self.facets));
        if applied != received {
            debug!(%received, %applied, "Ignored delta facets outside this replica's scope");
        }
        Ok(applied)
    }

    fn handler(self: &Arc<Self>) -> DeltaHandler {
        let hydrator = Arc::clone(self);
        Arc::new(move |payload: &[u8]| {
            if let Err(e) = hydrator.apply_message(payload) {
                warn!(topic = DELTA_TOPIC, error = %e, bytes = payload.len(), "Dropping undecodable delta");
            }
        })
    }

    /// Apply deltas until cancelled. A dropped subscription is re-established
    /// after `resubscribe_delay`.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken, resubscribe_delay: Duration) {
        info!(topic = DELTA_TOPIC, facets = %self.facets, "Starting delta subscriber");

        while !cancel.is_cancelled() {
            match self
                .channel
                .subscribe_delta(self.handler(), cancel.clone())
                .await
            {
                Ok(()) if cancel.is_cancelled() => break,
                Ok(()) => warn!(topic = DELTA_TOPIC, "Delta subscription ended; resubscribing"),
                Err(e) => warn!(topic = DELTA_TOPIC, error = %e, "Delta subscription failed; resubscribing"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(resubscribe_delay) => {}
            }
        }

        info!(topic = DELTA_TOPIC, "Delta subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        channel::{testing::DownChannel, InMemoryChannel, MeshChannel},
        error::MeshError,
        graph::{AuthPolicy, Edge, PolicyKey, Service},
    };

    fn policy(ns: &str, name: &str) -> AuthPolicy {
        let key = PolicyKey::new(ns, name).unwrap();
        AuthPolicy::new(&key, serde_json::Map::new())
    }

    fn seeded_store() -> GraphStore {
        let store = GraphStore::new();
        store.upsert_service(Service {
            name: "service-a".to_string(),
            namespace: "ns".to_string(),
            meshed: true,
        });
        store.replace_edges(vec![Edge {
            dst: "ns/service-a".to_string(),
            rps: 1.0,
            ..Default::default()
        }]);
        store.upsert_policy(&PolicyKey::new("ns", "old").unwrap(), policy("ns", "old"));
        store
    }

    #[tokio::test]
    async fn test_hydrate_absent_leaves_empty_graph() {
        let store = GraphStore::new();
        let hydrator = Hydrator::new(store.clone(), Arc::new(InMemoryChannel::new()), Facets::ALL);
        assert_eq!(hydrator.hydrate().await, HydrationOutcome::Absent);
        assert_eq!(store.snapshot(), MeshGraph::default());
    }

    #[tokio::test]
    async fn test_hydrate_loads_snapshot() {
        let source = seeded_store();
        let channel = Arc::new(InMemoryChannel::new());
        channel
            .set_snapshot(&source.to_json().unwrap(), Duration::from_secs(600))
            .await
            .unwrap();

        let replica = GraphStore::new();
        let hydrator = Hydrator::new(replica.clone(), channel, Facets::ALL);
        assert_eq!(hydrator.hydrate().await, HydrationOutcome::Loaded);
        assert_eq!(replica.snapshot(), source.snapshot());
    }

    #[tokio::test]
    async fn test_policy_only_hydrate_keeps_local_topology() {
        let source = seeded_store();
        let channel = Arc::new(InMemoryChannel::new());
        channel
            .set_snapshot(&source.to_json().unwrap(), Duration::from_secs(600))
            .await
            .unwrap();

        let replica = GraphStore::new();
        replica.upsert_service(Service {
            name: "local".to_string(),
            ..Default::default()
        });
        let hydrator = Hydrator::new(replica.clone(), channel, Facets::AUTH_POLICIES);
        assert_eq!(hydrator.hydrate().await, HydrationOutcome::Loaded);

        let graph = replica.snapshot();
        assert!(graph.services.contains_key("local"));
        assert!(!graph.services.contains_key("service-a"));
        assert!(graph.edges.is_empty());
        assert_eq!(graph.auth_policies, source.snapshot().auth_policies);
    }

    #[tokio::test]
    async fn test_hydrate_malformed_snapshot() {
        let channel = Arc::new(InMemoryChannel::new());
        channel
            .set_snapshot(b"{not json", Duration::from_secs(600))
            .await
            .unwrap();
        let store = GraphStore::new();
        let hydrator = Hydrator::new(store.clone(), channel, Facets::ALL);
        assert_eq!(hydrator.hydrate().await, HydrationOutcome::Malformed);
        assert_eq!(store.snapshot(), MeshGraph::default());
    }

    #[tokio::test]
    async fn test_hydrate_unavailable_channel() {
        let store = GraphStore::new();
        let hydrator = Hydrator::new(store.clone(), Arc::new(DownChannel), Facets::ALL);
        assert_eq!(hydrator.hydrate().await, HydrationOutcome::Unavailable);
    }

    #[test]
    fn test_auth_only_delta_replaces_policies_wholesale() {
        let store = seeded_store();
        let before = store.snapshot();
        let hydrator = Hydrator::new(store.clone(), Arc::new(InMemoryChannel::new()), Facets::ALL);

        let msg = json!({
            "authPolicies": {
                "ns1/pol1": {"name": "pol1", "namespace": "ns1", "spec": {"rules": []}}
            }
        });
        let applied = hydrator
            .apply_message(&serde_json::to_vec(&msg).unwrap())
            .unwrap();

        assert_eq!(applied, Facets::AUTH_POLICIES);
        let after = store.snapshot();
        assert_eq!(
            after.auth_policies.keys().collect::<Vec<_>>(),
            vec!["ns1/pol1"]
        );
        assert_eq!(after.services, before.services);
        assert_eq!(after.edges, before.edges);
    }

    #[test]
    fn test_full_graph_delta_replaces_every_facet() {
        let store = seeded_store();
        let hydrator = Hydrator::new(store.clone(), Arc::new(InMemoryChannel::new()), Facets::ALL);

        let incoming = MeshGraph {
            services: BTreeMap::new(),
            edges: Vec::new(),
            auth_policies: BTreeMap::from([("ns/new".to_string(), policy("ns", "new"))]),
        };
        let applied = hydrator
            .apply_message(&incoming.to_json().unwrap())
            .unwrap();

        assert_eq!(applied, Facets::ALL);
        assert_eq!(store.snapshot(), incoming);
    }

    #[test]
    fn test_malformed_delta_is_dropped() {
        let store = seeded_store();
        let before = store.snapshot();
        let hydrator = Hydrator::new(store.clone(), Arc::new(InMemoryChannel::new()), Facets::ALL);

        assert!(hydrator.apply_message(b"not-json").is_err());
        assert!(hydrator
            .apply_message(br#"{"authPolicies": "wrong shape"}"#)
            .is_err());
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_policy_only_replica_ignores_other_facets() {
        let store = seeded_store();
        let before = store.snapshot();
        let hydrator = Hydrator::new(
            store.clone(),
            Arc::new(InMemoryChannel::new()),
            Facets::AUTH_POLICIES,
        );

        let incoming = MeshGraph {
            services: BTreeMap::new(),
            edges: Vec::new(),
            auth_policies: BTreeMap::from([("ns/new".to_string(), policy("ns", "new"))]),
        };
        let applied = hydrator
            .apply_message(&incoming.to_json().unwrap())
            .unwrap();

        assert_eq!(applied, Facets::AUTH_POLICIES);
        let after = store.snapshot();
        assert_eq!(after.services, before.services);
        assert_eq!(after.edges, before.edges);
        assert_eq!(after.auth_policies, incoming.auth_policies);
    }

    #[tokio::test]
    async fn test_run_applies_published_deltas_until_cancelled() {
        let channel = Arc::new(InMemoryChannel::new());
        let store = GraphStore::new();
        let hydrator = Arc::new(Hydrator::new(store.clone(), channel.clone(), Facets::ALL));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(
            hydrator
                .clone()
                .run(cancel.clone(), Duration::from_millis(10)),
        );
        while channel.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        channel.publish_delta(b"garbage").await.unwrap();
        let delta = MeshGraphDelta {
            auth_policies: Some(BTreeMap::from([(
                "ns/p".to_string(),
                policy("ns", "p"),
            )])),
            ..Default::default()
        };
        channel
            .publish_delta(&serde_json::to_vec(&delta).unwrap())
            .await
            .unwrap();

        while store.counts().2 == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();
        task.await.unwrap();
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_failed_subscription() {
        #[derive(Default)]
        struct FlakyChannel {
            attempts: Mutex<usize>,
        }

        #[async_trait]
        impl MeshChannel for FlakyChannel {
            async fn set_snapshot(&self, _: &[u8], _: Duration) -> MeshResult<()> {
                Ok(())
            }
            async fn get_snapshot(&self) -> MeshResult<Option<Vec<u8>>> {
                Ok(None)
            }
            async fn publish_delta(&self, _: &[u8]) -> MeshResult<()> {
                Ok(())
            }
            async fn subscribe_delta(
                &self,
                _: DeltaHandler,
                _: CancellationToken,
            ) -> MeshResult<()> {
                *self.attempts.lock() += 1;
                Err(MeshError::Pool("connection refused".to_string()))
            }
            async fn try_acquire_leader(&self, _: &str, _: Duration) -> MeshResult<bool> {
                Ok(false)
            }
            async fn renew_leader(&self, _: &str, _: Duration) -> MeshResult<bool> {
                Ok(false)
            }
        }

        let channel = Arc::new(FlakyChannel::default());
        let hydrator = Arc::new(Hydrator::new(
            GraphStore::new(),
            channel.clone(),
            Facets::ALL,
        ));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(hydrator.run(cancel.clone(), Duration::from_secs(5)));

        tokio::time::sleep(Duration::from_secs(12)).await;
        cancel.cancel();
        task.await.unwrap();

        // Attempts at t=0, 5s and 10s.
        assert_eq!(*channel.attempts.lock(), 3);
    }
}
