//! Policy reconciler
//!
//! Level-triggered: every pass walks the full `authPolicies` facet and
//! converges each entry onto a cluster `AuthorizationPolicy` with
//! create-if-absent, full-replace-if-present semantics. One bad entry never
//! stops the pass.

mod dynamic;

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::dynamic::KubePolicyClient;
use crate::{
    channel::{SharedChannel, LEADER_KEY},
    error::MeshResult,
    graph::{GraphStore, PolicyKey, PolicySpec},
};

pub const POLICY_GROUP: &str = "policy.linkerd.io";
pub const POLICY_VERSION: &str = "v1alpha1";
pub const POLICY_KIND: &str = "AuthorizationPolicy";
pub const POLICY_PLURAL: &str = "authorizationpolicies";

pub fn policy_api_version() -> String {
    format!("{POLICY_GROUP}/{POLICY_VERSION}")
}

/// Full resource body for a stored policy. The stored spec is used verbatim.
pub fn policy_manifest(key: &PolicyKey, spec: &PolicySpec) -> Value {
    json!({
        "apiVersion": policy_api_version(),
        "kind": POLICY_KIND,
        "metadata": {
            "name": key.name(),
            "namespace": key.namespace(),
        },
        "spec": spec,
    })
}

/// What the cluster currently holds for a policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveResource {
    pub resource_version: Option<String>,
}

/// Get/create/replace against the cluster's policy resources.
#[async_trait]
pub trait PolicyResourceClient: Send + Sync {
    /// `Ok(None)` when the resource does not exist.
    async fn get(&self, key: &PolicyKey) -> MeshResult<Option<LiveResource>>;

    async fn create(&self, key: &PolicyKey, body: &Value) -> MeshResult<()>;

    /// Full replace of an existing resource.
    async fn update(&self, key: &PolicyKey, body: &Value, live: &LiveResource) -> MeshResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
    pub rejected: usize,
}

impl ReconcileReport {
    pub fn total(&self) -> usize {
        self.created + self.updated + self.failed + self.rejected
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} updated={} failed={} rejected={}",
            self.created, self.updated, self.failed, self.rejected
        )
    }
}

enum Outcome {
    Created,
    Updated,
}

/// Single-writer gate over the channel's leader key.
pub struct LeaderElection {
    channel: SharedChannel,
    identity: String,
    ttl: Duration,
}

impl LeaderElection {
    pub fn new(channel: SharedChannel, identity: impl Into<String>, ttl: Duration) -> Self {
        Self {
            channel,
            identity: identity.into(),
            ttl,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Extend our lease if we hold it, otherwise try to take a free one.
    pub async fn ensure_leader(&self) -> MeshResult<bool> {
        if self.channel.renew_leader(&self.identity, self.ttl).await? {
            return Ok(true);
        }
        let acquired = self
            .channel
            .try_acquire_leader(&self.identity, self.ttl)
            .await?;
        if acquired {
            info!(key = LEADER_KEY, identity = %self.identity, "Acquired reconciler leadership");
        }
        Ok(acquired)
    }
}

pub struct PolicyReconciler {
    store: GraphStore,
    client: Arc<dyn PolicyResourceClient>,
    interval: Duration,
    leader: Option<LeaderElection>,
}

impl PolicyReconciler {
    pub fn new(store: GraphStore, client: Arc<dyn PolicyResourceClient>, interval: Duration) -> Self {
        Self {
            store,
            client,
            interval,
            leader: None,
        }
    }

    /// Only reconcile on ticks where `leader` holds the leader key.
    pub fn with_leader_election(mut self, leader: LeaderElection) -> Self {
        self.leader = Some(leader);
        self
    }

    async fn reconcile_policy(&self, key: &PolicyKey, spec: &PolicySpec) -> MeshResult<Outcome> {
        let body = policy_manifest(key, spec);
        match self.client.get(key).await? {
            None => {
                self.client.create(key, &body).await?;
                Ok(Outcome::Created)
            }
            Some(live) => {
                self.client.update(key, &body, &live).await?;
                Ok(Outcome::Updated)
            }
        }
    }

    /// One pass over every stored policy.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let policies = self.store.snapshot().auth_policies;
        let mut report = ReconcileReport::default();

        for (raw_key, policy) in &policies {
            let key = match PolicyKey::parse(raw_key) {
                Ok(key) => key,
                Err(e) => {
                    warn!(key = %raw_key, error = %e, "Skipping policy with invalid key");
                    report.rejected += 1;
                    continue;
                }
            };

            match self.reconcile_policy(&key, &policy.spec).await {
                Ok(Outcome::Created) => {
                    info!(%key, "Created AuthorizationPolicy");
                    report.created += 1;
                }
                Ok(Outcome::Updated) => {
                    debug!(%key, "Updated AuthorizationPolicy");
                    report.updated += 1;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Failed to reconcile AuthorizationPolicy");
                    report.failed += 1;
                }
            }
        }

        report
    }

    /// Whether this tick should reconcile. Always true without leader gating.
    async fn should_reconcile(&self) -> bool {
        let Some(leader) = &self.leader else {
            return true;
        };
        match leader.ensure_leader().await {
            Ok(true) => true,
            Ok(false) => {
                debug!(identity = %leader.identity(), "Not the leader; skipping reconciliation");
                false
            }
            Err(e) => {
                warn!(identity = %leader.identity(), error = %e, "Leader check failed; skipping reconciliation");
                false
            }
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval = ?self.interval,
            leader_election = self.leader.is_some(),
            "Starting policy reconciler"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !self.should_reconcile().await {
                        continue;
                    }
                    // A pass stuck on a slow API server must not hold up shutdown.
                    let report = tokio::select! {
                        _ = cancel.cancelled() => {
                            info!("Reconciliation pass interrupted by shutdown");
                            break;
                        }
                        report = self.reconcile_once() => report,
                    };
                    if report.total() > 0 {
                        info!(
                            created = report.created,
                            updated = report.updated,
                            failed = report.failed,
                            rejected = report.rejected,
                            "Reconciliation pass complete"
                        );
                    }
                }
            }
        }

        info!("Policy reconciler stopped");
    }
}
