//! mesh-collector: builds the mesh graph from the cluster and metrics,
//! publishes snapshots, and reconciles stored policies.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use mesh_context::{
    channel::{RedisChannel, SharedChannel},
    config::CollectorConfig,
    graph::{Facets, GraphStore},
    hydrator::Hydrator,
    logging::{init_logging, LoggingConfig},
    publisher::SnapshotPublisher,
    reconciler::{KubePolicyClient, LeaderElection, PolicyReconciler},
    shutdown,
    topology::{
        run_pod_watch, run_service_watch, KubeWorkloadLookup, PrometheusClient, TopologyBuilder,
        TopologyConfig,
    },
};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CollectorConfig::parse();
    init_logging(LoggingConfig::from(&config.logging));
    config
        .validate()
        .map_err(|e| anyhow!("invalid configuration: {e}"))?;

    let redis = config.redis.to_config();
    let channel: SharedChannel =
        Arc::new(RedisChannel::new(&redis).context("failed to create Redis channel")?);
    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let metrics = PrometheusClient::new(&config.prometheus_url, config.metrics_timeout())
        .context("failed to create Prometheus client")?;

    let store = GraphStore::new();
    let cancel = shutdown::install();
    let mut tasks = tokio::task::JoinSet::new();

    // Policies are owned by the server side; services and edges are rebuilt
    // here from the cluster.
    let hydrator = Arc::new(Hydrator::new(
        store.clone(),
        channel.clone(),
        Facets::AUTH_POLICIES,
    ));
    hydrator.hydrate().await;
    tasks.spawn(hydrator.run(cancel.clone(), config.resubscribe_delay()));

    let builder = Arc::new(TopologyBuilder::new(
        store.clone(),
        Arc::new(KubeWorkloadLookup::new(
            client.clone(),
            config.sidecar_container.clone(),
        )),
        Arc::new(metrics),
        TopologyConfig {
            poll_interval: config.metrics_poll_interval(),
            metrics_window: config.metrics_window(),
            metrics_timeout: config.metrics_timeout(),
            lookup_timeout: config.lookup_timeout(),
        },
    ));
    tasks.spawn(run_service_watch(
        client.clone(),
        builder.clone(),
        cancel.clone(),
    ));
    tasks.spawn(run_pod_watch(client.clone(), builder.clone(), cancel.clone()));
    tasks.spawn(builder.run_metrics_loop(cancel.clone()));

    let publisher = SnapshotPublisher::new(
        store.clone(),
        channel.clone(),
        config.snapshot_interval(),
        config.snapshot_ttl(),
    );
    tasks.spawn(publisher.run(cancel.clone()));

    let mut reconciler = PolicyReconciler::new(
        store.clone(),
        Arc::new(KubePolicyClient::new(client)),
        config.reconcile_interval(),
    );
    if config.leader_election {
        let identity = config.identity();
        info!(%identity, "Reconciler leader election enabled");
        reconciler = reconciler.with_leader_election(LeaderElection::new(
            channel.clone(),
            identity,
            config.leader_ttl(),
        ));
    }
    tasks.spawn(reconciler.run(cancel.clone()));

    info!(prometheus = %config.prometheus_url, "Collector started");

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Collector task panicked; shutting down");
            cancel.cancel();
        }
    }

    info!("Collector stopped");
    Ok(())
}
