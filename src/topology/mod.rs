//! Topology builder
//!
//! Turns cluster watch events and metrics samples into graph mutations:
//! - Service events upsert/remove `Service` entries, with a sidecar lookup
//!   deciding `meshed`
//! - Workload (pod) events are logged with their owning service only
//! - Each metrics poll replaces the edge set wholesale
//!
//! Lookup and query failures never stop the builder; the affected facet keeps
//! its previous state until the next event or tick.

mod prometheus;
mod watch;

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::{
    prometheus::PrometheusClient,
    watch::{run_pod_watch, run_service_watch, KubeWorkloadLookup},
};
use crate::{
    error::{MeshError, MeshResult},
    graph::{Edge, GraphStore, Service},
};

/// Label that ties a pod to its service.
pub const APP_LABEL: &str = "app";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent<T> {
    Added(T),
    Updated(T),
    Removed(T),
}

impl<T> ResourceEvent<T> {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceEvent::Added(_) => "added",
            ResourceEvent::Updated(_) => "updated",
            ResourceEvent::Removed(_) => "removed",
        }
    }

    pub fn resource(&self) -> &T {
        match self {
            ResourceEvent::Added(r) | ResourceEvent::Updated(r) | ResourceEvent::Removed(r) => r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceInfo {
    pub name: String,
    pub namespace: String,
    pub selector: BTreeMap<String, String>,
}

impl ServiceInfo {
    /// Label selector used to find backing pods. A service without a
    /// selector falls back to `app={name}`.
    pub fn pod_selector(&self) -> BTreeMap<String, String> {
        if self.selector.is_empty() {
            BTreeMap::from([(APP_LABEL.to_string(), self.name.clone())])
        } else {
            self.selector.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkloadInfo {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<String>,
}

impl WorkloadInfo {
    pub fn owning_service(&self) -> Option<&str> {
        self.labels
            .get(APP_LABEL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Point lookup: does any pod matching `selector` run the mesh sidecar?
#[async_trait]
pub trait WorkloadLookup: Send + Sync {
    async fn has_sidecar(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> MeshResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetricSample {
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

impl MetricSample {
    pub fn label(&self, name: &str) -> &str {
        self.labels.get(name).map(String::as_str).unwrap_or("")
    }
}

#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query(&self, query: &str) -> MeshResult<Vec<MetricSample>>;
}

/// Outbound request rate grouped by destination, over `window`.
pub fn edge_query(window: Duration) -> String {
    format!(
        r#"sum by(dst_namespace, dst_deployment, dst_service)(rate(request_total{{direction="outbound"}}[{}s]))"#,
        window.as_secs().max(1)
    )
}

/// One edge per sample; `dst` is `"{namespace}/{workload}[/{service}]"`.
///
/// Non-finite rates are skipped: JSON has no encoding for them and a single
/// one would make every snapshot undecodable downstream.
pub fn edges_from_samples(samples: &[MetricSample]) -> Vec<Edge> {
    samples
        .iter()
        .filter(|sample| {
            let finite = sample.value.is_finite();
            if !finite {
                debug!(labels = ?sample.labels, "Skipping non-finite rate sample");
            }
            finite
        })
        .map(|sample| {
            let mut dst = format!(
                "{}/{}",
                sample.label("dst_namespace"),
                sample.label("dst_deployment")
            );
            let service = sample.label("dst_service");
            if !service.is_empty() {
                dst.push('/');
                dst.push_str(service);
            }
            Edge {
                src: sample.label("src_deployment").to_string(),
                dst,
                rps: sample.value,
                tls: sample.label("tls") == "true",
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub poll_interval: Duration,
    pub metrics_window: Duration,
    pub metrics_timeout: Duration,
    pub lookup_timeout: Duration,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            metrics_window: Duration::from_secs(30),
            metrics_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(10),
        }
    }
}

pub struct TopologyBuilder {
    store: GraphStore,
    lookup: Arc<dyn WorkloadLookup>,
    metrics: Arc<dyn MetricsSource>,
    config: TopologyConfig,
    query: String,
}

impl TopologyBuilder {
    pub fn new(
        store: GraphStore,
        lookup: Arc<dyn WorkloadLookup>,
        metrics: Arc<dyn MetricsSource>,
        config: TopologyConfig,
    ) -> Self {
        let query = edge_query(config.metrics_window);
        Self {
            store,
            lookup,
            metrics,
            config,
            query,
        }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub async fn handle_service_event(&self, event: ResourceEvent<ServiceInfo>) {
        match event {
            ResourceEvent::Added(svc) => {
                let meshed = self.detect_meshed(&svc).await.unwrap_or(false);
                self.store.upsert_service(Service {
                    name: svc.name.clone(),
                    namespace: svc.namespace.clone(),
                    meshed,
                });
                info!(namespace = %svc.namespace, name = %svc.name, meshed, "Service added");
            }
            ResourceEvent::Updated(svc) => {
                // A failed lookup keeps the flag already recorded.
                let meshed = match self.detect_meshed(&svc).await {
                    Some(meshed) => meshed,
                    None => self
                        .store
                        .service(&svc.name)
                        .is_some_and(|existing| existing.meshed),
                };
                self.store.upsert_service(Service {
                    name: svc.name.clone(),
                    namespace: svc.namespace.clone(),
                    meshed,
                });
                info!(namespace = %svc.namespace, name = %svc.name, meshed, "Service updated");
            }
            ResourceEvent::Removed(svc) => {
                if self.store.remove_service(&svc.name).is_some() {
                    info!(namespace = %svc.namespace, name = %svc.name, "Service removed");
                } else {
                    debug!(namespace = %svc.namespace, name = %svc.name, "Removed service was not tracked");
                }
            }
        }
    }

    /// Pod events are observed for visibility only.
    pub fn handle_workload_event(&self, event: &ResourceEvent<WorkloadInfo>) {
        let pod = event.resource();
        match pod.owning_service() {
            Some(service) => debug!(
                event = event.kind(),
                namespace = %pod.namespace,
                name = %pod.name,
                %service,
                "Pod event"
            ),
            None => debug!(
                event = event.kind(),
                namespace = %pod.namespace,
                name = %pod.name,
                "Pod event"
            ),
        }
    }

    /// `None` when the lookup failed or timed out.
    async fn detect_meshed(&self, svc: &ServiceInfo) -> Option<bool> {
        let selector = svc.pod_selector();
        let lookup = self.lookup.has_sidecar(&svc.namespace, &selector);
        match tokio::time::timeout(self.config.lookup_timeout, lookup).await {
            Ok(Ok(meshed)) => Some(meshed),
            Ok(Err(e)) => {
                warn!(namespace = %svc.namespace, name = %svc.name, error = %e, "Sidecar lookup failed");
                None
            }
            Err(_) => {
                warn!(namespace = %svc.namespace, name = %svc.name, timeout = ?self.config.lookup_timeout, "Sidecar lookup timed out");
                None
            }
        }
    }

    /// Run one metrics query and replace the edge set with its result.
    /// On failure the previous edges stay in place.
    pub async fn poll_metrics_once(&self) -> MeshResult<usize> {
        let samples = tokio::time::timeout(
            self.config.metrics_timeout,
            self.metrics.query(&self.query),
        )
        .await
        .map_err(|_| MeshError::Timeout(self.config.metrics_timeout))??;

        let edges = edges_from_samples(&samples);
        let count = edges.len();
        self.store.replace_edges(edges);
        Ok(count)
    }

    pub async fn run_metrics_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval = ?self.config.poll_interval,
            query = %self.query,
            "Starting metrics poll loop"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.poll_metrics_once().await {
                        Ok(count) => info!(edges = count, "Updated mesh edges"),
                        Err(e) => warn!(error = %e, "Metrics poll failed; keeping previous edges"),
                    }
                }
            }
        }

        info!("Metrics poll loop stopped");
    }
}
