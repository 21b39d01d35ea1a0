//! Cluster-side adapters: pod lookups and service/pod watch streams.

use std::{
    collections::{BTreeMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service as KubeService};
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{self, Event},
    Client, ResourceExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ResourceEvent, ServiceInfo, TopologyBuilder, WorkloadInfo, WorkloadLookup};
use crate::error::MeshResult;

const WATCH_RETRY_DELAY: Duration = Duration::from_secs(5);

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn pod_runs_container(pod: &Pod, container: &str) -> bool {
    pod.spec.as_ref().is_some_and(|spec| {
        spec.containers.iter().any(|c| c.name == container)
            || spec
                .init_containers
                .as_ref()
                .is_some_and(|init| init.iter().any(|c| c.name == container))
    })
}

pub struct KubeWorkloadLookup {
    client: Client,
    sidecar_container: String,
}

impl KubeWorkloadLookup {
    pub fn new(client: Client, sidecar_container: impl Into<String>) -> Self {
        Self {
            client,
            sidecar_container: sidecar_container.into(),
        }
    }
}

#[async_trait]
impl WorkloadLookup for KubeWorkloadLookup {
    async fn has_sidecar(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> MeshResult<bool> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector_string(selector));
        let list = pods.list(&params).await?;
        Ok(list
            .items
            .iter()
            .any(|pod| pod_runs_container(pod, &self.sidecar_container)))
    }
}

fn service_info(svc: &KubeService) -> ServiceInfo {
    ServiceInfo {
        name: svc.name_any(),
        namespace: svc.namespace().unwrap_or_else(|| "default".to_string()),
        selector: svc
            .spec
            .as_ref()
            .and_then(|spec| spec.selector.clone())
            .unwrap_or_default(),
    }
}

fn workload_info(pod: &Pod) -> WorkloadInfo {
    WorkloadInfo {
        name: pod.name_any(),
        namespace: pod.namespace().unwrap_or_else(|| "default".to_string()),
        labels: pod.labels().clone(),
        containers: pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default(),
    }
}

type ObjectKey = (String, String);

/// Splits watcher `Apply` events into first-seen (`Added`) and repeat
/// (`Updated`) notifications, and finds objects that disappeared while the
/// watch was down.
///
/// A relist (`Init` .. `InitDone`) replays every live object but sends no
/// `Delete` for objects removed in the meantime; keys not replayed are
/// returned by `finish_relist`.
#[derive(Default)]
struct SeenSet {
    keys: HashSet<ObjectKey>,
    relisted: Option<HashSet<ObjectKey>>,
}

impl SeenSet {
    fn classify<T>(&mut self, key: ObjectKey, resource: T) -> ResourceEvent<T> {
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.insert(key.clone());
        }
        if self.keys.insert(key) {
            ResourceEvent::Added(resource)
        } else {
            ResourceEvent::Updated(resource)
        }
    }

    fn forget<T>(&mut self, key: &ObjectKey, resource: T) -> ResourceEvent<T> {
        self.keys.remove(key);
        if let Some(relisted) = self.relisted.as_mut() {
            relisted.remove(key);
        }
        ResourceEvent::Removed(resource)
    }

    fn begin_relist(&mut self) {
        self.relisted = Some(HashSet::new());
    }

    /// Keys known before the relist that it did not replay, sorted.
    fn finish_relist(&mut self) -> Vec<ObjectKey> {
        let Some(relisted) = self.relisted.take() else {
            return Vec::new();
        };
        let mut stale: Vec<ObjectKey> = self.keys.difference(&relisted).cloned().collect();
        stale.sort();
        for key in &stale {
            self.keys.remove(key);
        }
        stale
    }
}

/// Sleep for `delay` unless cancelled first. Returns `true` on cancellation.
async fn pause_or_cancelled(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

/// Translate the service watch stream into builder events until cancelled.
pub async fn run_service_watch(
    client: Client,
    builder: Arc<TopologyBuilder>,
    cancel: CancellationToken,
) {
    let api: Api<KubeService> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default());
    let mut stream = std::pin::pin!(stream);
    let mut seen = SeenSet::default();

    info!("Service watch started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => {
                let Some(event) = event else {
                    warn!("Service watch stream ended");
                    break;
                };
                match event {
                    Ok(Event::Apply(svc)) | Ok(Event::InitApply(svc)) => {
                        let info = service_info(&svc);
                        let key = (info.namespace.clone(), info.name.clone());
                        let event = seen.classify(key, info);
                        builder.handle_service_event(event).await;
                    }
                    Ok(Event::Delete(svc)) => {
                        let info = service_info(&svc);
                        let key = (info.namespace.clone(), info.name.clone());
                        let event = seen.forget(&key, info);
                        builder.handle_service_event(event).await;
                    }
                    Ok(Event::Init) => {
                        debug!("Service watcher relisting");
                        seen.begin_relist();
                    }
                    Ok(Event::InitDone) => {
                        let stale = seen.finish_relist();
                        if !stale.is_empty() {
                            info!(count = stale.len(), "Pruning services deleted while the watch was down");
                        }
                        for (namespace, name) in stale {
                            builder
                                .handle_service_event(ResourceEvent::Removed(ServiceInfo {
                                    name,
                                    namespace,
                                    ..Default::default()
                                }))
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Service watch error, will retry");
                        if pause_or_cancelled(&cancel, WATCH_RETRY_DELAY).await {
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Service watch stopped");
}

/// Translate the pod watch stream into builder events until cancelled.
pub async fn run_pod_watch(
    client: Client,
    builder: Arc<TopologyBuilder>,
    cancel: CancellationToken,
) {
    let api: Api<Pod> = Api::all(client);
    let stream = watcher::watcher(api, watcher::Config::default());
    let mut stream = std::pin::pin!(stream);
    let mut seen = SeenSet::default();

    info!("Pod watch started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => {
                let Some(event) = event else {
                    warn!("Pod watch stream ended");
                    break;
                };
                match event {
                    Ok(Event::Apply(pod)) | Ok(Event::InitApply(pod)) => {
                        let info = workload_info(&pod);
                        let key = (info.namespace.clone(), info.name.clone());
                        let event = seen.classify(key, info);
                        builder.handle_workload_event(&event);
                    }
                    Ok(Event::Delete(pod)) => {
                        let info = workload_info(&pod);
                        let key = (info.namespace.clone(), info.name.clone());
                        let event = seen.forget(&key, info);
                        builder.handle_workload_event(&event);
                    }
                    Ok(Event::Init) => {
                        debug!("Pod watcher relisting");
                        seen.begin_relist();
                    }
                    Ok(Event::InitDone) => {
                        for (namespace, name) in seen.finish_relist() {
                            builder.handle_workload_event(&ResourceEvent::Removed(WorkloadInfo {
                                name,
                                namespace,
                                ..Default::default()
                            }));
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Pod watch error, will retry");
                        if pause_or_cancelled(&cancel, WATCH_RETRY_DELAY).await {
                            break;
                        }
                    }
                }
            }
        }
    }
    info!("Pod watch stopped");
}

#[cfg(test)]
mod tests {
    use k8s_openapi::{
        api::core::v1::{Container, PodSpec, ServiceSpec},
        apimachinery::pkg::apis::meta::v1::ObjectMeta,
    };

    use super::*;

    fn pod(containers: &[&str], init: &[&str]) -> Pod {
        let to_containers = |names: &[&str]| {
            names
                .iter()
                .map(|n| Container {
                    name: n.to_string(),
                    ..Default::default()
                })
                .collect::<Vec<_>>()
        };
        Pod {
            metadata: ObjectMeta {
                name: Some("service-a-abc".to_string()),
                namespace: Some("ns".to_string()),
                labels: Some(BTreeMap::from([(
                    "app".to_string(),
                    "service-a".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: to_containers(containers),
                init_containers: (!init.is_empty()).then(|| to_containers(init)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_selector_string_is_sorted() {
        let selector = BTreeMap::from([
            ("tier".to_string(), "web".to_string()),
            ("app".to_string(), "demo".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "app=demo,tier=web");
    }

    #[test]
    fn test_sidecar_detection() {
        assert!(pod_runs_container(
            &pod(&["app", "linkerd-proxy"], &[]),
            "linkerd-proxy"
        ));
        assert!(pod_runs_container(
            &pod(&["app"], &["linkerd-init", "linkerd-proxy"]),
            "linkerd-proxy"
        ));
        assert!(!pod_runs_container(&pod(&["app"], &[]), "linkerd-proxy"));
        assert!(!pod_runs_container(&Pod::default(), "linkerd-proxy"));
    }

    #[test]
    fn test_workload_info_from_pod() {
        let info = workload_info(&pod(&["app", "linkerd-proxy"], &[]));
        assert_eq!(info.name, "service-a-abc");
        assert_eq!(info.namespace, "ns");
        assert_eq!(info.owning_service(), Some("service-a"));
        assert_eq!(info.containers, vec!["app", "linkerd-proxy"]);
    }

    #[test]
    fn test_service_info_from_service() {
        let svc = KubeService {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                selector: Some(BTreeMap::from([("app".to_string(), "web".to_string())])),
                ..Default::default()
            }),
            ..Default::default()
        };
        let info = service_info(&svc);
        assert_eq!(info.name, "web");
        assert_eq!(info.namespace, "shop");
        assert_eq!(info.selector.get("app").map(String::as_str), Some("web"));
    }

    #[test]
    fn test_seen_set_classifies_apply_events() {
        let mut seen = SeenSet::default();
        let key = |ns: &str, name: &str| (ns.to_string(), name.to_string());
        assert_eq!(seen.classify(key("ns", "a"), 1).kind(), "added");
        assert_eq!(seen.classify(key("ns", "a"), 2).kind(), "updated");
        assert_eq!(seen.classify(key("other", "a"), 3).kind(), "added");
        assert_eq!(seen.forget(&key("ns", "a"), 4).kind(), "removed");
        assert_eq!(seen.classify(key("ns", "a"), 5).kind(), "added");
    }

    #[test]
    fn test_relist_prunes_objects_deleted_while_down() {
        let mut seen = SeenSet::default();
        let key = |ns: &str, name: &str| (ns.to_string(), name.to_string());

        // Initial list.
        seen.begin_relist();
        seen.classify(key("ns", "svc-a"), ());
        seen.classify(key("ns", "svc-b"), ());
        assert!(seen.finish_relist().is_empty());

        // Watch drops; svc-b is deleted and svc-c created before the relist.
        seen.begin_relist();
        assert_eq!(seen.classify(key("ns", "svc-a"), ()).kind(), "updated");
        assert_eq!(seen.classify(key("ns", "svc-c"), ()).kind(), "added");
        assert_eq!(seen.finish_relist(), vec![key("ns", "svc-b")]);

        // Pruned keys are forgotten: seeing svc-b again is an add.
        assert_eq!(seen.classify(key("ns", "svc-b"), ()).kind(), "added");
        assert!(seen.finish_relist().is_empty());
    }

    #[test]
    fn test_finish_relist_without_begin_is_empty() {
        let mut seen = SeenSet::default();
        seen.classify(("ns".to_string(), "a".to_string()), ());
        assert!(seen.finish_relist().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_pause_ends_on_cancel() {
        let cancel = CancellationToken::new();
        assert!(!pause_or_cancelled(&cancel, Duration::from_secs(5)).await);

        let token = cancel.clone();
        let pause = tokio::spawn(async move {
            pause_or_cancelled(&token, Duration::from_secs(3600)).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let cancelled = tokio::time::timeout(Duration::from_secs(1), pause)
            .await
            .unwrap()
            .unwrap();
        assert!(cancelled);
    }
}
