//! Process-local graph store
//!
//! One `RwLock` guards the whole `MeshGraph`. Writers take the write lock for
//! the duration of a single facet mutation; readers clone or serialize under
//! the read lock, so nobody observes a half-applied write.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{AuthPolicy, Edge, Facets, MeshGraph, MeshGraphDelta, PolicyKey, Service};

#[derive(Debug, Clone, Default)]
pub struct GraphStore {
    inner: Arc<RwLock<MeshGraph>>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_graph(graph: MeshGraph) -> Self {
        Self {
            inner: Arc::new(RwLock::new(graph)),
        }
    }

    /// Consistent point-in-time copy.
    pub fn snapshot(&self) -> MeshGraph {
        self.inner.read().clone()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        let graph = self.inner.read();
        serde_json::to_vec(&*graph)
    }

    /// Services and edges as a delta, read under one lock. Policies are left
    /// out so receivers keep their own.
    pub fn topology_delta(&self) -> MeshGraphDelta {
        let graph = self.inner.read();
        MeshGraphDelta {
            services: Some(graph.services.clone()),
            edges: Some(graph.edges.clone()),
            auth_policies: None,
        }
    }

    pub fn replace(&self, graph: MeshGraph) {
        *self.inner.write() = graph;
    }

    pub fn upsert_service(&self, service: Service) -> Option<Service> {
        let mut graph = self.inner.write();
        graph.services.insert(service.name.clone(), service)
    }

    pub fn remove_service(&self, name: &str) -> Option<Service> {
        self.inner.write().services.remove(name)
    }

    pub fn service(&self, name: &str) -> Option<Service> {
        self.inner.read().services.get(name).cloned()
    }

    /// Swap in a freshly computed edge set; edges never accumulate.
    pub fn replace_edges(&self, edges: Vec<Edge>) {
        self.inner.write().edges = edges;
    }

    pub fn upsert_policy(&self, key: &PolicyKey, policy: AuthPolicy) -> Option<AuthPolicy> {
        self.inner
            .write()
            .auth_policies
            .insert(key.to_string(), policy)
    }

    /// Upsert a policy and serialize the resulting graph under one write lock.
    ///
    /// If serialization fails the previous entry is restored, leaving the
    /// store exactly as it was.
    pub fn upsert_policy_serialized(
        &self,
        key: &PolicyKey,
        policy: AuthPolicy,
    ) -> serde_json::Result<Vec<u8>> {
        let mut graph = self.inner.write();
        let key = key.to_string();
        let previous = graph.auth_policies.insert(key.clone(), policy);
        match serde_json::to_vec(&*graph) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                match previous {
                    Some(old) => graph.auth_policies.insert(key, old),
                    None => graph.auth_policies.remove(&key),
                };
                Err(e)
            }
        }
    }

    pub fn remove_policy(&self, key: &PolicyKey) -> Option<AuthPolicy> {
        self.inner.write().auth_policies.remove(&key.to_string())
    }

    pub fn policy(&self, key: &PolicyKey) -> Option<AuthPolicy> {
        self.inner
            .read()
            .auth_policies
            .get(&key.to_string())
            .cloned()
    }

    /// Replace every facet present in `delta`, returning the facets written.
    pub fn apply_delta(&self, delta: MeshGraphDelta) -> Facets {
        let applied = delta.facets();
        if applied.is_empty() {
            return applied;
        }

        let mut graph = self.inner.write();
        if let Some(services) = delta.services {
            graph.services = services;
        }
        if let Some(edges) = delta.edges {
            graph.edges = edges;
        }
        if let Some(auth_policies) = delta.auth_policies {
            graph.auth_policies = auth_policies;
        }
        debug!(facets = %applied, "Applied mesh delta");
        applied
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let graph = self.inner.read();
        (
            graph.services.len(),
            graph.edges.len(),
            graph.auth_policies.len(),
        )
    }
}
