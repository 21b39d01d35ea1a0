//! Mesh state synchronization and policy reconciliation
//!
//! A collector builds the mesh graph from cluster watches and metrics, then
//! publishes it through a shared store. A server hydrates a replica from that
//! store and accepts policy intents, which flow back to the collector and
//! are reconciled onto the cluster:
//! - [`graph`]: data model and the lock-guarded [`GraphStore`]
//! - [`channel`]: snapshot slot, delta topic and leader key (Redis or memory)
//! - [`topology`]: watch events and metric samples into graph mutations
//! - [`publisher`] / [`hydrator`]: snapshot out, snapshot and deltas in
//! - [`reconciler`]: converges stored policies onto cluster resources
//! - [`service`] / [`endpoints`]: `GetGraph` and `ApplyPolicy` over HTTP

pub mod channel;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod graph;
pub mod hydrator;
pub mod logging;
pub mod publisher;
pub mod reconciler;
pub mod service;
pub mod shutdown;
pub mod topology;

pub use channel::{InMemoryChannel, MeshChannel, RedisChannel, SharedChannel};
pub use error::{MeshError, MeshResult};
pub use graph::{
    AuthPolicy, Edge, Facets, GraphStore, MeshGraph, MeshGraphDelta, PolicyKey, Service,
};
pub use hydrator::{HydrationOutcome, Hydrator};
pub use publisher::SnapshotPublisher;
pub use reconciler::{LeaderElection, PolicyReconciler, ReconcileReport};
pub use service::{ApplyPolicyOutcome, MeshContextService};
pub use topology::{TopologyBuilder, TopologyConfig};
