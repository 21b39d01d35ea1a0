//! Mesh graph data model
//!
//! Three facets make up the graph:
//! - Services: keyed by service name
//! - Edges: point-in-time traffic observations, replaced on every metrics poll
//! - AuthPolicies: keyed by `"{namespace}/{name}"`
//!
//! `MeshGraph` is the unit of snapshotting; `MeshGraphDelta` is what travels
//! on the delta topic.

mod store;

use std::{collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use store::GraphStore;

/// Opaque policy body. Any JSON object is accepted so that new policy
/// schemas pass through untouched.
pub type PolicySpec = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub meshed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Edge {
    /// Empty when the metrics source cannot attribute the caller.
    #[serde(default)]
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub rps: f64,
    #[serde(default)]
    pub tls: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AuthPolicy {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub spec: PolicySpec,
}

impl AuthPolicy {
    pub fn new(key: &PolicyKey, spec: PolicySpec) -> Self {
        Self {
            name: key.name().to_string(),
            namespace: key.namespace().to_string(),
            spec,
        }
    }

    pub fn key(&self) -> Result<PolicyKey, PolicyKeyError> {
        PolicyKey::new(&self.namespace, &self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeshGraph {
    #[serde(default)]
    pub services: BTreeMap<String, Service>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub auth_policies: BTreeMap<String, AuthPolicy>,
}

impl MeshGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

// ============================================================================
// Policy keys
// ============================================================================

const POLICY_KEY_SEPARATOR: char = '/';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyKeyError {
    #[error("'{0}' has no '/' separator")]
    MissingSeparator(String),
    #[error("'{0}' has an empty namespace")]
    EmptyNamespace(String),
    #[error("'{0}' has an empty name")]
    EmptyName(String),
    #[error("'{0}' has more than one '/' separator")]
    ExtraSeparator(String),
}

/// `"{namespace}/{name}"` identity of an authorization policy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    namespace: String,
    name: String,
}

impl PolicyKey {
    pub fn new(namespace: &str, name: &str) -> Result<Self, PolicyKeyError> {
        let raw = format!("{namespace}{POLICY_KEY_SEPARATOR}{name}");
        if namespace.is_empty() {
            return Err(PolicyKeyError::EmptyNamespace(raw));
        }
        if name.is_empty() {
            return Err(PolicyKeyError::EmptyName(raw));
        }
        if namespace.contains(POLICY_KEY_SEPARATOR) || name.contains(POLICY_KEY_SEPARATOR) {
            return Err(PolicyKeyError::ExtraSeparator(raw));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    pub fn parse(key: &str) -> Result<Self, PolicyKeyError> {
        let (namespace, name) = key
            .split_once(POLICY_KEY_SEPARATOR)
            .ok_or_else(|| PolicyKeyError::MissingSeparator(key.to_string()))?;
        Self::new(namespace, name)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.namespace, POLICY_KEY_SEPARATOR, self.name)
    }
}

impl FromStr for PolicyKey {
    type Err = PolicyKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ============================================================================
// Deltas
// ============================================================================

/// Which facets of the graph a message touches or a replica accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Facets {
    pub services: bool,
    pub edges: bool,
    pub auth_policies: bool,
}

impl Facets {
    pub const ALL: Facets = Facets {
        services: true,
        edges: true,
        auth_policies: true,
    };

    pub const NONE: Facets = Facets {
        services: false,
        edges: false,
        auth_policies: false,
    };

    pub const AUTH_POLICIES: Facets = Facets {
        services: false,
        edges: false,
        auth_policies: true,
    };

    pub fn is_empty(&self) -> bool {
        !(self.services || self.edges || self.auth_policies)
    }
}

impl fmt::Display for Facets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (self.services, "services"),
            (self.edges, "edges"),
            (self.auth_policies, "authPolicies"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

/// A full or partial graph received on the delta topic.
///
/// Every facet present in the message replaces the local facet wholesale.
/// Facets absent from the message (missing or `null`) are left alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MeshGraphDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<BTreeMap<String, Service>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edges: Option<Vec<Edge>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_policies: Option<BTreeMap<String, AuthPolicy>>,
}

impl MeshGraphDelta {
    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn facets(&self) -> Facets {
        Facets {
            services: self.services.is_some(),
            edges: self.edges.is_some(),
            auth_policies: self.auth_policies.is_some(),
        }
    }

    /// Drop every facet not in `accepted`.
    pub fn restrict(mut self, accepted: Facets) -> Self {
        if !accepted.services {
            self.services = None;
        }
        if !accepted.edges {
            self.edges = None;
        }
        if !accepted.auth_policies {
            self.auth_policies = None;
        }
        self
    }
}

impl From<MeshGraph> for MeshGraphDelta {
    fn from(graph: MeshGraph) -> Self {
        Self {
            services: Some(graph.services),
            edges: Some(graph.edges),
            auth_policies: Some(graph.auth_policies),
        }
    }
}
