//! Query/mutation operations behind the server's external surface.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    channel::SharedChannel,
    error::MeshResult,
    graph::{AuthPolicy, GraphStore, PolicyKey},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyPolicyOutcome {
    pub accepted: bool,
    pub message: String,
}

impl ApplyPolicyOutcome {
    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message: message.into(),
        }
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message: message.into(),
        }
    }
}

#[derive(Clone)]
pub struct MeshContextService {
    store: GraphStore,
    channel: SharedChannel,
}

impl MeshContextService {
    pub fn new(store: GraphStore, channel: SharedChannel) -> Self {
        Self { store, channel }
    }

    pub fn store(&self) -> &GraphStore {
        &self.store
    }

    /// Serialized point-in-time copy of the local graph.
    pub fn get_graph(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(&self.store.snapshot())?)
    }

    /// Validate, upsert locally, then publish the whole graph as a delta.
    ///
    /// Rejections before the upsert leave the store untouched. A publish
    /// failure is reported as rejected but the local upsert stands; peers
    /// receive it with the next successful publish, which carries the whole
    /// graph.
    pub async fn apply_policy(&self, namespace: &str, name: &str, spec_json: &str) -> ApplyPolicyOutcome {
        let key = match PolicyKey::new(namespace, name) {
            Ok(key) => key,
            Err(e) => {
                warn!(%namespace, %name, error = %e, "Rejected policy with invalid key");
                return ApplyPolicyOutcome::rejected(format!("Invalid policy key: {e}"));
            }
        };

        let spec = match serde_json::from_str::<Value>(spec_json) {
            Ok(Value::Object(spec)) => spec,
            Ok(other) => {
                warn!(%key, "Rejected policy spec that is not a JSON object");
                return ApplyPolicyOutcome::rejected(format!(
                    "Invalid JSON spec: expected an object, got {}",
                    json_type(&other)
                ));
            }
            Err(e) => {
                warn!(%key, error = %e, "Rejected policy with unparseable spec");
                return ApplyPolicyOutcome::rejected(format!("Invalid JSON spec: {e}"));
            }
        };

        let payload = match self
            .store
            .upsert_policy_serialized(&key, AuthPolicy::new(&key, spec))
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%key, error = %e, "Failed to serialize mesh graph");
                return ApplyPolicyOutcome::rejected(format!("Failed to marshal mesh graph: {e}"));
            }
        };

        if let Err(e) = self.channel.publish_delta(&payload).await {
            warn!(%key, error = %e, "Policy stored locally but delta publish failed");
            return ApplyPolicyOutcome::rejected(format!("Failed to publish mesh delta: {e}"));
        }

        info!(%key, bytes = payload.len(), "Policy applied and published");
        ApplyPolicyOutcome::accepted("Policy applied and published")
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
