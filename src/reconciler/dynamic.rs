//! `AuthorizationPolicy` access through the dynamic kube API.

use async_trait::async_trait;
use kube::{
    api::{Api, DynamicObject, PostParams},
    discovery::ApiResource,
    Client,
};
use serde_json::Value;

use super::{
    policy_api_version, LiveResource, PolicyResourceClient, POLICY_GROUP, POLICY_KIND,
    POLICY_PLURAL, POLICY_VERSION,
};
use crate::{error::MeshResult, graph::PolicyKey};

fn policy_resource() -> ApiResource {
    ApiResource {
        group: POLICY_GROUP.to_string(),
        version: POLICY_VERSION.to_string(),
        api_version: policy_api_version(),
        kind: POLICY_KIND.to_string(),
        plural: POLICY_PLURAL.to_string(),
    }
}

pub struct KubePolicyClient {
    client: Client,
    resource: ApiResource,
}

impl KubePolicyClient {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: policy_resource(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

#[async_trait]
impl PolicyResourceClient for KubePolicyClient {
    async fn get(&self, key: &PolicyKey) -> MeshResult<Option<LiveResource>> {
        match self.api(key.namespace()).get(key.name()).await {
            Ok(obj) => Ok(Some(LiveResource {
                resource_version: obj.metadata.resource_version,
            })),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, key: &PolicyKey, body: &Value) -> MeshResult<()> {
        let obj: DynamicObject = serde_json::from_value(body.clone())?;
        self.api(key.namespace())
            .create(&PostParams::default(), &obj)
            .await?;
        Ok(())
    }

    async fn update(&self, key: &PolicyKey, body: &Value, live: &LiveResource) -> MeshResult<()> {
        let mut obj: DynamicObject = serde_json::from_value(body.clone())?;
        // Replace requires the current resourceVersion.
        obj.metadata.resource_version = live.resource_version.clone();
        self.api(key.namespace())
            .replace(key.name(), &PostParams::default(), &obj)
            .await?;
        Ok(())
    }
}
