//! `PolicyStore` backed by the Kubernetes API server.

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use tracing::{debug, warn};

use super::{PolicyEvent, PolicyStore, StoreError};
use crate::crds::{RollbackPolicy, RollbackPolicyStatus};
use crate::policy::validate_policy;
use crate::types::PolicyKey;

pub struct KubePolicyStore {
    client: Client,
    /// Restrict list/watch to one namespace; `None` watches the whole cluster.
    namespace: Option<String>,
}

impl KubePolicyStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn scoped(&self) -> Api<RollbackPolicy> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn api(&self, namespace: &str) -> Api<RollbackPolicy> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn map_write_error(key: &PolicyKey, err: kube::Error) -> StoreError {
        match err {
            kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(key.clone())
            }
            kube::Error::Api(e) if e.code == 409 => StoreError::Conflict(key.clone()),
            kube::Error::Api(e) if e.code == 404 => StoreError::NotFound(key.clone()),
            other => StoreError::Kube(other),
        }
    }
}

#[async_trait]
impl PolicyStore for KubePolicyStore {
    async fn get(&self, key: &PolicyKey) -> Result<Option<RollbackPolicy>, StoreError> {
        Ok(self.api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn list(&self) -> Result<Vec<RollbackPolicy>, StoreError> {
        Ok(self.scoped().list(&ListParams::default()).await?.items)
    }

    async fn create(&self, policy: RollbackPolicy) -> Result<RollbackPolicy, StoreError> {
        let key = policy.key();
        let existing = self.list().await?;
        validate_policy(&policy, &existing)?;

        self.api(&key.namespace)
            .create(&PostParams::default(), &policy)
            .await
            .map_err(|e| Self::map_write_error(&key, e))
    }

    async fn update(&self, policy: RollbackPolicy) -> Result<RollbackPolicy, StoreError> {
        let key = policy.key();
        let existing = self.list().await?;
        validate_policy(&policy, &existing)?;

        self.api(&key.namespace)
            .replace(&key.name, &PostParams::default(), &policy)
            .await
            .map_err(|e| Self::map_write_error(&key, e))
    }

    async fn delete(&self, key: &PolicyKey) -> Result<(), StoreError> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map_err(|e| Self::map_write_error(key, e))?;
        Ok(())
    }

    async fn replace_status(
        &self,
        key: &PolicyKey,
        resource_version: &str,
        status: RollbackPolicyStatus,
    ) -> Result<RollbackPolicy, StoreError> {
        // A replace carrying metadata.resourceVersion is rejected with 409
        // when the object changed since it was read.
        let body = serde_json::json!({
            "apiVersion": RollbackPolicy::api_version(&()),
            "kind": RollbackPolicy::kind(&()),
            "metadata": {
                "name": key.name,
                "namespace": key.namespace,
                "resourceVersion": resource_version,
            },
            "status": status,
        });

        debug!(policy = %key, resource_version, "Replacing policy status");

        self.api(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), serde_json::to_vec(&body)?)
            .await
            .map_err(|e| Self::map_write_error(key, e))
    }

    fn watch(&self) -> BoxStream<'static, Result<PolicyEvent, StoreError>> {
        watcher(self.scoped(), watcher::Config::default())
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(watcher::Event::Apply(policy) | watcher::Event::InitApply(policy)) => {
                        Some(Ok(PolicyEvent::Applied(Box::new(policy))))
                    }
                    Ok(watcher::Event::Delete(policy)) => Some(Ok(PolicyEvent::Deleted(
                        PolicyKey::new(policy.namespace().unwrap_or_default(), policy.name_any()),
                    ))),
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(e) => {
                        warn!(error = %e, "Policy watch error");
                        Some(Err(StoreError::Watch(e.to_string())))
                    }
                }
            })
            .boxed()
    }
}
