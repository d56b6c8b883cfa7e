//! In-memory policy store with Kubernetes-like resourceVersion semantics.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::debug;

use super::{PolicyEvent, PolicyStore, StoreError};
use crate::crds::{RollbackPolicy, RollbackPolicyStatus};
use crate::policy::validate_policy;
use crate::types::PolicyKey;

type Interference = Box<dyn FnOnce(&mut RollbackPolicy) + Send>;

pub struct MemoryPolicyStore {
    objects: RwLock<BTreeMap<PolicyKey, RollbackPolicy>>,
    version: AtomicU64,
    events: broadcast::Sender<PolicyEvent>,
    interference: Mutex<Vec<(PolicyKey, Interference)>>,
}

impl Default for MemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            objects: RwLock::new(BTreeMap::new()),
            version: AtomicU64::new(1),
            events,
            interference: Mutex::new(Vec::new()),
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn publish(&self, event: PolicyEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Simulate a concurrent writer: before the next status write for `key`
    /// lands, apply `mutate` to the stored object and bump its version.
    pub async fn interfere_before_next_status_write(
        &self,
        key: &PolicyKey,
        mutate: impl FnOnce(&mut RollbackPolicy) + Send + 'static,
    ) {
        self.interference
            .lock()
            .await
            .push((key.clone(), Box::new(mutate)));
    }

    /// Bump an object's resourceVersion without changing it.
    pub async fn touch(&self, key: &PolicyKey) -> Result<(), StoreError> {
        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        object.metadata.resource_version = Some(self.next_version());
        Ok(())
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn get(&self, key: &PolicyKey) -> Result<Option<RollbackPolicy>, StoreError> {
        Ok(self.objects.read().await.get(key).cloned())
    }

    async fn list(&self) -> Result<Vec<RollbackPolicy>, StoreError> {
        Ok(self.objects.read().await.values().cloned().collect())
    }

    async fn create(&self, mut policy: RollbackPolicy) -> Result<RollbackPolicy, StoreError> {
        let mut objects = self.objects.write().await;
        let key = policy.key();
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }

        let existing: Vec<RollbackPolicy> = objects.values().cloned().collect();
        validate_policy(&policy, &existing)?;

        policy.metadata.resource_version = Some(self.next_version());
        policy.metadata.generation = Some(1);
        policy.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        policy.status = None;

        objects.insert(key.clone(), policy.clone());
        drop(objects);

        debug!(policy = %key, "Created policy");
        self.publish(PolicyEvent::Applied(Box::new(policy.clone())));
        Ok(policy)
    }

    async fn update(&self, policy: RollbackPolicy) -> Result<RollbackPolicy, StoreError> {
        let mut objects = self.objects.write().await;
        let key = policy.key();
        let current = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if let Some(rv) = &policy.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(rv) {
                return Err(StoreError::Conflict(key));
            }
        }

        let existing: Vec<RollbackPolicy> = objects.values().cloned().collect();
        validate_policy(&policy, &existing)?;

        let mut updated = current.clone();
        if updated.spec != policy.spec {
            updated.spec = policy.spec;
            updated.metadata.generation = Some(updated.metadata.generation.unwrap_or(0) + 1);
        }
        updated.metadata.labels = policy.metadata.labels;
        updated.metadata.annotations = policy.metadata.annotations;
        updated.metadata.resource_version = Some(self.next_version());

        objects.insert(key, updated.clone());
        drop(objects);

        self.publish(PolicyEvent::Applied(Box::new(updated.clone())));
        Ok(updated)
    }

    async fn delete(&self, key: &PolicyKey) -> Result<(), StoreError> {
        let removed = self.objects.write().await.remove(key);
        match removed {
            Some(_) => {
                self.publish(PolicyEvent::Deleted(key.clone()));
                Ok(())
            }
            None => Err(StoreError::NotFound(key.clone())),
        }
    }

    async fn replace_status(
        &self,
        key: &PolicyKey,
        resource_version: &str,
        status: RollbackPolicyStatus,
    ) -> Result<RollbackPolicy, StoreError> {
        let interference: Vec<Interference> = {
            let mut pending = self.interference.lock().await;
            let (matching, rest): (Vec<_>, Vec<_>) =
                pending.drain(..).partition(|(k, _)| k == key);
            *pending = rest;
            matching.into_iter().map(|(_, f)| f).collect()
        };

        let mut objects = self.objects.write().await;
        let object = objects
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        for mutate in interference {
            let before = object.spec.clone();
            mutate(object);
            if object.spec != before {
                object.metadata.generation = Some(object.metadata.generation.unwrap_or(0) + 1);
            }
            object.metadata.resource_version = Some(self.next_version());
        }

        if object.metadata.resource_version.as_deref() != Some(resource_version) {
            return Err(StoreError::Conflict(key.clone()));
        }

        object.status = Some(status);
        object.metadata.resource_version = Some(self.next_version());
        let updated = object.clone();
        drop(objects);

        self.publish(PolicyEvent::Applied(Box::new(updated.clone())));
        Ok(updated)
    }

    fn watch(&self) -> BoxStream<'static, Result<PolicyEvent, StoreError>> {
        let receiver = self.events.subscribe();
        stream::unfold(receiver, |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                    Err(StoreError::Watch(format!("watch lagged by {skipped} events"))),
                    rx,
                )),
                Err(broadcast::error::RecvError::Closed) => None,
            }
        })
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        AppliedStatus, ConditionOperator, ConditionSpec, ConditionType, RollbackPolicySpec,
        TargetKind, TargetRef,
    };

    fn policy(name: &str, target: &str) -> RollbackPolicy {
        let mut p = RollbackPolicy::new(
            name,
            RollbackPolicySpec {
                target_ref: TargetRef {
                    api_kind: TargetKind::Deployment,
                    name: target.to_string(),
                    namespace: None,
                },
                metrics: vec![],
                conditions: vec![ConditionSpec {
                    condition_type: ConditionType::AvailableReplicas,
                    operator: ConditionOperator::LessThan,
                    value: "1".to_string(),
                }],
                check_interval: 60,
                rollback_to_revision: None,
                remediation: None,
            },
        );
        p.metadata.namespace = Some("default".to_string());
        p
    }

    #[tokio::test]
    async fn test_status_write_is_compare_and_swap() {
        let store = MemoryPolicyStore::new();
        let created = store.create(policy("guard", "web")).await.unwrap();
        let key = created.key();
        let rv = created.metadata.resource_version.clone().unwrap();

        let status = RollbackPolicyStatus {
            last_applied_status: Some(AppliedStatus::NoActionNeeded),
            ..Default::default()
        };
        let written = store.replace_status(&key, &rv, status.clone()).await.unwrap();
        assert_ne!(written.metadata.resource_version.as_deref(), Some(rv.as_str()));

        // The old version is now stale.
        let err = store.replace_status(&key, &rv, status).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_and_duplicate_targets() {
        let store = MemoryPolicyStore::new();
        store.create(policy("guard", "web")).await.unwrap();

        let err = store.create(policy("guard-2", "web")).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let mut short = policy("guard-3", "api");
        short.spec.check_interval = 10;
        let err = store.create(short).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));

        let err = store.create(policy("guard", "api")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_generation_only_on_spec_change() {
        let store = MemoryPolicyStore::new();
        let created = store.create(policy("guard", "web")).await.unwrap();

        let mut edited = created.clone();
        edited.spec.check_interval = 120;
        let updated = store.update(edited).await.unwrap();
        assert_eq!(updated.metadata.generation, Some(2));

        // Stale resourceVersion is rejected.
        let err = store.update(created).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_watch_sees_writes_and_deletes() {
        let store = MemoryPolicyStore::new();
        let mut events = store.watch();

        let created = store.create(policy("guard", "web")).await.unwrap();
        store.delete(&created.key()).await.unwrap();

        assert!(matches!(events.next().await, Some(Ok(PolicyEvent::Applied(_)))));
        assert!(
            matches!(events.next().await, Some(Ok(PolicyEvent::Deleted(k))) if k == created.key())
        );
    }
}
