//! `TargetClient` for Deployments and StatefulSets.
//!
//! Deployment rollback copies the pod template of the ReplicaSet that
//! carries the requested revision back onto the Deployment, the same way
//! `kubectl rollout undo` does. StatefulSet rollback re-applies the patch
//! stored in the matching ControllerRevision.
//!
//! Both controllers renumber a restored template to the next revision. The
//! Deployment keeps the old number in `revision-history`; for StatefulSets
//! the rollback records it in [`ROLLBACK_SOURCE_ANNOTATION`].

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::api::{ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::{Effect, ExecutorError, TargetClient};
use crate::crds::TargetKind;
use crate::source::kubernetes::{current_revision, REVISION_ANNOTATION};
use crate::types::ResolvedTarget;

/// Pod-template annotation carrying the last applied restart token.
pub const RESTART_TOKEN_ANNOTATION: &str = "healing.5dlabs.ai/restart-token";
/// Object annotation carrying the last action token that changed the target.
pub const ACTION_TOKEN_ANNOTATION: &str = "healing.5dlabs.ai/action-token";
/// `<revision>:<controllerrevision>` of the last StatefulSet rollback.
pub const ROLLBACK_SOURCE_ANNOTATION: &str = "healing.5dlabs.ai/rollback-source";
const RESTARTED_AT_ANNOTATION: &str = "healing.5dlabs.ai/restartedAt";
const REVISION_HISTORY_ANNOTATION: &str = "deployment.kubernetes.io/revision-history";
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

pub struct KubeTargetClient {
    client: Client,
}

impl KubeTargetClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// The owned ReplicaSet carrying `revision`, directly or in its history.
    async fn deployment_source(
        &self,
        target: &ResolvedTarget,
        deployment: &Deployment,
        revision: &str,
    ) -> Result<Option<ReplicaSet>, ExecutorError> {
        let selector = deployment
            .spec
            .as_ref()
            .map(|s| selector_string(&s.selector))
            .unwrap_or_default();
        let uid = deployment.uid().unwrap_or_default();

        let replica_sets: Api<ReplicaSet> =
            Api::namespaced(self.client.clone(), &target.namespace);
        let candidates = replica_sets
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| classify(target, e))?;

        Ok(candidates
            .items
            .into_iter()
            .filter(|rs| owned_by(rs.owner_references(), &uid))
            .find(|rs| carries_revision(rs.annotations(), revision)))
    }

    async fn deployment_at_revision(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<bool, ExecutorError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
        let deployment = deployments
            .get(&target.name)
            .await
            .map_err(|e| classify(target, e))?;
        let Some(live) = deployment.spec.as_ref().map(|s| &s.template) else {
            return Ok(false);
        };

        let source = self.deployment_source(target, &deployment, revision).await?;
        Ok(source
            .and_then(|rs| rs.spec)
            .and_then(|s| s.template)
            .is_some_and(|template| same_template(&template, live)))
    }

    async fn rollback_deployment(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<(), ExecutorError> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
        let mut deployment = deployments
            .get(&target.name)
            .await
            .map_err(|e| classify(target, e))?;

        let source = self
            .deployment_source(target, &deployment, revision)
            .await?
            .ok_or_else(|| ExecutorError::RevisionNotFound {
                target: target.to_string(),
                revision: revision.to_string(),
            })?;

        let template = source
            .spec
            .and_then(|s| s.template)
            .map(|t| without_hash(&t))
            .ok_or_else(|| {
                ExecutorError::Fatal(format!(
                    "ReplicaSet for revision {revision} has no pod template"
                ))
            })?;

        let Some(spec) = deployment.spec.as_mut() else {
            return Err(ExecutorError::Fatal(format!("{target} has no spec")));
        };
        spec.template = template;

        // Carries the resourceVersion read above, so a concurrent writer
        // turns this into a 409 and the executor retries from a fresh read.
        deployments
            .replace(&target.name, &PostParams::default(), &deployment)
            .await
            .map_err(|e| classify(target, e))?;

        info!(target = %target, revision, "Deployment rolled back");
        Ok(())
    }

    /// The owned ControllerRevision for `revision`, following the recorded
    /// rollback source once the number has been reassigned.
    async fn statefulset_source(
        &self,
        target: &ResolvedTarget,
        sts: &StatefulSet,
        revision: &str,
    ) -> Result<Option<ControllerRevision>, ExecutorError> {
        let selector = sts
            .spec
            .as_ref()
            .map(|s| selector_string(&s.selector))
            .unwrap_or_default();
        let uid = sts.uid().unwrap_or_default();
        let wanted: Option<i64> = revision.parse().ok();
        let alias = rollback_source(sts.annotations(), revision);

        let revisions: Api<ControllerRevision> =
            Api::namespaced(self.client.clone(), &target.namespace);
        let history = revisions
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| classify(target, e))?;

        let owned: Vec<_> = history
            .items
            .into_iter()
            .filter(|cr| owned_by(cr.owner_references(), &uid))
            .collect();
        let by_number = owned
            .iter()
            .position(|cr| Some(cr.revision) == wanted)
            .or_else(|| owned.iter().position(|cr| Some(cr.name_any()) == alias));
        Ok(by_number.and_then(|i| owned.into_iter().nth(i)))
    }

    async fn statefulset_at_revision(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<bool, ExecutorError> {
        let statefulsets: Api<StatefulSet> =
            Api::namespaced(self.client.clone(), &target.namespace);
        let sts = statefulsets
            .get(&target.name)
            .await
            .map_err(|e| classify(target, e))?;
        let update_revision = sts.status.as_ref().and_then(|s| s.update_revision.clone());

        let source = self.statefulset_source(target, &sts, revision).await?;
        Ok(source.is_some_and(|cr| Some(cr.name_any()) == update_revision))
    }

    async fn rollback_statefulset(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<(), ExecutorError> {
        let statefulsets: Api<StatefulSet> =
            Api::namespaced(self.client.clone(), &target.namespace);
        let sts = statefulsets
            .get(&target.name)
            .await
            .map_err(|e| classify(target, e))?;

        let source = self
            .statefulset_source(target, &sts, revision)
            .await?
            .ok_or_else(|| ExecutorError::RevisionNotFound {
                target: target.to_string(),
                revision: revision.to_string(),
            })?;
        let source_name = source.name_any();
        let mut patch = source
            .data
            .map(|data| data.0)
            .ok_or_else(|| ExecutorError::RevisionNotFound {
                target: target.to_string(),
                revision: revision.to_string(),
            })?;
        if let Some(fields) = patch.as_object_mut() {
            fields.insert(
                "metadata".to_string(),
                json!({
                    "annotations": {
                        ROLLBACK_SOURCE_ANNOTATION: format!("{revision}:{source_name}")
                    }
                }),
            );
        }

        statefulsets
            .patch(&target.name, &PatchParams::default(), &Patch::Strategic(patch))
            .await
            .map_err(|e| classify(target, e))?;

        info!(target = %target, revision, "StatefulSet rolled back");
        Ok(())
    }

    async fn template_annotation(
        &self,
        target: &ResolvedTarget,
        key: &str,
    ) -> Result<Option<String>, ExecutorError> {
        let template = match target.kind {
            TargetKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                api.get(&target.name)
                    .await
                    .map_err(|e| classify(target, e))?
                    .spec
                    .map(|s| s.template)
            }
            TargetKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                api.get(&target.name)
                    .await
                    .map_err(|e| classify(target, e))?
                    .spec
                    .map(|s| s.template)
            }
        };

        Ok(template
            .and_then(|t| t.metadata)
            .and_then(|m| m.annotations)
            .and_then(|a| a.get(key).cloned()))
    }

    /// Desired replicas and the last action token stamped on the object.
    async fn scale_state(
        &self,
        target: &ResolvedTarget,
    ) -> Result<(Option<i32>, Option<String>), ExecutorError> {
        let token = |annotations: &BTreeMap<String, String>| {
            annotations.get(ACTION_TOKEN_ANNOTATION).cloned()
        };
        Ok(match target.kind {
            TargetKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                let deployment = api.get(&target.name).await.map_err(|e| classify(target, e))?;
                (
                    deployment.spec.as_ref().and_then(|s| s.replicas),
                    token(deployment.annotations()),
                )
            }
            TargetKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                let sts = api.get(&target.name).await.map_err(|e| classify(target, e))?;
                (sts.spec.as_ref().and_then(|s| s.replicas), token(sts.annotations()))
            }
        })
    }

    async fn merge_patch(
        &self,
        target: &ResolvedTarget,
        patch: serde_json::Value,
    ) -> Result<(), ExecutorError> {
        let params = PatchParams::default();
        match target.kind {
            TargetKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                api.patch(&target.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| classify(target, e))?;
            }
            TargetKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                api.patch(&target.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| classify(target, e))?;
            }
        }
        Ok(())
    }
}

/// Map API errors onto retry classes.
fn classify(target: &ResolvedTarget, err: kube::Error) -> ExecutorError {
    match err {
        kube::Error::Api(e) if e.code == 404 => ExecutorError::NotFound(target.to_string()),
        kube::Error::Api(e) if e.code == 409 => ExecutorError::Conflict(target.to_string()),
        kube::Error::Api(e) if e.code == 429 || e.code >= 500 => {
            ExecutorError::Transient(format!("{}: {}", e.code, e.message))
        }
        kube::Error::Api(e) => ExecutorError::Fatal(format!("{}: {}", e.code, e.message)),
        other => ExecutorError::Transient(other.to_string()),
    }
}

fn selector_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}

fn owned_by(owners: &[OwnerReference], uid: &str) -> bool {
    uid.is_empty() || owners.iter().any(|o| o.uid == uid)
}

fn without_hash(template: &PodTemplateSpec) -> PodTemplateSpec {
    let mut template = template.clone();
    if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
        labels.remove(POD_TEMPLATE_HASH_LABEL);
    }
    template
}

/// Template equality ignoring the ReplicaSet's `pod-template-hash` label.
fn same_template(a: &PodTemplateSpec, b: &PodTemplateSpec) -> bool {
    without_hash(a) == without_hash(b)
}

/// ControllerRevision name recorded for `revision` by an earlier rollback.
fn rollback_source(annotations: &BTreeMap<String, String>, revision: &str) -> Option<String> {
    let (from, name) = annotations.get(ROLLBACK_SOURCE_ANNOTATION)?.split_once(':')?;
    (from == revision).then(|| name.to_string())
}

fn carries_revision(annotations: &BTreeMap<String, String>, revision: &str) -> bool {
    annotations.get(REVISION_ANNOTATION).map(String::as_str) == Some(revision)
        || annotations
            .get(REVISION_HISTORY_ANNOTATION)
            .is_some_and(|history| history.split(',').any(|r| r.trim() == revision))
}

#[async_trait]
impl TargetClient for KubeTargetClient {
    async fn current_revision(
        &self,
        target: &ResolvedTarget,
    ) -> Result<Option<String>, ExecutorError> {
        current_revision(&self.client, target)
            .await
            .map_err(|e| classify(target, e))
    }

    async fn is_at_revision(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<bool, ExecutorError> {
        match target.kind {
            TargetKind::Deployment => self.deployment_at_revision(target, revision).await,
            TargetKind::StatefulSet => self.statefulset_at_revision(target, revision).await,
        }
    }

    async fn rollback_to(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<(), ExecutorError> {
        match target.kind {
            TargetKind::Deployment => self.rollback_deployment(target, revision).await,
            TargetKind::StatefulSet => self.rollback_statefulset(target, revision).await,
        }
    }

    async fn restart(&self, target: &ResolvedTarget, token: &str) -> Result<Effect, ExecutorError> {
        if self
            .template_annotation(target, RESTART_TOKEN_ANNOTATION)
            .await?
            .as_deref()
            == Some(token)
        {
            debug!(target = %target, token, "Restart already applied");
            return Ok(Effect::Replayed);
        }

        let annotations = BTreeMap::from([
            (RESTART_TOKEN_ANNOTATION, token.to_string()),
            (RESTARTED_AT_ANNOTATION, chrono::Utc::now().to_rfc3339()),
        ]);
        let patch = json!({
            "spec": { "template": { "metadata": { "annotations": annotations } } }
        });
        self.merge_patch(target, patch).await?;
        info!(target = %target, token, "Rolling restart triggered");
        Ok(Effect::Changed)
    }

    async fn scale(
        &self,
        target: &ResolvedTarget,
        replicas: i32,
        token: &str,
    ) -> Result<Effect, ExecutorError> {
        let (current, last_token) = self.scale_state(target).await?;
        if current == Some(replicas) {
            return Ok(if last_token.as_deref() == Some(token) {
                Effect::Replayed
            } else {
                Effect::Unchanged
            });
        }

        let patch = json!({
            "metadata": { "annotations": { ACTION_TOKEN_ANNOTATION: token } },
            "spec": { "replicas": replicas }
        });
        self.merge_patch(target, patch).await?;
        info!(target = %target, replicas, token, "Target scaled");
        Ok(Effect::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_matching_reads_history() {
        let mut annotations = BTreeMap::new();
        annotations.insert(REVISION_ANNOTATION.to_string(), "7".to_string());
        annotations.insert(REVISION_HISTORY_ANNOTATION.to_string(), "2,4".to_string());

        assert!(carries_revision(&annotations, "7"));
        assert!(carries_revision(&annotations, "4"));
        assert!(!carries_revision(&annotations, "3"));
    }

    fn template(image: &str, hash: Option<&str>) -> PodTemplateSpec {
        let mut labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        if let Some(hash) = hash {
            labels.insert(POD_TEMPLATE_HASH_LABEL.to_string(), hash.to_string());
        }
        serde_json::from_value(json!({
            "metadata": { "labels": labels },
            "spec": { "containers": [{ "name": "web", "image": image }] }
        }))
        .unwrap()
    }

    #[test]
    fn test_template_comparison_ignores_hash_label() {
        let live = template("web:1.4", None);
        assert!(same_template(&template("web:1.4", Some("5d7f9")), &live));
        assert!(!same_template(&template("web:1.5", Some("5d7f9")), &live));
    }

    #[test]
    fn test_rollback_source_resolves_reassigned_revision() {
        let annotations = BTreeMap::from([(
            ROLLBACK_SOURCE_ANNOTATION.to_string(),
            "3:db-7c9f6d".to_string(),
        )]);
        assert_eq!(rollback_source(&annotations, "3").as_deref(), Some("db-7c9f6d"));
        assert_eq!(rollback_source(&annotations, "4"), None);
        assert_eq!(rollback_source(&BTreeMap::new(), "3"), None);
    }

    #[test]
    fn test_selector_string() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([
                ("app".to_string(), "web".to_string()),
                ("tier".to_string(), "frontend".to_string()),
            ])),
            ..Default::default()
        };
        assert_eq!(selector_string(&selector), "app=web,tier=frontend");
    }

    #[test]
    fn test_ownership_filter() {
        let owner = OwnerReference {
            uid: "abc".to_string(),
            ..Default::default()
        };
        assert!(owned_by(&[owner.clone()], "abc"));
        assert!(!owned_by(&[owner], "xyz"));
    }
}
