//! Reads workload status straight from the Kubernetes API.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ControllerRevision, Deployment, StatefulSet};
use kube::{Api, Client, ResourceExt};
use tracing::debug;

use super::{SourceError, StatusSource};
use crate::crds::TargetKind;
use crate::policy::TargetStatus;
use crate::types::ResolvedTarget;

/// Annotation the deployment controller stamps with the rollout revision.
pub(crate) const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

pub struct KubeStatusSource {
    client: Client,
}

impl KubeStatusSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn classify(target: &ResolvedTarget, err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(e) if e.code == 404 => SourceError::NotFound(target.to_string()),
        kube::Error::Api(e) if e.code == 429 || e.code >= 500 => {
            SourceError::transient(target, e.message)
        }
        kube::Error::Api(e) => SourceError::malformed(target, format!("{}: {}", e.code, e.message)),
        other => SourceError::transient(target, other),
    }
}

/// Revision number of a StatefulSet's `status.currentRevision`.
pub(crate) async fn statefulset_revision(
    client: &Client,
    namespace: &str,
    sts: &StatefulSet,
) -> Result<Option<String>, kube::Error> {
    let Some(name) = sts.status.as_ref().and_then(|s| s.current_revision.clone()) else {
        return Ok(None);
    };
    let revisions: Api<ControllerRevision> = Api::namespaced(client.clone(), namespace);
    Ok(revisions
        .get_opt(&name)
        .await?
        .map(|rev| rev.revision.to_string()))
}

/// Current revision of a workload, or `None` if it has not rolled out yet.
pub(crate) async fn current_revision(
    client: &Client,
    target: &ResolvedTarget,
) -> Result<Option<String>, kube::Error> {
    match target.kind {
        TargetKind::Deployment => {
            let api: Api<Deployment> = Api::namespaced(client.clone(), &target.namespace);
            let deployment = api.get(&target.name).await?;
            Ok(deployment.annotations().get(REVISION_ANNOTATION).cloned())
        }
        TargetKind::StatefulSet => {
            let api: Api<StatefulSet> = Api::namespaced(client.clone(), &target.namespace);
            let sts = api.get(&target.name).await?;
            statefulset_revision(client, &target.namespace, &sts).await
        }
    }
}

#[async_trait]
impl StatusSource for KubeStatusSource {
    async fn get_status(&self, target: &ResolvedTarget) -> Result<TargetStatus, SourceError> {
        let status = match target.kind {
            TargetKind::Deployment => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &target.namespace);
                let deployment = api
                    .get_opt(&target.name)
                    .await
                    .map_err(|e| classify(target, e))?
                    .ok_or_else(|| SourceError::NotFound(target.to_string()))?;

                let spec_replicas = deployment
                    .spec
                    .as_ref()
                    .and_then(|s| s.replicas)
                    .unwrap_or(1);
                let observed = deployment.status.as_ref();
                let available = observed.and_then(|s| s.available_replicas).unwrap_or(0);
                let unavailable = observed
                    .and_then(|s| s.unavailable_replicas)
                    .unwrap_or_else(|| (spec_replicas - available).max(0));

                TargetStatus {
                    spec_replicas,
                    available_replicas: available,
                    unavailable_replicas: unavailable,
                    current_revision: deployment.annotations().get(REVISION_ANNOTATION).cloned(),
                }
            }
            TargetKind::StatefulSet => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &target.namespace);
                let sts = api
                    .get_opt(&target.name)
                    .await
                    .map_err(|e| classify(target, e))?
                    .ok_or_else(|| SourceError::NotFound(target.to_string()))?;

                let spec_replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let available = sts
                    .status
                    .as_ref()
                    .and_then(|s| s.available_replicas)
                    .unwrap_or(0);

                TargetStatus {
                    spec_replicas,
                    available_replicas: available,
                    unavailable_replicas: (spec_replicas - available).max(0),
                    current_revision: statefulset_revision(&self.client, &target.namespace, &sts)
                        .await
                        .map_err(|e| classify(target, e))?,
                }
            }
        };

        debug!(
            target = %target,
            spec = status.spec_replicas,
            available = status.available_replicas,
            revision = ?status.current_revision,
            "Fetched target status"
        );
        Ok(status)
    }
}
