//! Validating admission for `RollbackPolicy` writes.
//!
//! Rejects what the reconcile loop could not act on: malformed specs,
//! unknown remediation handlers, and a second policy for an already guarded
//! target.

use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::core::DynamicObject;
use tracing::{debug, info, warn};

use crate::crds::RollbackPolicy;
use crate::executor::HandlerRegistry;
use crate::policy::{check_duplicate_target, validate_spec, ValidationError};
use crate::store::PolicyStore;

/// Check `policy` against its spec rules, the handler registry and the
/// policies already stored.
pub fn review_policy(
    policy: &RollbackPolicy,
    existing: &[RollbackPolicy],
    handlers: &HandlerRegistry,
) -> Result<(), ValidationError> {
    validate_spec(&policy.spec)?;

    if policy.spec.rollback_to_revision.is_none() {
        handlers
            .plan(&policy.spec.remediation())
            .map_err(|e| ValidationError::Remediation(e.to_string()))?;
    }

    check_duplicate_target(policy, existing)
}

/// Answer an `AdmissionReview`. Deletes are always allowed; a store that
/// cannot be listed denies the write.
pub async fn admit(
    review: AdmissionReview<RollbackPolicy>,
    store: &dyn PolicyStore,
    handlers: &HandlerRegistry,
) -> AdmissionReview<DynamicObject> {
    let request: AdmissionRequest<RollbackPolicy> = match review.try_into() {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Malformed admission review");
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };

    let response = AdmissionResponse::from(&request);
    if request.operation == Operation::Delete {
        return response.into_review();
    }

    let Some(mut policy) = request.object else {
        return response.deny("request carries no object").into_review();
    };
    if policy.metadata.namespace.is_none() {
        policy.metadata.namespace.clone_from(&request.namespace);
    }

    let existing = match store.list().await {
        Ok(existing) => existing,
        Err(e) => {
            warn!(error = %e, "Cannot list policies for admission");
            return response
                .deny(format!("unable to check existing policies: {e}"))
                .into_review();
        }
    };

    match review_policy(&policy, &existing, handlers) {
        Ok(()) => {
            debug!(policy = %policy.key(), operation = ?request.operation, "Policy admitted");
            response.into_review()
        }
        Err(e) => {
            info!(policy = %policy.key(), reason = %e, "Policy rejected");
            response.deny(e.to_string()).into_review()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{RemediationSpec, RollbackPolicySpec};
    use crate::store::MemoryPolicyStore;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn policy(name: &str, target: &str) -> RollbackPolicy {
        let spec: RollbackPolicySpec = serde_json::from_value(json!({
            "targetRef": { "apiKind": "Deployment", "name": target },
            "conditions": [
                { "type": "AvailableReplicas", "operator": "LessThan", "value": "80%" }
            ],
            "checkInterval": 60,
            "rollbackToRevision": "3"
        }))
        .unwrap();
        let mut p = RollbackPolicy::new(name, spec);
        p.metadata.namespace = Some("prod".to_string());
        p
    }

    fn review(operation: &str, object: Option<&RollbackPolicy>) -> AdmissionReview<RollbackPolicy> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
                "kind": { "group": "healing.5dlabs.ai", "version": "v1alpha1", "kind": "RollbackPolicy" },
                "resource": { "group": "healing.5dlabs.ai", "version": "v1alpha1", "resource": "rollbackpolicies" },
                "name": "web-guard",
                "namespace": "prod",
                "operation": operation,
                "userInfo": { "username": "admin" },
                "object": object,
                "oldObject": null,
                "dryRun": false
            }
        }))
        .unwrap()
    }

    fn allowed(review: &AdmissionReview<DynamicObject>) -> bool {
        review.response.as_ref().is_some_and(|r| r.allowed)
    }

    #[test]
    fn test_review_rejects_unknown_handler() {
        let mut p = policy("web-guard", "web");
        p.spec.rollback_to_revision = None;
        p.spec.remediation = Some(RemediationSpec {
            handler: "reboot-node".to_string(),
            params: BTreeMap::new(),
        });

        let err = review_policy(&p, &[], &HandlerRegistry::with_builtins()).unwrap_err();
        assert!(matches!(err, ValidationError::Remediation(_)));
    }

    #[test]
    fn test_review_ignores_handler_when_rolling_back() {
        let mut p = policy("web-guard", "web");
        p.spec.remediation = Some(RemediationSpec {
            handler: "reboot-node".to_string(),
            params: BTreeMap::new(),
        });

        assert!(review_policy(&p, &[], &HandlerRegistry::with_builtins()).is_ok());
    }

    #[tokio::test]
    async fn test_admit_allows_valid_policy() {
        let store = MemoryPolicyStore::new();
        let p = policy("web-guard", "web");

        let handlers = HandlerRegistry::with_builtins();
        let out = admit(review("CREATE", Some(&p)), &store, &handlers).await;
        assert!(allowed(&out));
    }

    #[tokio::test]
    async fn test_admit_denies_duplicate_target() {
        let store = MemoryPolicyStore::new();
        store.create(policy("first", "web")).await.unwrap();

        let out = admit(
            review("CREATE", Some(&policy("second", "web"))),
            &store,
            &HandlerRegistry::with_builtins(),
        )
        .await;

        assert!(!allowed(&out));
        let message = out.response.unwrap().result.message;
        assert!(message.contains("prod/first"), "{message}");
    }

    #[tokio::test]
    async fn test_admit_denies_short_interval() {
        let store = MemoryPolicyStore::new();
        let mut p = policy("web-guard", "web");
        p.spec.check_interval = 10;

        let handlers = HandlerRegistry::with_builtins();
        let out = admit(review("UPDATE", Some(&p)), &store, &handlers).await;
        assert!(!allowed(&out));
    }

    #[tokio::test]
    async fn test_admit_allows_delete() {
        let store = MemoryPolicyStore::new();
        let out = admit(review("DELETE", None), &store, &HandlerRegistry::with_builtins()).await;
        assert!(allowed(&out));
    }
}
