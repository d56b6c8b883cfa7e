//! Persistence of `RollbackPolicy` objects.
//!
//! The store is the only shared mutable resource in the controller. Every
//! status write is a compare-and-swap on `metadata.resourceVersion`; a lost
//! race surfaces as [`StoreError::Conflict`] and is never retried blindly.

pub mod kubernetes;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::crds::{RollbackPolicy, RollbackPolicyStatus};
use crate::policy::ValidationError;
use crate::types::PolicyKey;

pub use kubernetes::KubePolicyStore;
pub use memory::MemoryPolicyStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Policy {0} not found")]
    NotFound(PolicyKey),

    #[error("Policy {0} was modified concurrently")]
    Conflict(PolicyKey),

    #[error("Policy {0} already exists")]
    AlreadyExists(PolicyKey),

    #[error("Policy rejected: {0}")]
    Invalid(#[from] ValidationError),

    #[error("Policy {0} has no resourceVersion")]
    MissingResourceVersion(PolicyKey),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Watch stream error: {0}")]
    Watch(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Conflict(_) | Self::Watch(_) => true,
            Self::Kube(kube::Error::Api(e)) => e.code == 429 || e.code >= 500,
            Self::Kube(_) => true,
            _ => false,
        }
    }
}

/// Change notification from [`PolicyStore::watch`].
#[derive(Debug, Clone)]
pub enum PolicyEvent {
    Applied(Box<RollbackPolicy>),
    Deleted(PolicyKey),
}

#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get(&self, key: &PolicyKey) -> Result<Option<RollbackPolicy>, StoreError>;

    async fn list(&self) -> Result<Vec<RollbackPolicy>, StoreError>;

    /// Create a policy, rejecting malformed specs and duplicate targets.
    async fn create(&self, policy: RollbackPolicy) -> Result<RollbackPolicy, StoreError>;

    /// Replace a policy's spec. Honors `resourceVersion` when present.
    async fn update(&self, policy: RollbackPolicy) -> Result<RollbackPolicy, StoreError>;

    async fn delete(&self, key: &PolicyKey) -> Result<(), StoreError>;

    /// Compare-and-swap the status subresource against `resource_version`.
    async fn replace_status(
        &self,
        key: &PolicyKey,
        resource_version: &str,
        status: RollbackPolicyStatus,
    ) -> Result<RollbackPolicy, StoreError>;

    fn watch(&self) -> BoxStream<'static, Result<PolicyEvent, StoreError>>;
}
