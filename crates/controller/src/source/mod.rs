//! Live status and metric sources for guarded workloads.

pub mod kubernetes;
pub mod memory;
pub mod prometheus;

use async_trait::async_trait;
use thiserror::Error;

use crate::policy::TargetStatus;
use crate::types::ResolvedTarget;

pub use kubernetes::KubeStatusSource;
pub use memory::InMemoryCluster;
pub use prometheus::{PrometheusConfig, PrometheusSource};

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Target {0} not found")]
    NotFound(String),

    #[error("Transient failure reading {target}: {reason}")]
    Transient { target: String, reason: String },

    #[error("Unusable data for {target}: {reason}")]
    Malformed { target: String, reason: String },
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub(crate) fn transient(target: &ResolvedTarget, reason: impl ToString) -> Self {
        Self::Transient {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn malformed(target: &ResolvedTarget, reason: impl ToString) -> Self {
        Self::Malformed {
            target: target.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn get_status(&self, target: &ResolvedTarget) -> Result<TargetStatus, SourceError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Latest sample for `name`, or `None` when the source has no data.
    async fn get_metric(
        &self,
        target: &ResolvedTarget,
        name: &str,
    ) -> Result<Option<f64>, SourceError>;
}

/// Metric source used when no metrics backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMetrics;

#[async_trait]
impl MetricSource for NoMetrics {
    async fn get_metric(
        &self,
        _target: &ResolvedTarget,
        _name: &str,
    ) -> Result<Option<f64>, SourceError> {
        Ok(None)
    }
}
