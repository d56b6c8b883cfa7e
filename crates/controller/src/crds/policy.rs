//! `RollbackPolicy` Custom Resource Definition for closed-loop remediation

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{PolicyKey, ResolvedTarget};

/// Minimum allowed `checkInterval`, in seconds.
pub const MIN_CHECK_INTERVAL_SECS: u64 = 30;

/// Number of transitions retained in `status.history`.
pub const HISTORY_LIMIT: usize = 20;

/// Default function for `check_interval` field
fn default_check_interval() -> u64 {
    60
}

/// Default function for `remediation.handler` field
fn default_handler() -> String {
    "restart".to_string()
}

/// Workload kinds a policy can guard.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
pub enum TargetKind {
    Deployment,
    StatefulSet,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deployment => f.write_str("Deployment"),
            Self::StatefulSet => f.write_str("StatefulSet"),
        }
    }
}

/// Reference to the guarded workload
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    /// Kind of the workload (Deployment or StatefulSet)
    pub api_kind: TargetKind,

    /// Name of the workload
    pub name: String,

    /// Namespace of the workload; defaults to the policy's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// How a metric threshold is interpreted
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum MetricType {
    /// Resource utilization percentage; breach when above the threshold
    Utilization,
    /// Custom metric compared against a numeric threshold
    Value,
}

/// Direction in which a metric is considered to worsen
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Direction {
    #[default]
    Above,
    Below,
}

/// A metric guard
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricSpec {
    /// Metric name as understood by the metric source
    pub name: String,

    #[serde(rename = "type")]
    pub metric_type: MetricType,

    /// Breach threshold (percentage for `Utilization`)
    #[serde(alias = "averageUtilization")]
    pub threshold: f64,

    /// Worsening direction. Ignored for `Utilization`, which always breaches above.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl MetricSpec {
    /// Effective breach direction.
    pub fn direction(&self) -> Direction {
        match self.metric_type {
            MetricType::Utilization => Direction::Above,
            MetricType::Value => self.direction.unwrap_or_default(),
        }
    }
}

/// Replica signal a condition reads
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    AvailableReplicas,
    UnavailableReplicas,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionOperator {
    LessThan,
    GreaterThan,
}

/// A replica-count guard
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConditionSpec {
    #[serde(rename = "type")]
    pub condition_type: ConditionType,

    pub operator: ConditionOperator,

    /// Integer (`"3"`) or percentage of spec replicas (`"80%"`)
    pub value: String,
}

/// Named remediation handler with free-form parameters
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemediationSpec {
    /// Registered handler name: `restart` (default), `scale`, or a custom handler
    #[serde(default = "default_handler")]
    pub handler: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, String>,
}

impl Default for RemediationSpec {
    fn default() -> Self {
        Self {
            handler: default_handler(),
            params: BTreeMap::new(),
        }
    }
}

/// `RollbackPolicy` CRD: guards a workload and rolls it back or remediates it on breach
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(group = "healing.5dlabs.ai", version = "v1alpha1", kind = "RollbackPolicy")]
#[kube(namespaced)]
#[kube(status = "RollbackPolicyStatus")]
#[kube(shortname = "rbp")]
#[kube(printcolumn = r#"{"name":"Kind","type":"string","jsonPath":".spec.targetRef.apiKind"}"#)]
#[kube(printcolumn = r#"{"name":"Target","type":"string","jsonPath":".spec.targetRef.name"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastAppliedStatus"}"#)]
#[kube(printcolumn = r#"{"name":"Applied","type":"integer","jsonPath":".status.appliedCount"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPolicySpec {
    pub target_ref: TargetRef,

    #[serde(default)]
    pub metrics: Vec<MetricSpec>,

    #[serde(default)]
    pub conditions: Vec<ConditionSpec>,

    /// Seconds between evaluations, at least 30
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Revision to converge to on breach. Absent means remediate instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_to_revision: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation: Option<RemediationSpec>,
}

impl RollbackPolicySpec {
    /// Resolve the target, defaulting its namespace to the policy's.
    pub fn resolve_target(&self, policy_namespace: &str) -> ResolvedTarget {
        ResolvedTarget {
            kind: self.target_ref.api_kind,
            namespace: self
                .target_ref
                .namespace
                .clone()
                .filter(|ns| !ns.is_empty())
                .unwrap_or_else(|| policy_namespace.to_string()),
            name: self.target_ref.name.clone(),
        }
    }

    pub fn check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.check_interval.max(MIN_CHECK_INTERVAL_SECS))
    }

    /// Remediation to use when no rollback revision is set.
    pub fn remediation(&self) -> RemediationSpec {
        self.remediation.clone().unwrap_or_default()
    }
}

impl RollbackPolicy {
    pub fn key(&self) -> PolicyKey {
        PolicyKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn target(&self) -> ResolvedTarget {
        self.spec
            .resolve_target(&self.namespace().unwrap_or_default())
    }
}

/// Outcome recorded by the most recent persisted reconcile
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum AppliedStatus {
    NoActionNeeded,
    RolledBack,
    Remediated,
    Failed,
    /// Reported by the executor while another action is in flight; never persisted
    Busy,
    Degraded,
}

impl AppliedStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoActionNeeded => "NoActionNeeded",
            Self::RolledBack => "RolledBack",
            Self::Remediated => "Remediated",
            Self::Failed => "Failed",
            Self::Busy => "Busy",
            Self::Degraded => "Degraded",
        }
    }
}

impl fmt::Display for AppliedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status transition in the audit trail
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    /// RFC3339 time of the transition
    pub time: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<AppliedStatus>,

    pub to: AppliedStatus,

    /// `Rollback`, `Remediate`, or `None` for observation-only transitions
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,

    #[serde(default)]
    pub message: String,
}

/// Status of the `RollbackPolicy`, written only by the reconciler
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackPolicyStatus {
    /// RFC3339 time of the last persisted reconcile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_status: Option<AppliedStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_message: Option<String>,

    /// Number of actions that took effect; never decreases
    #[serde(default)]
    pub applied_count: u64,

    #[serde(default)]
    pub monitored_resources: Vec<String>,

    /// Last observed revision per target
    #[serde(default)]
    pub current_revisions: BTreeMap<String, String>,

    /// Revision each target was last rolled back to
    #[serde(default)]
    pub rollback_revisions: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

impl RollbackPolicyStatus {
    /// Append a transition, keeping only the newest `HISTORY_LIMIT` entries.
    pub fn push_history(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
        if self.history.len() > HISTORY_LIMIT {
            let excess = self.history.len() - HISTORY_LIMIT;
            self.history.drain(..excess);
        }
    }

    /// Parsed `lastAppliedTime`, if present and well-formed.
    pub fn last_applied(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.last_applied_time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&chrono::Utc))
    }
}
