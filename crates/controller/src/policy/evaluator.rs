//! Pure condition evaluator.
//!
//! Given a policy spec, a point-in-time target status and the sampled
//! metrics, decide whether the target is in breach. Conditions and metrics
//! are evaluated independently and OR-ed together; a metric without a
//! sample is carried as evidence but never breaches on its own.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

use super::validation::{ConditionValue, ValidationError};
use crate::crds::{ConditionOperator, ConditionType, Direction, RollbackPolicySpec};
use crate::types::PolicyKey;

/// Point-in-time view of a guarded workload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetStatus {
    pub spec_replicas: i32,
    pub available_replicas: i32,
    pub unavailable_replicas: i32,
    pub current_revision: Option<String>,
}

impl TargetStatus {
    fn read(&self, condition: ConditionType) -> i32 {
        match condition {
            ConditionType::AvailableReplicas => self.available_replicas,
            ConditionType::UnavailableReplicas => self.unavailable_replicas,
        }
    }
}

/// Sampled metric values keyed by metric name. `None` means no sample.
pub type LiveMetrics = BTreeMap<String, Option<f64>>;

/// One piece of evidence produced by the evaluator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Reason {
    Condition {
        condition: ConditionType,
        operator: ConditionOperator,
        observed: i32,
        threshold: f64,
    },
    Metric {
        name: String,
        observed: f64,
        threshold: f64,
        direction: Direction,
    },
    MissingMetric {
        name: String,
    },
}

impl Reason {
    pub fn is_breach(&self) -> bool {
        !matches!(self, Self::MissingMetric { .. })
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Condition {
                condition,
                operator,
                observed,
                threshold,
            } => write!(f, "{condition:?} {observed} {operator:?} {threshold}"),
            Self::Metric {
                name,
                observed,
                threshold,
                direction,
            } => write!(f, "metric {name}={observed} {direction:?} {threshold}"),
            Self::MissingMetric { name } => write!(f, "metric {name} has no sample"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Verdict {
    pub breach: bool,
    /// Conditions first, then metrics, each in declaration order.
    pub reasons: Vec<Reason>,
}

impl Verdict {
    pub fn breaches(&self) -> impl Iterator<Item = &Reason> {
        self.reasons.iter().filter(|r| r.is_breach())
    }

    pub fn missing_metrics(&self) -> impl Iterator<Item = &str> {
        self.reasons.iter().filter_map(|r| match r {
            Reason::MissingMetric { name } => Some(name.as_str()),
            _ => None,
        })
    }
}

/// Evaluate a policy against live state.
pub fn evaluate(
    spec: &RollbackPolicySpec,
    status: &TargetStatus,
    metrics: &LiveMetrics,
) -> Result<Verdict, ValidationError> {
    let mut reasons = Vec::new();

    for condition in &spec.conditions {
        let threshold = condition
            .value
            .parse::<ConditionValue>()?
            .resolve(status.spec_replicas);
        let observed = status.read(condition.condition_type);
        let breached = match condition.operator {
            ConditionOperator::LessThan => f64::from(observed) < threshold,
            ConditionOperator::GreaterThan => f64::from(observed) > threshold,
        };
        if breached {
            reasons.push(Reason::Condition {
                condition: condition.condition_type,
                operator: condition.operator,
                observed,
                threshold,
            });
        }
    }

    for metric in &spec.metrics {
        let Some(observed) = metrics.get(&metric.name).copied().flatten() else {
            reasons.push(Reason::MissingMetric {
                name: metric.name.clone(),
            });
            continue;
        };
        let direction = metric.direction();
        let breached = match direction {
            Direction::Above => observed > metric.threshold,
            Direction::Below => observed < metric.threshold,
        };
        if breached {
            reasons.push(Reason::Metric {
                name: metric.name.clone(),
                observed,
                threshold: metric.threshold,
                direction,
            });
        }
    }

    Ok(Verdict {
        breach: reasons.iter().any(Reason::is_breach),
        reasons,
    })
}

/// Evaluator output bound to a policy and an instant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnosis {
    pub policy_id: String,
    pub timestamp: DateTime<Utc>,
    pub breached_metrics: Vec<String>,
    pub breached_conditions: Vec<String>,
    pub verdict: Verdict,
}

impl Diagnosis {
    pub fn new(key: &PolicyKey, verdict: Verdict) -> Self {
        let mut breached_metrics = Vec::new();
        let mut breached_conditions = Vec::new();
        for reason in verdict.breaches() {
            match reason {
                Reason::Condition { .. } => breached_conditions.push(reason.to_string()),
                Reason::Metric { name, .. } => breached_metrics.push(name.clone()),
                Reason::MissingMetric { .. } => {}
            }
        }
        Self {
            policy_id: key.to_string(),
            timestamp: Utc::now(),
            breached_metrics,
            breached_conditions,
            verdict,
        }
    }

    /// Human-readable reasons, in evaluator order.
    pub fn reasons(&self) -> Vec<String> {
        self.verdict.reasons.iter().map(ToString::to_string).collect()
    }

    /// One-line summary suitable for `lastAppliedMessage`.
    pub fn summary(&self) -> String {
        let breaches: Vec<String> = self.verdict.breaches().map(ToString::to_string).collect();
        let missing: Vec<&str> = self.verdict.missing_metrics().collect();

        let mut summary = if breaches.is_empty() {
            "all guards within thresholds".to_string()
        } else {
            format!("breach: {}", breaches.join("; "))
        };
        if !missing.is_empty() {
            summary.push_str(&format!(" (no sample for {})", missing.join(", ")));
        }
        summary
    }
}
