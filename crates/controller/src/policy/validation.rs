//! Write-time validation of `RollbackPolicy` objects.

use std::collections::HashSet;
use std::str::FromStr;
use thiserror::Error;

use crate::crds::{RollbackPolicy, RollbackPolicySpec, MIN_CHECK_INTERVAL_SECS};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("checkInterval must be at least {min}s, got {interval}s")]
    CheckIntervalTooShort { interval: u64, min: u64 },

    #[error("targetRef.name must not be empty")]
    EmptyTargetName,

    #[error("policy must declare at least one condition or metric")]
    NoGuards,

    #[error("metrics[{index}].name must not be empty")]
    EmptyMetricName { index: usize },

    #[error("metric '{name}' is declared more than once")]
    DuplicateMetric { name: String },

    #[error("metric '{name}' threshold must be a finite number")]
    InvalidThreshold { name: String },

    #[error("invalid condition value '{value}': {reason}")]
    InvalidConditionValue { value: String, reason: String },

    #[error("rollbackToRevision must not be empty")]
    EmptyRevision,

    #[error("invalid remediation: {0}")]
    Remediation(String),

    #[error("target {target} is already guarded by policy {existing}")]
    DuplicateTarget { target: String, existing: String },
}

/// Parsed condition threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConditionValue {
    /// Absolute replica count
    Count(u32),
    /// Percentage of the live `specReplicas`
    Percent(f64),
}

impl ConditionValue {
    /// Threshold in replicas for the given desired replica count.
    pub fn resolve(&self, spec_replicas: i32) -> f64 {
        match self {
            Self::Count(n) => f64::from(*n),
            Self::Percent(pct) => pct / 100.0 * f64::from(spec_replicas.max(0)),
        }
    }
}

impl FromStr for ConditionValue {
    type Err = ValidationError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ValidationError::InvalidConditionValue {
            value: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(invalid("value is empty"));
        }

        if let Some(pct) = trimmed.strip_suffix('%') {
            let pct: f64 = pct
                .trim()
                .parse()
                .map_err(|_| invalid("percentage is not a number"))?;
            if !pct.is_finite() || pct < 0.0 {
                return Err(invalid("percentage must be a non-negative number"));
            }
            return Ok(Self::Percent(pct));
        }

        trimmed
            .parse::<u32>()
            .map(Self::Count)
            .map_err(|_| invalid("expected a non-negative integer or a percentage like \"80%\""))
    }
}

/// Validate a spec in isolation.
pub fn validate_spec(spec: &RollbackPolicySpec) -> Result<(), ValidationError> {
    if spec.check_interval < MIN_CHECK_INTERVAL_SECS {
        return Err(ValidationError::CheckIntervalTooShort {
            interval: spec.check_interval,
            min: MIN_CHECK_INTERVAL_SECS,
        });
    }

    if spec.target_ref.name.trim().is_empty() {
        return Err(ValidationError::EmptyTargetName);
    }

    if spec.conditions.is_empty() && spec.metrics.is_empty() {
        return Err(ValidationError::NoGuards);
    }

    let mut seen = HashSet::new();
    for (index, metric) in spec.metrics.iter().enumerate() {
        if metric.name.trim().is_empty() {
            return Err(ValidationError::EmptyMetricName { index });
        }
        if !seen.insert(metric.name.as_str()) {
            return Err(ValidationError::DuplicateMetric {
                name: metric.name.clone(),
            });
        }
        if !metric.threshold.is_finite() {
            return Err(ValidationError::InvalidThreshold {
                name: metric.name.clone(),
            });
        }
    }

    for condition in &spec.conditions {
        condition.value.parse::<ConditionValue>()?;
    }

    if let Some(revision) = &spec.rollback_to_revision {
        if revision.trim().is_empty() {
            return Err(ValidationError::EmptyRevision);
        }
    }

    if let Some(remediation) = &spec.remediation {
        if remediation.handler.trim().is_empty() {
            return Err(ValidationError::Remediation(
                "handler must not be empty".to_string(),
            ));
        }
    }

    Ok(())
}

/// Reject a policy whose resolved target is already guarded by another live policy.
pub fn check_duplicate_target(
    policy: &RollbackPolicy,
    existing: &[RollbackPolicy],
) -> Result<(), ValidationError> {
    let key = policy.key();
    let target = policy.target();

    match existing
        .iter()
        .find(|other| other.key() != key && other.target() == target)
    {
        Some(other) => Err(ValidationError::DuplicateTarget {
            target: target.to_string(),
            existing: other.key().to_string(),
        }),
        None => Ok(()),
    }
}

/// Full write-time validation: spec checks plus the one-policy-per-target rule.
pub fn validate_policy(
    policy: &RollbackPolicy,
    existing: &[RollbackPolicy],
) -> Result<(), ValidationError> {
    validate_spec(&policy.spec)?;
    check_duplicate_target(policy, existing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{
        ConditionOperator, ConditionSpec, ConditionType, MetricSpec, MetricType, TargetKind,
        TargetRef,
    };

    fn spec() -> RollbackPolicySpec {
        RollbackPolicySpec {
            target_ref: TargetRef {
                api_kind: TargetKind::Deployment,
                name: "web".to_string(),
                namespace: None,
            },
            metrics: vec![],
            conditions: vec![ConditionSpec {
                condition_type: ConditionType::AvailableReplicas,
                operator: ConditionOperator::LessThan,
                value: "80%".to_string(),
            }],
            check_interval: 60,
            rollback_to_revision: Some("3".to_string()),
            remediation: None,
        }
    }

    fn policy(ns: &str, name: &str, spec: RollbackPolicySpec) -> RollbackPolicy {
        let mut p = RollbackPolicy::new(name, spec);
        p.metadata.namespace = Some(ns.to_string());
        p
    }

    #[test]
    fn test_condition_values() {
        assert_eq!("3".parse::<ConditionValue>(), Ok(ConditionValue::Count(3)));
        assert_eq!(
            " 80% ".parse::<ConditionValue>(),
            Ok(ConditionValue::Percent(80.0))
        );
        assert!("-1".parse::<ConditionValue>().is_err());
        assert!("abc%".parse::<ConditionValue>().is_err());
        assert!("".parse::<ConditionValue>().is_err());
        assert!((ConditionValue::Percent(80.0).resolve(10) - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_valid_spec_passes() {
        assert_eq!(validate_spec(&spec()), Ok(()));
    }

    #[test]
    fn test_check_interval_floor() {
        let mut s = spec();
        s.check_interval = 29;
        assert_eq!(
            validate_spec(&s),
            Err(ValidationError::CheckIntervalTooShort {
                interval: 29,
                min: 30
            })
        );
        s.check_interval = 30;
        assert!(validate_spec(&s).is_ok());
    }

    #[test]
    fn test_requires_a_guard() {
        let mut s = spec();
        s.conditions.clear();
        assert_eq!(validate_spec(&s), Err(ValidationError::NoGuards));
    }

    #[test]
    fn test_rejects_duplicate_metric_names() {
        let mut s = spec();
        let metric = MetricSpec {
            name: "cpu".to_string(),
            metric_type: MetricType::Utilization,
            threshold: 90.0,
            direction: None,
        };
        s.metrics = vec![metric.clone(), metric];
        assert!(matches!(
            validate_spec(&s),
            Err(ValidationError::DuplicateMetric { .. })
        ));
    }

    #[test]
    fn test_duplicate_target_rejected_across_policies() {
        let existing = vec![policy("prod", "web-guard", spec())];
        let newcomer = policy("prod", "web-guard-2", spec());
        assert!(matches!(
            check_duplicate_target(&newcomer, &existing),
            Err(ValidationError::DuplicateTarget { .. })
        ));

        // Updating the same policy is not a duplicate.
        let same = policy("prod", "web-guard", spec());
        assert!(check_duplicate_target(&same, &existing).is_ok());

        // Same name in another namespace is a different target.
        let other_ns = policy("staging", "web-guard", spec());
        assert!(validate_policy(&other_ns, &existing).is_ok());
    }
}
