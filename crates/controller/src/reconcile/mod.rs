//! Per-policy reconcile cycle.
//!
//! One cycle reads the policy, observes the target, evaluates guards, runs at
//! most one action and persists the resulting status with a
//! `resourceVersion` compare-and-swap. A lost swap re-runs the whole cycle
//! against the fresh object.

mod status;

use chrono::Utc;
use kube::ResourceExt;
use notify::NotifyEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::crds::{AppliedStatus, RollbackPolicy, RollbackPolicyStatus};
use crate::executor::{Action, ActionKind, Outcome, OutcomeKind};
use crate::policy::{evaluate, validate_spec, Diagnosis, LiveMetrics, ValidationError};
use crate::store::StoreError;
use crate::types::{Context, Error, PolicyKey, ResolvedTarget, Result};

use status::{next_status, Transition};

/// Result of a single reconcile cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Status the policy carries after the cycle
    pub status: Option<AppliedStatus>,
    pub outcome: Option<OutcomeKind>,
    pub wrote_status: bool,
    /// `None` once the policy no longer exists
    pub requeue_after: Option<Duration>,
}

impl Cycle {
    fn gone() -> Self {
        Self {
            status: None,
            outcome: None,
            wrote_status: false,
            requeue_after: None,
        }
    }
}

/// Run one cycle for `key` under the configured deadline.
///
/// Expiry drops the cycle before its status write, so nothing partial is
/// committed.
#[instrument(skip(ctx), fields(policy = %key))]
pub async fn reconcile_policy(key: &PolicyKey, ctx: &Context) -> Result<Cycle> {
    ctx.metrics.record_reconcile();
    let deadline = ctx.config.reconcile.cycle_deadline();

    if let Ok(result) = tokio::time::timeout(deadline, reconcile_with_retries(key, ctx)).await {
        result
    } else {
        ctx.metrics.record_deadline();
        Err(Error::DeadlineExceeded(deadline))
    }
}

/// Log a failed cycle and pick its requeue delay.
pub fn error_policy(key: &PolicyKey, error: &Error, ctx: &Context) -> Duration {
    ctx.metrics.record_error();
    let delay = ctx.next_error_backoff(key);
    warn!(
        policy = %key,
        error = %error,
        transient = error.is_transient(),
        retry_in = ?delay,
        "Reconcile failed"
    );
    delay
}

/// Pull due keys from the scheduler until it closes.
pub async fn run_worker(worker: usize, ctx: Arc<Context>) {
    debug!(worker, "Worker started");
    while let Some(key) = ctx.scheduler.next().await {
        let requeue = match reconcile_policy(&key, &ctx).await {
            Ok(cycle) => {
                ctx.clear_failures(&key);
                cycle.requeue_after
            }
            Err(e) => Some(error_policy(&key, &e, &ctx)),
        };

        match requeue {
            Some(after) => {
                ctx.scheduler.complete(&key, after);
            }
            None => {
                ctx.scheduler.retire(&key);
                ctx.clear_failures(&key);
            }
        }
    }
    debug!(worker, "Worker stopped");
}

async fn reconcile_with_retries(key: &PolicyKey, ctx: &Context) -> Result<Cycle> {
    let retries = ctx.config.reconcile.conflict_retries;
    let mut conflicts = 0;

    loop {
        let Some(policy) = ctx.store.get(key).await? else {
            debug!("Policy no longer exists");
            return Ok(Cycle::gone());
        };

        match run_cycle(&policy, ctx).await {
            Err(Error::Store(StoreError::Conflict(_))) => {
                ctx.metrics.record_conflict();
                conflicts += 1;
                if conflicts > retries {
                    return Err(Error::ConflictRetriesExhausted {
                        key: key.clone(),
                        attempts: conflicts,
                    });
                }
                debug!(conflicts, "Status write lost a race, re-reading policy");
            }
            Err(Error::Store(StoreError::NotFound(_))) => return Ok(Cycle::gone()),
            other => return other,
        }
    }
}

async fn run_cycle(policy: &RollbackPolicy, ctx: &Context) -> Result<Cycle> {
    let spec = &policy.spec;
    let target = policy.target();
    let interval = spec.check_interval();
    let previous = policy.status.clone().unwrap_or_default();

    if let Err(e) = validate_spec(spec) {
        return park_invalid(policy, &previous, &e, ctx).await;
    }

    let live = match ctx.status_source.get_status(&target).await {
        Ok(live) => live,
        Err(e) if e.is_transient() => return Err(e.into()),
        Err(e) => {
            warn!(target_ref = %target, error = %e, "Target unavailable, marking degraded");
            let transition = Transition::observed(AppliedStatus::Degraded, e.to_string(), None);
            let wrote = persist(policy, &previous, &transition, vec![e.to_string()], ctx).await?;
            return Ok(Cycle {
                status: Some(AppliedStatus::Degraded),
                outcome: None,
                wrote_status: wrote,
                requeue_after: Some(interval),
            });
        }
    };

    let metrics = fetch_metrics(&target, policy, ctx).await;
    let verdict = match evaluate(spec, &live, &metrics) {
        Ok(verdict) => verdict,
        Err(e) => return park_invalid(policy, &previous, &e, ctx).await,
    };
    let diagnosis = Diagnosis::new(&policy.key(), verdict);

    info!(
        target: "audit",
        policy = %diagnosis.policy_id,
        target_ref = %target,
        breach = diagnosis.verdict.breach,
        breached_metrics = ?diagnosis.breached_metrics,
        breached_conditions = ?diagnosis.breached_conditions,
        "Policy evaluated"
    );

    if !diagnosis.verdict.breach {
        let transition = Transition::observed(
            AppliedStatus::NoActionNeeded,
            diagnosis.summary(),
            live.current_revision.clone(),
        );
        let wrote = persist(policy, &previous, &transition, diagnosis.reasons(), ctx).await?;
        return Ok(Cycle {
            status: Some(AppliedStatus::NoActionNeeded),
            outcome: None,
            wrote_status: wrote,
            requeue_after: Some(interval),
        });
    }

    let mut action = build_action(policy, &target, &previous);
    let outcome = ctx.executor.apply(&mut action).await;

    match outcome.kind {
        OutcomeKind::Busy => {
            ctx.metrics.record_busy();
            info!(target_ref = %target, "Another action holds the target, requeueing");
            Ok(Cycle {
                status: previous.last_applied_status,
                outcome: Some(OutcomeKind::Busy),
                wrote_status: false,
                requeue_after: Some(ctx.config.reconcile.busy_requeue()),
            })
        }
        OutcomeKind::Failed => {
            ctx.metrics.record_failed();
            let error = outcome.error.clone().unwrap_or_default();
            ctx.notifier.notify(NotifyEvent::ActionFailed {
                policy_id: policy.key().to_string(),
                target: target.to_string(),
                action: action.kind.to_string(),
                error: error.clone(),
                attempts: outcome.attempts,
                timestamp: Utc::now(),
            });

            let transition = Transition {
                status: AppliedStatus::Failed,
                message: format!(
                    "{} failed after {} attempt(s): {error}",
                    action.kind, outcome.attempts
                ),
                action: Some(action.kind),
                revision: action.target_revision.clone(),
                current_revision: live.current_revision.clone(),
                counts: false,
            };
            let wrote = persist(policy, &previous, &transition, diagnosis.reasons(), ctx).await?;
            Ok(Cycle {
                status: Some(AppliedStatus::Failed),
                outcome: Some(OutcomeKind::Failed),
                wrote_status: wrote,
                requeue_after: Some(interval),
            })
        }
        OutcomeKind::Applied | OutcomeKind::AlreadyConverged => {
            if outcome.kind == OutcomeKind::Applied {
                ctx.metrics.record_applied();
            } else {
                ctx.metrics.record_converged();
            }

            let transition = success_transition(&action, &outcome, &target, &previous, &diagnosis);
            let status = transition.status;
            let wrote = persist(policy, &previous, &transition, diagnosis.reasons(), ctx).await?;
            Ok(Cycle {
                status: Some(status),
                outcome: Some(outcome.kind),
                wrote_status: wrote,
                requeue_after: Some(interval),
            })
        }
    }
}

/// Build this cycle's action. The idempotency key names the action by the
/// count it will produce, so a crashed cycle and its replay share it.
fn build_action(
    policy: &RollbackPolicy,
    target: &ResolvedTarget,
    previous: &RollbackPolicyStatus,
) -> Action {
    let key = policy.key();
    let idempotency_key = format!("{key}-{}", previous.applied_count.saturating_add(1));

    match &policy.spec.rollback_to_revision {
        Some(revision) => Action::rollback(key, target.clone(), revision.clone(), idempotency_key),
        None => Action::remediate(key, target.clone(), policy.spec.remediation(), idempotency_key),
    }
}

fn success_transition(
    action: &Action,
    outcome: &Outcome,
    target: &ResolvedTarget,
    previous: &RollbackPolicyStatus,
    diagnosis: &Diagnosis,
) -> Transition {
    let target_id = target.to_string();
    let converged = outcome.kind == OutcomeKind::AlreadyConverged;
    let handler = action
        .remediation
        .as_ref()
        .map_or("restart", |r| r.handler.as_str());

    // A converged target counts only as the replay of this same action
    // after a lost status write.
    let (status, counts) = match action.kind {
        ActionKind::Rollback => (
            AppliedStatus::RolledBack,
            !converged
                || previous.rollback_revisions.get(&target_id) != action.target_revision.as_ref(),
        ),
        ActionKind::Remediate => (AppliedStatus::Remediated, !converged || outcome.replayed),
    };

    let message = if counts {
        match action.kind {
            ActionKind::Rollback => format!(
                "rolled back {target} to revision {}; {}",
                action.target_revision.as_deref().unwrap_or_default(),
                diagnosis.summary()
            ),
            ActionKind::Remediate => {
                format!("remediated {target} with {handler}; {}", diagnosis.summary())
            }
        }
    } else {
        match (&previous.last_applied_message, previous.last_applied_status) {
            (Some(message), Some(last)) if last == status => message.clone(),
            _ => match action.kind {
                ActionKind::Rollback => format!(
                    "{target} already at revision {}",
                    action.target_revision.as_deref().unwrap_or_default()
                ),
                ActionKind::Remediate => format!("{target} already converged for {handler}"),
            },
        }
    };

    Transition {
        status,
        message,
        action: Some(action.kind),
        revision: outcome.applied_revision.clone(),
        current_revision: outcome.current_revision.clone(),
        counts,
    }
}

async fn fetch_metrics(
    target: &ResolvedTarget,
    policy: &RollbackPolicy,
    ctx: &Context,
) -> LiveMetrics {
    let mut live = LiveMetrics::new();
    for metric in &policy.spec.metrics {
        let sample = match ctx.metric_source.get_metric(target, &metric.name).await {
            Ok(sample) => sample,
            Err(e) => {
                warn!(
                    target_ref = %target,
                    metric = %metric.name,
                    error = %e,
                    "Metric unavailable, treating as missing"
                );
                None
            }
        };
        live.insert(metric.name.clone(), sample);
    }
    live
}

async fn park_invalid(
    policy: &RollbackPolicy,
    previous: &RollbackPolicyStatus,
    error: &ValidationError,
    ctx: &Context,
) -> Result<Cycle> {
    warn!(policy = %policy.key(), error = %error, "Policy is invalid, parking");
    let message = format!("invalid policy: {error}");
    let transition = Transition::observed(AppliedStatus::Failed, message, None);
    let wrote = persist(policy, previous, &transition, vec![error.to_string()], ctx).await?;
    Ok(Cycle {
        status: Some(AppliedStatus::Failed),
        outcome: None,
        wrote_status: wrote,
        requeue_after: Some(policy.spec.check_interval()),
    })
}

/// CAS the next status. Returns whether anything was written.
async fn persist(
    policy: &RollbackPolicy,
    previous: &RollbackPolicyStatus,
    transition: &Transition,
    reasons: Vec<String>,
    ctx: &Context,
) -> Result<bool> {
    let key = policy.key();
    let target = policy.target();
    let Some(next) = next_status(previous, policy, &target, transition, Utc::now()) else {
        return Ok(false);
    };
    let resource_version = policy
        .resource_version()
        .ok_or_else(|| StoreError::MissingResourceVersion(key.clone()))?;

    let applied_count = next.applied_count;
    ctx.store.replace_status(&key, &resource_version, next).await?;
    ctx.metrics.record_status_write();

    info!(
        target: "audit",
        policy = %key,
        target_ref = %target,
        from = ?previous.last_applied_status,
        to = %transition.status,
        action = ?transition.action,
        revision = ?transition.revision,
        applied_count,
        "Status transition recorded"
    );

    ctx.notifier.notify(NotifyEvent::StatusChanged {
        policy_id: key.to_string(),
        target: target.to_string(),
        previous_status: previous.last_applied_status.map(|s| s.to_string()),
        new_status: transition.status.to_string(),
        reasons,
        message: transition.message.clone(),
        timestamp: Utc::now(),
    });

    Ok(true)
}
