//! Next-status computation for a reconcile cycle.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::crds::{AppliedStatus, HistoryEntry, RollbackPolicy, RollbackPolicyStatus};
use crate::executor::ActionKind;
use crate::types::ResolvedTarget;

/// What a cycle concluded, before it is folded into the stored status.
#[derive(Debug, Clone)]
pub(crate) struct Transition {
    pub status: AppliedStatus,
    pub message: String,
    pub action: Option<ActionKind>,
    /// Revision the action was asked for
    pub revision: Option<String>,
    /// Live revision observed this cycle
    pub current_revision: Option<String>,
    /// Whether this cycle's action counts toward `appliedCount`
    pub counts: bool,
}

impl Transition {
    pub fn observed(
        status: AppliedStatus,
        message: impl Into<String>,
        current_revision: Option<String>,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            action: None,
            revision: None,
            current_revision,
            counts: false,
        }
    }
}

/// Fold `transition` into `previous`. Returns `None` when the stored status
/// would not change, so idle cycles do not write.
pub(crate) fn next_status(
    previous: &RollbackPolicyStatus,
    policy: &RollbackPolicy,
    target: &ResolvedTarget,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Option<RollbackPolicyStatus> {
    let target_id = target.to_string();
    let mut next = previous.clone();

    next.last_applied_status = Some(transition.status);
    next.last_applied_message = Some(transition.message.clone());
    if transition.counts {
        next.applied_count = next.applied_count.saturating_add(1);
    }
    next.monitored_resources = vec![target_id.clone()];
    if let Some(revision) = &transition.current_revision {
        next.current_revisions.insert(target_id.clone(), revision.clone());
    }
    if let (Some(ActionKind::Rollback), AppliedStatus::RolledBack, Some(revision)) =
        (transition.action, transition.status, &transition.revision)
    {
        next.rollback_revisions.insert(target_id, revision.clone());
    }
    next.observed_generation = policy.metadata.generation.or(previous.observed_generation);

    if next == *previous {
        return None;
    }

    let stamp = previous
        .last_applied()
        .map_or(now, |last| last.max(now))
        .to_rfc3339_opts(SecondsFormat::Millis, true);

    if previous.last_applied_status != Some(transition.status) || transition.counts {
        next.push_history(HistoryEntry {
            time: stamp.clone(),
            from: previous.last_applied_status,
            to: transition.status,
            action: transition
                .action
                .map_or_else(|| "None".to_string(), |a| a.to_string()),
            revision: transition.revision.clone(),
            message: transition.message.clone(),
        });
    }
    next.last_applied_time = Some(stamp);

    Some(next)
}
