//! Action executor.
//!
//! Applies a rollback or a remediation to a target with bounded retries. At
//! most one action per target runs at a time; a second caller gets a `Busy`
//! outcome instead of queueing behind the first.

pub mod backoff;
pub mod handlers;
pub mod kubernetes;

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::crds::RemediationSpec;
use crate::types::{PolicyKey, ResolvedTarget};

pub use backoff::Backoff;
pub use handlers::{HandlerRegistry, Mutation, RemediationHandler};
pub use kubernetes::KubeTargetClient;

#[derive(Debug, Clone, Error)]
pub enum ExecutorError {
    #[error("Target {0} not found")]
    NotFound(String),

    #[error("Revision {revision} of {target} not found")]
    RevisionNotFound { target: String, revision: String },

    #[error("Conflicting update on {0}")]
    Conflict(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown remediation handler '{0}'")]
    UnknownHandler(String),

    #[error("Invalid parameters for handler '{handler}': {reason}")]
    InvalidParams { handler: String, reason: String },

    #[error("{0}")]
    Fatal(String),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_) | Self::Transient(_) | Self::Timeout(_)
        )
    }
}

/// Mutating surface of a target workload. Every call must be safe to retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TargetClient: Send + Sync {
    async fn current_revision(&self, target: &ResolvedTarget)
        -> Result<Option<String>, ExecutorError>;

    /// Whether the live pod template is the one recorded for `revision`.
    ///
    /// A rollback re-stamps the old template with a new revision number, so
    /// this must also resolve `revision` through the revision history.
    async fn is_at_revision(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<bool, ExecutorError>;

    /// Converge the target to `revision`.
    async fn rollback_to(&self, target: &ResolvedTarget, revision: &str)
        -> Result<(), ExecutorError>;

    /// Rolling restart keyed by `token`.
    async fn restart(&self, target: &ResolvedTarget, token: &str)
        -> Result<Effect, ExecutorError>;

    /// Set desired replicas, stamping `token` on the target when it changes.
    async fn scale(
        &self,
        target: &ResolvedTarget,
        replicas: i32,
        token: &str,
    ) -> Result<Effect, ExecutorError>;
}

/// What a remediation call did to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Changed,
    /// The target already carries this action's token
    Replayed,
    /// Already in the requested state, not through this action
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Rollback,
    Remediate,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rollback => f.write_str("Rollback"),
            Self::Remediate => f.write_str("Remediate"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    /// The target was mutated
    Applied,
    /// The target was already in the requested state; nothing was mutated
    AlreadyConverged,
    /// Another action for the same target is in flight
    Busy,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    /// Requested revision for a rollback, resulting revision for a remediation
    pub applied_revision: Option<String>,
    /// Live revision once the action finished
    pub current_revision: Option<String>,
    /// Converged because an earlier attempt of this same action landed
    pub replayed: bool,
    pub attempts: u32,
    pub error: Option<String>,
}

impl Outcome {
    fn busy() -> Self {
        Self {
            kind: OutcomeKind::Busy,
            applied_revision: None,
            current_revision: None,
            replayed: false,
            attempts: 0,
            error: None,
        }
    }

    fn failed(attempts: u32, error: &ExecutorError) -> Self {
        Self {
            kind: OutcomeKind::Failed,
            applied_revision: None,
            current_revision: None,
            replayed: false,
            attempts,
            error: Some(error.to_string()),
        }
    }
}

/// One rollback or remediation, alive for a single reconcile cycle.
#[derive(Debug, Clone)]
pub struct Action {
    pub id: Uuid,
    pub policy_id: PolicyKey,
    pub target: ResolvedTarget,
    pub kind: ActionKind,
    pub target_revision: Option<String>,
    pub remediation: Option<RemediationSpec>,
    /// Stable across retries and crash recovery for the same logical action
    pub idempotency_key: String,
    pub attempt: u32,
    pub outcome: Option<Outcome>,
}

impl Action {
    pub fn rollback(
        policy_id: PolicyKey,
        target: ResolvedTarget,
        revision: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_id,
            target,
            kind: ActionKind::Rollback,
            target_revision: Some(revision.into()),
            remediation: None,
            idempotency_key: idempotency_key.into(),
            attempt: 0,
            outcome: None,
        }
    }

    pub fn remediate(
        policy_id: PolicyKey,
        target: ResolvedTarget,
        remediation: RemediationSpec,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            policy_id,
            target,
            kind: ActionKind::Remediate,
            target_revision: None,
            remediation: Some(remediation),
            idempotency_key: idempotency_key.into(),
            attempt: 0,
            outcome: None,
        }
    }
}

/// Removes the in-flight marker for a target when dropped.
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<ResolvedTarget, Uuid>,
    target: ResolvedTarget,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.target);
    }
}

pub struct Executor {
    client: Arc<dyn TargetClient>,
    handlers: HandlerRegistry,
    in_flight: DashMap<ResolvedTarget, Uuid>,
    max_attempts: u32,
    attempt_timeout: Duration,
    backoff: Backoff,
}

impl Executor {
    pub fn new(
        client: Arc<dyn TargetClient>,
        handlers: HandlerRegistry,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            client,
            handlers,
            in_flight: DashMap::new(),
            max_attempts: config.max_attempts.max(1),
            attempt_timeout: config.attempt_timeout(),
            backoff: Backoff::new(
                Duration::from_millis(config.backoff_base_millis),
                Duration::from_millis(config.max_backoff_millis),
            ),
        }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn try_acquire(&self, action: &Action) -> Option<InFlightGuard<'_>> {
        match self.in_flight.entry(action.target.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(action.id);
                Some(InFlightGuard {
                    in_flight: &self.in_flight,
                    target: action.target.clone(),
                })
            }
        }
    }

    /// Apply `action`, recording the attempt count and outcome on it.
    pub async fn apply(&self, action: &mut Action) -> Outcome {
        let Some(_guard) = self.try_acquire(action) else {
            debug!(target = %action.target, action = %action.id, "Target busy");
            let outcome = Outcome::busy();
            action.outcome = Some(outcome.clone());
            return outcome;
        };

        let outcome = self.apply_with_retries(action).await;
        action.outcome = Some(outcome.clone());
        outcome
    }

    async fn apply_with_retries(&self, action: &mut Action) -> Outcome {
        loop {
            action.attempt += 1;
            let attempt = action.attempt;

            let result = tokio::time::timeout(self.attempt_timeout, self.attempt(action))
                .await
                .unwrap_or(Err(ExecutorError::Timeout(self.attempt_timeout)));

            match result {
                Ok(mut outcome) => {
                    outcome.attempts = attempt;
                    info!(
                        policy = %action.policy_id,
                        target = %action.target,
                        kind = %action.kind,
                        outcome = ?outcome.kind,
                        revision = ?outcome.applied_revision,
                        attempt,
                        "Action finished"
                    );
                    return outcome;
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff.delay(attempt - 1);
                    warn!(
                        policy = %action.policy_id,
                        target = %action.target,
                        error = %e,
                        attempt,
                        retry_in = ?delay,
                        "Action attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        policy = %action.policy_id,
                        target = %action.target,
                        error = %e,
                        attempt,
                        "Action failed"
                    );
                    return Outcome::failed(attempt, &e);
                }
            }
        }
    }

    async fn attempt(&self, action: &Action) -> Result<Outcome, ExecutorError> {
        let client = &self.client;
        let target = &action.target;

        match action.kind {
            ActionKind::Rollback => {
                let revision = action.target_revision.as_deref().ok_or_else(|| {
                    ExecutorError::Fatal("rollback without a revision".to_string())
                })?;

                let kind = if client.is_at_revision(target, revision).await? {
                    OutcomeKind::AlreadyConverged
                } else {
                    client.rollback_to(target, revision).await?;
                    OutcomeKind::Applied
                };

                Ok(Outcome {
                    kind,
                    applied_revision: Some(revision.to_string()),
                    current_revision: client.current_revision(target).await?,
                    replayed: false,
                    attempts: 0,
                    error: None,
                })
            }
            ActionKind::Remediate => {
                let remediation = action.remediation.clone().unwrap_or_default();
                let mutation = self.handlers.plan(&remediation)?;
                let token = &action.idempotency_key;

                let effect = match mutation {
                    Mutation::Restart => client.restart(target, token).await?,
                    Mutation::Scale { replicas } => client.scale(target, replicas, token).await?,
                };
                let current = client.current_revision(target).await?;

                Ok(Outcome {
                    kind: if effect == Effect::Changed {
                        OutcomeKind::Applied
                    } else {
                        OutcomeKind::AlreadyConverged
                    },
                    applied_revision: current.clone(),
                    current_revision: current,
                    replayed: effect == Effect::Replayed,
                    attempts: 0,
                    error: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::TargetKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn target() -> ResolvedTarget {
        ResolvedTarget {
            kind: TargetKind::Deployment,
            namespace: "prod".to_string(),
            name: "web".to_string(),
        }
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            max_attempts: 3,
            attempt_timeout_seconds: 5,
            backoff_base_millis: 100,
            max_backoff_millis: 1_000,
        }
    }

    fn executor(client: MockTargetClient) -> Executor {
        Executor::new(Arc::new(client), HandlerRegistry::with_builtins(), &config())
    }

    fn rollback_to(revision: &str) -> Action {
        Action::rollback(
            PolicyKey::new("prod", "web-guard"),
            target(),
            revision,
            "prod/web-guard-1",
        )
    }

    #[tokio::test]
    async fn test_converged_rollback_makes_no_mutating_calls() {
        // Rolled back earlier: revision 3's template now runs as revision 6.
        let mut client = MockTargetClient::new();
        client
            .expect_is_at_revision()
            .withf(|_, revision| revision == "3")
            .returning(|_, _| Ok(true));
        client
            .expect_current_revision()
            .returning(|_| Ok(Some("6".to_string())));
        client.expect_rollback_to().times(0);
        client.expect_restart().times(0);
        client.expect_scale().times(0);

        let executor = executor(client);
        for _ in 0..3 {
            let mut action = rollback_to("3");
            let outcome = executor.apply(&mut action).await;
            assert_eq!(outcome.kind, OutcomeKind::AlreadyConverged);
            assert_eq!(outcome.applied_revision.as_deref(), Some("3"));
            assert_eq!(outcome.current_revision.as_deref(), Some("6"));
            assert_eq!(action.outcome, Some(outcome));
        }
    }

    #[tokio::test]
    async fn test_rollback_applies_when_behind() {
        let mut client = MockTargetClient::new();
        client.expect_is_at_revision().returning(|_, _| Ok(false));
        client
            .expect_rollback_to()
            .withf(|_, revision| revision == "3")
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_current_revision()
            .returning(|_| Ok(Some("6".to_string())));

        let outcome = executor(client).apply(&mut rollback_to("3")).await;
        assert_eq!(outcome.kind, OutcomeKind::Applied);
        assert_eq!(outcome.current_revision.as_deref(), Some("6"));
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut client = MockTargetClient::new();
        client.expect_is_at_revision().returning(|_, _| Ok(false));
        client
            .expect_current_revision()
            .returning(|_| Ok(Some("6".to_string())));
        client.expect_rollback_to().times(2).returning(move |_, _| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ExecutorError::Conflict("web".to_string()))
            } else {
                Ok(())
            }
        });

        let mut action = rollback_to("3");
        let outcome = executor(client).apply(&mut action).await;
        assert_eq!(outcome.kind, OutcomeKind::Applied);
        assert_eq!(outcome.attempts, 2);
        assert_eq!(action.attempt, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_budget_is_bounded() {
        let mut client = MockTargetClient::new();
        client
            .expect_is_at_revision()
            .times(3)
            .returning(|_, _| Err(ExecutorError::Transient("apiserver unavailable".to_string())));

        let outcome = executor(client).apply(&mut rollback_to("3")).await;
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.error.unwrap().contains("apiserver unavailable"));
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let mut client = MockTargetClient::new();
        client.expect_is_at_revision().returning(|_, _| Ok(false));
        client.expect_rollback_to().times(1).returning(|t, r| {
            Err(ExecutorError::RevisionNotFound {
                target: t.to_string(),
                revision: r.to_string(),
            })
        });

        let outcome = executor(client).apply(&mut rollback_to("3")).await;
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_unknown_handler_fails_without_touching_target() {
        let mut client = MockTargetClient::new();
        client.expect_current_revision().times(0);
        client.expect_restart().times(0);
        client.expect_scale().times(0);

        let mut action = Action::remediate(
            PolicyKey::new("prod", "web-guard"),
            target(),
            RemediationSpec {
                handler: "reboot-node".to_string(),
                params: Default::default(),
            },
            "prod/web-guard-1",
        );
        let outcome = executor(client).apply(&mut action).await;
        assert_eq!(outcome.kind, OutcomeKind::Failed);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn test_restart_uses_idempotency_key() {
        let mut client = MockTargetClient::new();
        client
            .expect_current_revision()
            .returning(|_| Ok(Some("7".to_string())));
        client
            .expect_restart()
            .withf(|_, token| token == "prod/web-guard-4")
            .times(1)
            .returning(|_, _| Ok(Effect::Replayed));

        let mut action = Action::remediate(
            PolicyKey::new("prod", "web-guard"),
            target(),
            RemediationSpec::default(),
            "prod/web-guard-4",
        );
        let outcome = executor(client).apply(&mut action).await;
        assert_eq!(outcome.kind, OutcomeKind::AlreadyConverged);
        assert!(outcome.replayed);
        assert_eq!(outcome.applied_revision.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn test_scale_already_at_size_is_not_a_replay() {
        let mut client = MockTargetClient::new();
        client
            .expect_current_revision()
            .returning(|_| Ok(Some("7".to_string())));
        client
            .expect_scale()
            .withf(|_, replicas, token| *replicas == 4 && token == "prod/web-guard-2")
            .times(1)
            .returning(|_, _, _| Ok(Effect::Unchanged));

        let mut action = Action::remediate(
            PolicyKey::new("prod", "web-guard"),
            target(),
            RemediationSpec {
                handler: "scale".to_string(),
                params: [("replicas".to_string(), "4".to_string())].into(),
            },
            "prod/web-guard-2",
        );
        let outcome = executor(client).apply(&mut action).await;
        assert_eq!(outcome.kind, OutcomeKind::AlreadyConverged);
        assert!(!outcome.replayed);
    }

    #[tokio::test]
    async fn test_second_action_on_same_target_is_busy() {
        let mut client = MockTargetClient::new();
        client.expect_is_at_revision().returning(|_, _| Ok(false));
        client
            .expect_current_revision()
            .returning(|_| Ok(Some("6".to_string())));
        client.expect_rollback_to().times(1).returning(|_, _| Ok(()));

        let executor = executor(client);
        let held = rollback_to("3");
        let guard = executor.try_acquire(&held);
        assert!(guard.is_some());

        let outcome = executor.apply(&mut rollback_to("3")).await;
        assert_eq!(outcome.kind, OutcomeKind::Busy);
        assert_eq!(outcome.attempts, 0);

        drop(guard);
        let outcome = executor.apply(&mut rollback_to("3")).await;
        assert_eq!(outcome.kind, OutcomeKind::Applied);
        assert_eq!(executor.in_flight(), 0);
    }
}
