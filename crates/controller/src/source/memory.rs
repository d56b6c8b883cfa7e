//! In-memory cluster: a status source, metric source and target client over
//! a map of simulated workloads. Used for local runs and scenario tests.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use super::{MetricSource, SourceError, StatusSource};
use crate::executor::{Effect, ExecutorError, TargetClient};
use crate::policy::TargetStatus;
use crate::types::ResolvedTarget;

/// A simulated Deployment.
///
/// Like the real controller, restoring an old template stamps it with the
/// next revision number; the old number still resolves to it, as it would
/// through `revision-history`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub spec_replicas: i32,
    pub available_replicas: i32,
    pub revision: String,
    /// Pod template id per revision number, history included
    pub templates: BTreeMap<String, String>,
    pub restart_token: Option<String>,
    /// Token of the last scale that changed the workload
    pub action_token: Option<String>,
}

impl Workload {
    /// A workload at `revision` whose history holds revisions `1..=revision`
    /// when `revision` is numeric, each with its own template.
    pub fn new(spec_replicas: i32, available_replicas: i32, revision: impl Into<String>) -> Self {
        let revision = revision.into();
        let mut templates: BTreeMap<String, String> = revision
            .parse::<u32>()
            .map(|top| (1..=top).map(|r| (r.to_string(), format!("template-{r}"))).collect())
            .unwrap_or_default();
        templates
            .entry(revision.clone())
            .or_insert_with(|| format!("template-{revision}"));
        Self {
            spec_replicas,
            available_replicas,
            revision,
            templates,
            restart_token: None,
            action_token: None,
        }
    }

    /// Template the workload currently runs.
    pub fn template(&self) -> Option<&str> {
        self.templates.get(&self.revision).map(String::as_str)
    }

    fn next_revision(&self) -> String {
        let top = self
            .templates
            .keys()
            .filter_map(|r| r.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        (top + 1).to_string()
    }

    fn roll_out(&mut self, template: String) {
        let next = self.next_revision();
        self.templates.insert(next.clone(), template);
        self.revision = next;
    }
}

/// Tracks concurrent mutating calls.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct InMemoryCluster {
    workloads: DashMap<ResolvedTarget, Workload>,
    metrics: DashMap<(ResolvedTarget, String), f64>,
    status_faults: DashMap<ResolvedTarget, SourceError>,
    action_faults: DashMap<ResolvedTarget, VecDeque<ExecutorError>>,
    mutation_delay_millis: AtomicU64,
    heal_on_rollback: AtomicBool,
    mutations: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_workload(&self, target: &ResolvedTarget, workload: Workload) {
        self.workloads.insert(target.clone(), workload);
    }

    pub fn remove_workload(&self, target: &ResolvedTarget) {
        self.workloads.remove(target);
    }

    pub fn workload(&self, target: &ResolvedTarget) -> Option<Workload> {
        self.workloads.get(target).map(|w| w.clone())
    }

    pub fn set_available(&self, target: &ResolvedTarget, available: i32) {
        if let Some(mut w) = self.workloads.get_mut(target) {
            w.available_replicas = available;
        }
    }

    pub fn set_metric(&self, target: &ResolvedTarget, name: &str, value: f64) {
        self.metrics.insert((target.clone(), name.to_string()), value);
    }

    /// Make status reads for `target` fail with `error` until cleared.
    pub fn fail_status(&self, target: &ResolvedTarget, error: SourceError) {
        self.status_faults.insert(target.clone(), error);
    }

    pub fn clear_status_fault(&self, target: &ResolvedTarget) {
        self.status_faults.remove(target);
    }

    /// Queue errors returned by the next mutating calls on `target`.
    pub fn fail_next_actions(&self, target: &ResolvedTarget, errors: Vec<ExecutorError>) {
        self.action_faults
            .entry(target.clone())
            .or_default()
            .extend(errors);
    }

    /// Hold every mutating call for `delay` while counted as in flight.
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.mutation_delay_millis
            .store(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// When set, a rollback also restores full availability.
    pub fn set_heal_on_rollback(&self, heal: bool) {
        self.heal_on_rollback.store(heal, Ordering::SeqCst);
    }

    /// Number of mutating calls that changed a workload.
    pub fn mutation_count(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, target: &ResolvedTarget) -> Result<InFlight<'_>, ExecutorError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let delay = self.mutation_delay_millis.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let fault = self
            .action_faults
            .get_mut(target)
            .and_then(|mut queue| queue.pop_front());
        match fault {
            Some(err) => Err(err),
            None => Ok(guard),
        }
    }
}

#[async_trait]
impl StatusSource for InMemoryCluster {
    async fn get_status(&self, target: &ResolvedTarget) -> Result<TargetStatus, SourceError> {
        if let Some(fault) = self.status_faults.get(target) {
            return Err(fault.clone());
        }
        let w = self
            .workloads
            .get(target)
            .ok_or_else(|| SourceError::NotFound(target.to_string()))?;
        Ok(TargetStatus {
            spec_replicas: w.spec_replicas,
            available_replicas: w.available_replicas,
            unavailable_replicas: (w.spec_replicas - w.available_replicas).max(0),
            current_revision: Some(w.revision.clone()),
        })
    }
}

#[async_trait]
impl MetricSource for InMemoryCluster {
    async fn get_metric(
        &self,
        target: &ResolvedTarget,
        name: &str,
    ) -> Result<Option<f64>, SourceError> {
        Ok(self
            .metrics
            .get(&(target.clone(), name.to_string()))
            .map(|v| *v))
    }
}

#[async_trait]
impl TargetClient for InMemoryCluster {
    async fn current_revision(
        &self,
        target: &ResolvedTarget,
    ) -> Result<Option<String>, ExecutorError> {
        self.workloads
            .get(target)
            .map(|w| Some(w.revision.clone()))
            .ok_or_else(|| ExecutorError::NotFound(target.to_string()))
    }

    async fn is_at_revision(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<bool, ExecutorError> {
        let w = self
            .workloads
            .get(target)
            .ok_or_else(|| ExecutorError::NotFound(target.to_string()))?;
        Ok(w.templates.get(revision).map(String::as_str) == w.template())
    }

    async fn rollback_to(
        &self,
        target: &ResolvedTarget,
        revision: &str,
    ) -> Result<(), ExecutorError> {
        let _in_flight = self.enter(target).await?;
        let heal = self.heal_on_rollback.load(Ordering::SeqCst);

        let mut w = self
            .workloads
            .get_mut(target)
            .ok_or_else(|| ExecutorError::NotFound(target.to_string()))?;
        let template = w.templates.get(revision).cloned().ok_or_else(|| {
            ExecutorError::RevisionNotFound {
                target: target.to_string(),
                revision: revision.to_string(),
            }
        })?;
        if w.template() == Some(template.as_str()) {
            return Ok(());
        }
        w.roll_out(template);
        if heal {
            w.available_replicas = w.spec_replicas;
        }
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self, target: &ResolvedTarget, token: &str) -> Result<Effect, ExecutorError> {
        let _in_flight = self.enter(target).await?;

        let mut w = self
            .workloads
            .get_mut(target)
            .ok_or_else(|| ExecutorError::NotFound(target.to_string()))?;
        if w.restart_token.as_deref() == Some(token) {
            return Ok(Effect::Replayed);
        }
        let template = format!("{}+restart:{token}", w.template().unwrap_or_default());
        w.roll_out(template);
        w.restart_token = Some(token.to_string());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(Effect::Changed)
    }

    async fn scale(
        &self,
        target: &ResolvedTarget,
        replicas: i32,
        token: &str,
    ) -> Result<Effect, ExecutorError> {
        let _in_flight = self.enter(target).await?;

        let mut w = self
            .workloads
            .get_mut(target)
            .ok_or_else(|| ExecutorError::NotFound(target.to_string()))?;
        if w.spec_replicas == replicas {
            return Ok(if w.action_token.as_deref() == Some(token) {
                Effect::Replayed
            } else {
                Effect::Unchanged
            });
        }
        w.spec_replicas = replicas;
        w.available_replicas = w.available_replicas.min(replicas);
        w.action_token = Some(token.to_string());
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(Effect::Changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::TargetKind;

    fn target() -> ResolvedTarget {
        ResolvedTarget {
            kind: TargetKind::Deployment,
            namespace: "prod".to_string(),
            name: "web".to_string(),
        }
    }

    #[tokio::test]
    async fn test_rollback_renumbers_restored_template() {
        let cluster = InMemoryCluster::new();
        cluster.put_workload(&target(), Workload::new(10, 10, "5"));
        assert!(!cluster.is_at_revision(&target(), "3").await.unwrap());

        cluster.rollback_to(&target(), "3").await.unwrap();
        let workload = cluster.workload(&target()).unwrap();
        assert_eq!(workload.revision, "6");
        assert_eq!(workload.template(), Some("template-3"));
        assert!(cluster.is_at_revision(&target(), "3").await.unwrap());
        assert!(cluster.is_at_revision(&target(), "6").await.unwrap());
        assert!(!cluster.is_at_revision(&target(), "5").await.unwrap());
        assert_eq!(cluster.mutation_count(), 1);
    }

    #[tokio::test]
    async fn test_scale_reports_replay_by_token() {
        let cluster = InMemoryCluster::new();
        cluster.put_workload(&target(), Workload::new(10, 10, "5"));

        let web = target();
        let first = cluster.scale(&web, 4, "prod/web-guard-1").await.unwrap();
        let replay = cluster.scale(&web, 4, "prod/web-guard-1").await.unwrap();
        let later = cluster.scale(&web, 4, "prod/web-guard-2").await.unwrap();
        assert_eq!(first, Effect::Changed);
        assert_eq!(replay, Effect::Replayed);
        assert_eq!(later, Effect::Unchanged);
        assert_eq!(cluster.mutation_count(), 1);
    }
}
