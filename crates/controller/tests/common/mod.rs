//! Shared fixtures: an in-memory store and cluster wired into a `Context`,
//! plus a notification channel that records what it was sent.

#![allow(dead_code)]

use async_trait::async_trait;
use controller::config::ControllerConfig;
use controller::crds::{RollbackPolicy, RollbackPolicySpec, TargetKind};
use controller::source::memory::Workload;
use controller::source::InMemoryCluster;
use controller::store::MemoryPolicyStore;
use controller::{Context, ResolvedTarget};
use notify::{ChannelError, NotifyChannel, NotifyEvent, Notifier};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct RecordingChannel {
    events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingChannel {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                NotifyEvent::StatusChanged { new_status, .. } => Some(new_status),
                NotifyEvent::ActionFailed { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl NotifyChannel for RecordingChannel {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn send(&self, event: &NotifyEvent) -> Result<(), ChannelError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryPolicyStore>,
    pub cluster: Arc<InMemoryCluster>,
    pub channel: Arc<RecordingChannel>,
    pub ctx: Arc<Context>,
}

pub fn target() -> ResolvedTarget {
    ResolvedTarget {
        kind: TargetKind::Deployment,
        namespace: "prod".to_string(),
        name: "web".to_string(),
    }
}

pub fn config() -> ControllerConfig {
    let mut config = ControllerConfig::default();
    config.executor.max_attempts = 3;
    config.executor.attempt_timeout_seconds = 30;
    config.executor.backoff_base_millis = 10;
    config.executor.max_backoff_millis = 100;
    config
}

/// `web-guard` in `prod`, guarding `Deployment/web` with
/// `AvailableReplicas LessThan <threshold>`.
pub fn policy(threshold: &str, rollback_to: Option<&str>) -> RollbackPolicy {
    let mut spec = json!({
        "targetRef": { "apiKind": "Deployment", "name": "web" },
        "conditions": [
            { "type": "AvailableReplicas", "operator": "LessThan", "value": threshold }
        ],
        "checkInterval": 60
    });
    if let Some(revision) = rollback_to {
        spec["rollbackToRevision"] = json!(revision);
    }
    let spec: RollbackPolicySpec = serde_json::from_value(spec).unwrap();

    let mut policy = RollbackPolicy::new("web-guard", spec);
    policy.metadata.namespace = Some("prod".to_string());
    policy
}

pub fn harness_with(config: ControllerConfig) -> Harness {
    let store = Arc::new(MemoryPolicyStore::new());
    let cluster = Arc::new(InMemoryCluster::new());
    let channel = Arc::new(RecordingChannel::default());
    let ctx = Arc::new(Context::new(
        store.clone(),
        cluster.clone(),
        cluster.clone(),
        cluster.clone(),
        Notifier::with_channels(vec![channel.clone() as Arc<dyn NotifyChannel>]),
        config,
    ));
    Harness {
        store,
        cluster,
        channel,
        ctx,
    }
}

/// Harness with `Deployment/prod/web` at revision 5, `available` of 10
/// replicas ready.
pub fn harness(available: i32) -> Harness {
    let h = harness_with(config());
    h.cluster.put_workload(&target(), Workload::new(10, available, "5"));
    h
}

/// Let spawned notification tasks run.
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
