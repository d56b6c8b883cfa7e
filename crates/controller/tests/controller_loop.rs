//! The full controller loop: initial sync, watch-driven triggers, rate
//! limiting, restart seeding and shutdown.

mod common;

use chrono::Utc;
use common::{harness, policy, settle};
use controller::crds::{AppliedStatus, RollbackPolicyStatus};
use controller::run_policy_controller;
use controller::store::PolicyStore;
use controller::PolicyKey;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;

fn key() -> PolicyKey {
    PolicyKey::new("prod", "web-guard")
}

async fn relabel(store: &dyn PolicyStore, value: &str) {
    let mut current = store.get(&key()).await.unwrap().unwrap();
    current.metadata.labels = Some(BTreeMap::from([("touched".to_string(), value.to_string())]));
    store.update(current).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_triggers_inside_interval_are_debounced() {
    let h = harness(10);
    h.store.create(policy("80%", Some("3"))).await.unwrap();
    let start = Instant::now();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_policy_controller(h.ctx.clone(), shutdown.clone()));

    sleep(Duration::from_secs(1)).await;
    assert!(h.ctx.is_ready());
    assert_eq!(h.ctx.metrics.snapshot().reconciles, 1);

    sleep_until(start + Duration::from_secs(10)).await;
    relabel(h.store.as_ref(), "a").await;
    sleep_until(start + Duration::from_secs(20)).await;
    relabel(h.store.as_ref(), "b").await;

    sleep_until(start + Duration::from_secs(59)).await;
    assert_eq!(h.ctx.metrics.snapshot().reconciles, 1);

    sleep_until(start + Duration::from_secs(61)).await;
    assert_eq!(h.ctx.metrics.snapshot().reconciles, 2);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_breach_is_remediated_through_the_loop() {
    let h = harness(6);
    h.cluster.set_heal_on_rollback(true);
    h.store.create(policy("80%", Some("3"))).await.unwrap();
    let start = Instant::now();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_policy_controller(h.ctx.clone(), shutdown.clone()));

    sleep(Duration::from_secs(1)).await;
    let status = h.store.get(&key()).await.unwrap().unwrap().status.unwrap();
    assert_eq!(status.last_applied_status, Some(AppliedStatus::RolledBack));
    assert_eq!(status.applied_count, 1);

    // Healed by the rollback: the next check settles back to idle.
    sleep_until(start + Duration::from_secs(61)).await;
    let status = h.store.get(&key()).await.unwrap().unwrap().status.unwrap();
    assert_eq!(status.last_applied_status, Some(AppliedStatus::NoActionNeeded));
    assert_eq!(status.applied_count, 1);
    assert_eq!(status.history.len(), 2);

    settle().await;
    assert_eq!(
        h.channel.statuses(),
        vec!["RolledBack".to_string(), "NoActionNeeded".to_string()]
    );

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_waits_for_persisted_interval() {
    let h = harness(10);
    let created = h.store.create(policy("80%", Some("3"))).await.unwrap();
    let status = RollbackPolicyStatus {
        last_applied_time: Some((Utc::now() - chrono::Duration::seconds(45)).to_rfc3339()),
        last_applied_status: Some(AppliedStatus::NoActionNeeded),
        ..Default::default()
    };
    h.store
        .replace_status(&key(), created.metadata.resource_version.as_deref().unwrap(), status)
        .await
        .unwrap();
    let start = Instant::now();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_policy_controller(h.ctx.clone(), shutdown.clone()));

    sleep_until(start + Duration::from_secs(10)).await;
    assert_eq!(h.ctx.metrics.snapshot().reconciles, 0);

    sleep_until(start + Duration::from_secs(16)).await;
    assert_eq!(h.ctx.metrics.snapshot().reconciles, 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_deleted_policy_stops_being_evaluated() {
    let h = harness(10);
    h.store.create(policy("80%", Some("3"))).await.unwrap();
    let start = Instant::now();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(run_policy_controller(h.ctx.clone(), shutdown.clone()));

    sleep(Duration::from_secs(1)).await;
    h.store.delete(&key()).await.unwrap();
    sleep(Duration::from_secs(1)).await;
    assert!(!h.ctx.scheduler.contains(&key()));

    sleep_until(start + Duration::from_secs(180)).await;
    assert_eq!(h.ctx.metrics.snapshot().reconciles, 1);

    shutdown.cancel();
    handle.await.unwrap().unwrap();
}
