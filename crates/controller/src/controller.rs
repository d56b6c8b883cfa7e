//! Policy controller loop.
//!
//! Seeds the scheduler from the store, runs a pool of workers, and keeps the
//! scheduler in step with the store through the watch stream and a periodic
//! resync sweep.

use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::crds::RollbackPolicy;
use crate::executor::Backoff;
use crate::reconcile::run_worker;
use crate::store::{PolicyEvent, StoreError};
use crate::types::{Context, Result};

const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Run until `shutdown` fires, then drain the workers.
#[instrument(skip_all, fields(workers = ctx.config.reconcile.workers))]
pub async fn run_policy_controller(ctx: Arc<Context>, shutdown: CancellationToken) -> Result<()> {
    // Subscribe before listing so nothing between the two is missed.
    let mut events = ctx.store.watch();

    if !initial_sync(&ctx, &shutdown).await {
        info!("Shutdown requested before initial sync completed");
        return Ok(());
    }
    ctx.mark_ready();

    let workers: Vec<_> = (0..ctx.config.reconcile.workers.max(1))
        .map(|worker| tokio::spawn(run_worker(worker, ctx.clone())))
        .collect();
    info!(workers = workers.len(), "Policy controller started");

    let period = ctx.config.reconcile.resync();
    let mut resync_timer = interval_at(Instant::now() + period, period);
    resync_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = resync_timer.tick() => {
                if let Err(e) = resync(&ctx).await {
                    warn!(error = %e, "Resync failed");
                }
            }
            event = events.next() => match event {
                Some(Ok(PolicyEvent::Applied(policy))) => observe(&ctx, &policy),
                Some(Ok(PolicyEvent::Deleted(key))) => {
                    debug!(policy = %key, "Policy deleted");
                    ctx.scheduler.forget(&key);
                    ctx.clear_failures(&key);
                }
                Some(Err(e)) => warn!(error = %e, "Policy watch error"),
                None => {
                    warn!("Policy watch ended, resubscribing");
                    sleep(WATCH_RESTART_DELAY).await;
                    events = ctx.store.watch();
                }
            },
        }
    }

    info!("Stopping policy controller");
    ctx.scheduler.close();
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Worker panicked");
        }
    }
    info!("Policy controller stopped");
    Ok(())
}

/// List until it succeeds. Returns `false` when cancelled first.
async fn initial_sync(ctx: &Context, shutdown: &CancellationToken) -> bool {
    let backoff = Backoff::new(
        Duration::from_secs(ctx.config.reconcile.error_backoff_base_seconds),
        Duration::from_secs(ctx.config.reconcile.error_backoff_max_seconds),
    );
    let mut attempt = 0;

    loop {
        match resync(ctx).await {
            Ok(count) => {
                info!(policies = count, "Initial policy sync complete");
                return true;
            }
            Err(e) => {
                let delay = backoff.delay(attempt);
                attempt += 1;
                warn!(error = %e, retry_in = ?delay, "Initial policy list failed");
                tokio::select! {
                    () = shutdown.cancelled() => return false,
                    () = sleep(delay) => {}
                }
            }
        }
    }
}

/// Observe every stored policy and drop scheduler keys that no longer exist.
async fn resync(ctx: &Context) -> Result<usize, StoreError> {
    let policies = ctx.store.list().await?;
    let live: HashSet<_> = policies.iter().map(RollbackPolicy::key).collect();

    for policy in &policies {
        observe(ctx, policy);
    }
    for key in ctx.scheduler.keys() {
        if !live.contains(&key) {
            debug!(policy = %key, "Dropping key missing from store");
            ctx.scheduler.forget(&key);
            ctx.clear_failures(&key);
        }
    }
    Ok(policies.len())
}

fn observe(ctx: &Context, policy: &RollbackPolicy) {
    ctx.scheduler.observe(
        policy.key(),
        policy.spec.check_interval(),
        policy.status.as_ref().and_then(|s| s.last_applied()),
    );
}
