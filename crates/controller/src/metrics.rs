//! Process-wide controller counters exposed on `/metrics`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    reconciles: AtomicU64,
    reconcile_errors: AtomicU64,
    deadline_exceeded: AtomicU64,
    conflicts: AtomicU64,
    status_writes: AtomicU64,
    actions_applied: AtomicU64,
    actions_converged: AtomicU64,
    actions_failed: AtomicU64,
    actions_busy: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub reconciles: u64,
    pub reconcile_errors: u64,
    pub deadline_exceeded: u64,
    pub conflicts: u64,
    pub status_writes: u64,
    pub actions_applied: u64,
    pub actions_converged: u64,
    pub actions_failed: u64,
    pub actions_busy: u64,
}

macro_rules! counter {
    ($($fn:ident => $field:ident),* $(,)?) => {
        $(
            pub fn $fn(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ControllerMetrics {
    counter! {
        record_reconcile => reconciles,
        record_error => reconcile_errors,
        record_deadline => deadline_exceeded,
        record_conflict => conflicts,
        record_status_write => status_writes,
        record_applied => actions_applied,
        record_converged => actions_converged,
        record_failed => actions_failed,
        record_busy => actions_busy,
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            reconciles: self.reconciles.load(Ordering::Relaxed),
            reconcile_errors: self.reconcile_errors.load(Ordering::Relaxed),
            deadline_exceeded: self.deadline_exceeded.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            status_writes: self.status_writes.load(Ordering::Relaxed),
            actions_applied: self.actions_applied.load(Ordering::Relaxed),
            actions_converged: self.actions_converged.load(Ordering::Relaxed),
            actions_failed: self.actions_failed.load(Ordering::Relaxed),
            actions_busy: self.actions_busy.load(Ordering::Relaxed),
        }
    }
}
