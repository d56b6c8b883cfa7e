//! Requeue engine.
//!
//! Keeps one entry per policy key with its next due time. Workers block in
//! [`Scheduler::next`] until a key is due; a key handed to a worker is not
//! handed out again until [`Scheduler::complete`] is called for it.
//!
//! A key forgotten while running stays tombstoned until that run ends, so a
//! policy recreated under the same name still waits for it.
//!
//! Event triggers are debounced: a key that started evaluating at `t` is not
//! triggered again before `t + checkInterval`. Explicit requeues (busy,
//! error backoff) are honored as given.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};

use crate::types::PolicyKey;

#[derive(Debug)]
struct Entry {
    interval: Duration,
    /// Next hand-out time; `None` while running or when nothing is scheduled.
    due: Option<Instant>,
    /// Earliest time an event trigger may schedule this key.
    not_before: Instant,
    running: bool,
    /// Earliest due time requested while the key was running.
    pending: Option<Instant>,
    /// Forgotten while running; dropped when the run ends.
    forgotten: bool,
}

impl Entry {
    fn live(&self) -> bool {
        !self.forgotten
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<PolicyKey, Entry>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    state: Mutex<State>,
    changed: Notify,
}

fn earlier(a: Option<Instant>, b: Instant) -> Instant {
    a.map_or(b, |a| a.min(b))
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key` as first due at `due`, unless it is already known.
    ///
    /// A tombstoned key is revived. If its old run is still going, the new
    /// due time waits for that run to complete.
    pub fn seed(&self, key: PolicyKey, interval: Duration, due: Instant) {
        {
            let mut state = self.lock();
            state
                .entries
                .entry(key)
                .and_modify(|e| {
                    e.interval = interval;
                    if e.forgotten {
                        e.forgotten = false;
                        e.pending = Some(due);
                    }
                })
                .or_insert(Entry {
                    interval,
                    due: Some(due),
                    not_before: due,
                    running: false,
                    pending: None,
                    forgotten: false,
                });
        }
        self.changed.notify_waiters();
    }

    /// React to a create/update of `key`.
    ///
    /// Unknown keys are seeded from the persisted `lastAppliedTime`, so a
    /// restart does not re-evaluate earlier than the interval allows.
    /// Known keys are triggered.
    pub fn observe(&self, key: PolicyKey, interval: Duration, last_applied: Option<DateTime<Utc>>) {
        let known = self.contains(&key);
        if known {
            self.set_interval(&key, interval);
            self.trigger(&key);
            return;
        }

        let remaining = last_applied
            .and_then(|t| {
                let next = t + chrono::Duration::from_std(interval).ok()?;
                (next - Utc::now()).to_std().ok()
            })
            .unwrap_or(Duration::ZERO);
        self.seed(key, interval, Instant::now() + remaining);
    }

    fn set_interval(&self, key: &PolicyKey, interval: Duration) {
        if let Some(entry) = self.lock().entries.get_mut(key).filter(|e| e.live()) {
            entry.interval = interval;
        }
    }

    /// Schedule `key` at the later of now and its next allowed evaluation.
    pub fn trigger(&self, key: &PolicyKey) -> bool {
        {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key).filter(|e| e.live()) else {
                return false;
            };
            let candidate = Instant::now().max(entry.not_before);
            if entry.running {
                entry.pending = Some(earlier(entry.pending, candidate));
            } else {
                entry.due = Some(earlier(entry.due, candidate));
            }
        }
        self.changed.notify_waiters();
        true
    }

    /// Schedule `key` exactly `after` from now, replacing its due time.
    pub fn requeue(&self, key: &PolicyKey, after: Duration) -> bool {
        {
            let mut state = self.lock();
            let Some(entry) = state.entries.get_mut(key).filter(|e| e.live()) else {
                return false;
            };
            let at = Instant::now() + after;
            if entry.running {
                entry.pending = Some(earlier(entry.pending, at));
            } else {
                entry.due = Some(at);
            }
        }
        self.changed.notify_waiters();
        true
    }

    /// Wait for the next due key. Returns `None` once closed.
    pub async fn next(&self) -> Option<PolicyKey> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }

                let now = Instant::now();
                let mut earliest: Option<(Instant, &PolicyKey)> = None;
                for (key, entry) in &state.entries {
                    if entry.running {
                        continue;
                    }
                    if let Some(due) = entry.due {
                        let better = match earliest {
                            None => true,
                            Some((best, best_key)) => due < best || (due == best && key < best_key),
                        };
                        if better {
                            earliest = Some((due, key));
                        }
                    }
                }

                match earliest.map(|(due, key)| (due, key.clone())) {
                    Some((due, key)) if due <= now => {
                        if let Some(entry) = state.entries.get_mut(&key) {
                            entry.running = true;
                            entry.due = None;
                            entry.not_before = now + entry.interval;
                        }
                        return Some(key);
                    }
                    Some((due, _)) => Some(due),
                    None => None,
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        () = sleep_until(at) => {}
                        () = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish a run of `key` and schedule its next evaluation.
    ///
    /// Requests that arrived while it ran win if they are earlier. A key
    /// forgotten during the run is dropped instead.
    pub fn complete(&self, key: &PolicyKey, requeue_after: Duration) -> Option<Duration> {
        let next = {
            let mut state = self.lock();
            if state.entries.get(key).is_some_and(|e| e.forgotten) {
                state.entries.remove(key);
                drop(state);
                self.changed.notify_waiters();
                return None;
            }
            let entry = state.entries.get_mut(key)?;
            let now = Instant::now();
            let due = earlier(entry.pending.take(), now + requeue_after);
            entry.running = false;
            entry.due = Some(due);
            due.saturating_duration_since(now)
        };
        self.changed.notify_waiters();
        Some(next)
    }

    /// Drop `key`; a run in progress completes without rescheduling.
    pub fn forget(&self, key: &PolicyKey) -> bool {
        let removed = {
            let mut state = self.lock();
            match state.entries.get_mut(key) {
                Some(entry) if entry.running => {
                    let was_live = entry.live();
                    entry.forgotten = true;
                    entry.due = None;
                    entry.pending = None;
                    was_live
                }
                Some(_) => state.entries.remove(key).is_some(),
                None => false,
            }
        };
        self.changed.notify_waiters();
        removed
    }

    /// End a run that found its policy gone.
    ///
    /// The key is dropped unless it was observed again while the run was in
    /// flight, in which case it is scheduled like a completed run.
    pub fn retire(&self, key: &PolicyKey) {
        {
            let mut state = self.lock();
            let keep = state.entries.get_mut(key).is_some_and(|entry| {
                if entry.forgotten || entry.pending.is_none() {
                    return false;
                }
                entry.running = false;
                entry.due = entry.pending.take();
                true
            });
            if !keep {
                state.entries.remove(key);
            }
        }
        self.changed.notify_waiters();
    }

    /// Wake all waiting workers and make `next` return `None`.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_waiters();
    }

    pub fn contains(&self, key: &PolicyKey) -> bool {
        self.lock().entries.get(key).is_some_and(Entry::live)
    }

    pub fn keys(&self) -> Vec<PolicyKey> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| e.live())
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn is_running(&self, key: &PolicyKey) -> bool {
        self.lock().entries.get(key).is_some_and(|e| e.running)
    }

    /// Time until `key` is next due, if scheduled.
    pub fn due_in(&self, key: &PolicyKey) -> Option<Duration> {
        let state = self.lock();
        let entry = state.entries.get(key).filter(|e| e.live())?;
        let now = Instant::now();
        entry.due.map(|d| d.saturating_duration_since(now))
    }

    pub fn len(&self) -> usize {
        self.lock().entries.values().filter(|e| e.live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::time::{advance, timeout};

    const MINUTE: Duration = Duration::from_secs(60);

    fn key(name: &str) -> PolicyKey {
        PolicyKey::new("default", name)
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_within_interval_collapse_to_boundary() {
        let scheduler = Scheduler::new();
        let start = Instant::now();
        scheduler.seed(key("a"), MINUTE, start);

        assert_eq!(scheduler.next().await, Some(key("a")));
        scheduler.complete(&key("a"), MINUTE);

        advance(Duration::from_secs(10)).await;
        assert!(scheduler.trigger(&key("a")));
        advance(Duration::from_secs(10)).await;
        assert!(scheduler.trigger(&key("a")));

        // Nothing is handed out inside the window.
        assert!(timeout(Duration::from_secs(39), scheduler.next()).await.is_err());

        assert_eq!(scheduler.next().await, Some(key("a")));
        assert_eq!(Instant::now() - start, MINUTE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_running_key_is_not_handed_out_twice() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.seed(key("a"), MINUTE, Instant::now());
        assert_eq!(scheduler.next().await, Some(key("a")));
        assert!(scheduler.is_running(&key("a")));

        scheduler.requeue(&key("a"), Duration::ZERO);
        assert!(timeout(Duration::from_secs(120), scheduler.next()).await.is_err());

        // The requeue recorded during the run fires right after completion.
        let next = scheduler.complete(&key("a"), MINUTE);
        assert_eq!(next, Some(Duration::ZERO));
        assert_eq!(scheduler.next().await, Some(key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_trigger_during_run_is_applied_on_complete() {
        let scheduler = Scheduler::new();
        scheduler.seed(key("a"), MINUTE, Instant::now());
        assert_eq!(scheduler.next().await, Some(key("a")));

        advance(Duration::from_secs(5)).await;
        scheduler.trigger(&key("a"));
        advance(Duration::from_secs(5)).await;

        // Next allowed evaluation is 60s after the run started, earlier than
        // the 60s requeue from completion.
        assert_eq!(
            scheduler.complete(&key("a"), MINUTE),
            Some(Duration::from_secs(50))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_requeue_bypasses_debounce() {
        let scheduler = Scheduler::new();
        scheduler.seed(key("a"), MINUTE, Instant::now());
        assert_eq!(scheduler.next().await, Some(key("a")));
        scheduler.complete(&key("a"), Duration::from_secs(5));

        let started = Instant::now();
        assert_eq!(scheduler.next().await, Some(key("a")));
        assert_eq!(Instant::now() - started, Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_observe_seeds_from_last_applied_time() {
        let scheduler = Scheduler::new();
        let last_applied = Utc::now() - chrono::Duration::seconds(45);
        scheduler.observe(key("a"), MINUTE, Some(last_applied));

        let due = scheduler.due_in(&key("a")).unwrap();
        assert!(due <= Duration::from_secs(15) && due >= Duration::from_secs(14));

        // A watch replay right after restart does not pull it forward.
        scheduler.observe(key("a"), MINUTE, Some(last_applied));
        assert!(scheduler.due_in(&key("a")).unwrap() >= Duration::from_secs(14));

        // Never applied: due immediately.
        scheduler.observe(key("b"), MINUTE, None);
        assert_eq!(scheduler.due_in(&key("b")), Some(Duration::ZERO));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_run_in_due_order() {
        let scheduler = Scheduler::new();
        let now = Instant::now();
        scheduler.seed(key("late"), MINUTE, now + Duration::from_secs(2));
        scheduler.seed(key("early"), MINUTE, now + Duration::from_secs(1));

        assert_eq!(scheduler.next().await, Some(key("early")));
        assert_eq!(scheduler.next().await, Some(key("late")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recreated_key_waits_for_forgotten_run() {
        let scheduler = Scheduler::new();
        scheduler.seed(key("a"), MINUTE, Instant::now());
        assert_eq!(scheduler.next().await, Some(key("a")));

        // Deleted and recreated under the same name while the first run is
        // still in flight.
        assert!(scheduler.forget(&key("a")));
        assert!(!scheduler.contains(&key("a")));
        scheduler.observe(key("a"), MINUTE, None);
        assert!(scheduler.contains(&key("a")));
        assert!(scheduler.is_running(&key("a")));
        assert!(timeout(Duration::from_secs(1), scheduler.next()).await.is_err());

        // The old run ends on the gone policy; the recreated one runs next.
        scheduler.retire(&key("a"));
        assert!(!scheduler.is_running(&key("a")));
        assert_eq!(scheduler.next().await, Some(key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forgotten_run_is_dropped_on_complete() {
        let scheduler = Scheduler::new();
        scheduler.seed(key("a"), MINUTE, Instant::now());
        assert_eq!(scheduler.next().await, Some(key("a")));

        assert!(scheduler.forget(&key("a")));
        assert!(!scheduler.trigger(&key("a")));
        assert_eq!(scheduler.complete(&key("a"), MINUTE), None);
        assert!(scheduler.is_empty());
        assert!(!scheduler.is_running(&key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_and_close() {
        let scheduler = Arc::new(Scheduler::new());
        scheduler.seed(key("a"), MINUTE, Instant::now() + MINUTE);
        assert!(scheduler.forget(&key("a")));
        assert!(!scheduler.trigger(&key("a")));
        assert!(scheduler.is_empty());

        let waiter = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move { scheduler.next().await })
        };
        tokio::task::yield_now().await;
        scheduler.close();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
