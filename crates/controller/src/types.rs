use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::ControllerConfig;
use crate::crds::TargetKind;
use crate::executor::{Backoff, Executor, HandlerRegistry, TargetClient};
use crate::metrics::ControllerMetrics;
use crate::scheduler::Scheduler;
use crate::source::{MetricSource, SourceError, StatusSource};
use crate::store::{PolicyStore, StoreError};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Policy store error: {0}")]
    Store(#[from] StoreError),

    #[error("Live state error: {0}")]
    Source(#[from] SourceError),

    #[error("Reconcile cycle exceeded its {0:?} deadline")]
    DeadlineExceeded(Duration),

    #[error("Status write for {key} lost {attempts} consecutive conflicts")]
    ConflictRetriesExhausted { key: PolicyKey, attempts: u32 },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Source(e) => e.is_transient(),
            Self::DeadlineExceeded(_) | Self::ConflictRetriesExhausted { .. } => true,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identity of a policy object: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyKey {
    pub namespace: String,
    pub name: String,
}

impl PolicyKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PolicyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A `targetRef` with its namespace filled in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolvedTarget {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResolvedTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Shared state handed to every reconcile cycle.
pub struct Context {
    pub store: Arc<dyn PolicyStore>,
    pub status_source: Arc<dyn StatusSource>,
    pub metric_source: Arc<dyn MetricSource>,
    pub executor: Executor,
    pub scheduler: Scheduler,
    pub notifier: notify::Notifier,
    pub config: Arc<ControllerConfig>,
    pub metrics: ControllerMetrics,
    error_backoff: Backoff,
    failures: DashMap<PolicyKey, u32>,
    ready: AtomicBool,
}

impl Context {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        status_source: Arc<dyn StatusSource>,
        metric_source: Arc<dyn MetricSource>,
        target_client: Arc<dyn TargetClient>,
        notifier: notify::Notifier,
        config: ControllerConfig,
    ) -> Self {
        Self::with_handlers(
            store,
            status_source,
            metric_source,
            target_client,
            HandlerRegistry::with_builtins(),
            notifier,
            config,
        )
    }

    pub fn with_handlers(
        store: Arc<dyn PolicyStore>,
        status_source: Arc<dyn StatusSource>,
        metric_source: Arc<dyn MetricSource>,
        target_client: Arc<dyn TargetClient>,
        handlers: HandlerRegistry,
        notifier: notify::Notifier,
        config: ControllerConfig,
    ) -> Self {
        let error_backoff = Backoff::new(
            Duration::from_secs(config.reconcile.error_backoff_base_seconds),
            Duration::from_secs(config.reconcile.error_backoff_max_seconds),
        );
        Self {
            store,
            status_source,
            metric_source,
            executor: Executor::new(target_client, handlers, &config.executor),
            scheduler: Scheduler::new(),
            notifier,
            config: Arc::new(config),
            metrics: ControllerMetrics::default(),
            error_backoff,
            failures: DashMap::new(),
            ready: AtomicBool::new(false),
        }
    }

    /// Record a failed cycle and return how long to wait before the next one.
    pub fn next_error_backoff(&self, key: &PolicyKey) -> Duration {
        let mut failures = self.failures.entry(key.clone()).or_insert(0);
        let delay = self.error_backoff.delay(*failures);
        *failures = failures.saturating_add(1);
        delay
    }

    pub fn clear_failures(&self, key: &PolicyKey) {
        self.failures.remove(key);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }
}
