//! meshwire bridge: turns lifecycle events of a dependency kind into reconcile requests
//! for the objects that reference it.
//!
//! Only updates that a [`RelevancePredicate`] accepts fan out; everything else is dropped
//! here so dependency status churn does not reach the dependents' queue.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshwire_core::{DependencyKind, LifecycleEvent, ObjectKey, ObjectState, ReconcileRequest};
use meshwire_index::{IndexError, ReferenceIndex};
use meshwire_queue::Enqueue;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

mod diag;
mod dispatch;
mod predicate;

pub use diag::{Diagnostic, DiagnosticSink, TracingSink};
pub use dispatch::spawn_dispatch;
pub use predicate::{condition_true, ConditionChanged, PredicateRegistry, RelevancePredicate};

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("malformed update event: old {old} and new {new} differ in identity")]
    MalformedEvent { old: ObjectKey, new: ObjectKey },
    #[error("no relevance predicate registered for {0}")]
    NoPredicate(DependencyKind),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// What to do when a dependency object is deleted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeletePolicy {
    /// Dependents are left to their own finalizer/owner cleanup path.
    #[default]
    Ignore,
    EnqueueDependents,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Upper bound for one index lookup; `None` waits for the caller's cancellation only.
    pub fetch_timeout: Option<Duration>,
    pub delete_policy: DeletePolicy,
}

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Event class never triggers dependents.
    Ignored,
    /// Predicate said the transition is irrelevant.
    Filtered,
    Enqueued(usize),
    /// Lookup failed; reported, nothing enqueued.
    Failed,
    Malformed,
}

/// Lifecycle callbacks for one watched kind.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    fn on_create(&self, state: &ObjectState) -> Outcome;

    async fn on_update(&self, old: &ObjectState, new: &ObjectState, cancel: &CancellationToken) -> Outcome;

    async fn on_delete(&self, state: &ObjectState, cancel: &CancellationToken) -> Outcome;

    fn on_generic(&self, marker: Option<&ObjectKey>) -> Outcome;

    async fn handle(&self, event: LifecycleEvent, cancel: &CancellationToken) -> Outcome {
        match event {
            LifecycleEvent::Created(state) => self.on_create(&state),
            LifecycleEvent::Updated { old, new } => self.on_update(&old, &new, cancel).await,
            LifecycleEvent::Deleted(state) => self.on_delete(&state, cancel).await,
            LifecycleEvent::Resynced(marker) => self.on_generic(marker.as_ref()),
        }
    }
}

/// Bridge for one (dependency kind, relevance predicate) pair. Holds no mutable state.
pub struct SelectiveBridge {
    kind: DependencyKind,
    predicate: Arc<dyn RelevancePredicate>,
    index: Arc<dyn ReferenceIndex>,
    queue: Arc<dyn Enqueue>,
    sink: Arc<dyn DiagnosticSink>,
    cfg: BridgeConfig,
}

impl SelectiveBridge {
    pub fn new(
        kind: DependencyKind,
        predicate: Arc<dyn RelevancePredicate>,
        index: Arc<dyn ReferenceIndex>,
        queue: Arc<dyn Enqueue>,
    ) -> Self {
        Self { kind, predicate, index, queue, sink: Arc::new(TracingSink), cfg: BridgeConfig::default() }
    }

    pub fn from_registry(
        registry: &PredicateRegistry,
        kind: DependencyKind,
        index: Arc<dyn ReferenceIndex>,
        queue: Arc<dyn Enqueue>,
    ) -> Result<Self, BridgeError> {
        let predicate = registry.get(kind).ok_or(BridgeError::NoPredicate(kind))?;
        Ok(Self::new(kind, predicate, index, queue))
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_config(mut self, cfg: BridgeConfig) -> Self {
        self.cfg = cfg;
        self
    }

    pub fn kind(&self) -> DependencyKind { self.kind }

    async fn fetch_dependents(
        &self,
        dependency: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Result<BTreeSet<ObjectKey>, IndexError> {
        let lookup = self.index.fetch(self.kind, dependency);
        let bounded = async {
            match self.cfg.fetch_timeout {
                Some(limit) => tokio::time::timeout(limit, lookup)
                    .await
                    .unwrap_or_else(|_| Err(IndexError::Timeout(limit))),
                None => lookup.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(IndexError::Cancelled),
            res = bounded => res,
        }
    }

    async fn enqueue_dependents(
        &self,
        operation: &'static str,
        dependency: &ObjectKey,
        cancel: &CancellationToken,
    ) -> Outcome {
        let started = Instant::now();
        let fetched = self.fetch_dependents(dependency, cancel).await;
        metrics::histogram!("bridge_fetch_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => self.kind.as_str());
        match fetched {
            Ok(dependents) => {
                let n = dependents.len();
                for key in dependents {
                    trace!(kind = %self.kind, dependency = %dependency, dependent = %key, "enqueue");
                    self.queue.enqueue(ReconcileRequest::from(key));
                }
                metrics::counter!("bridge_enqueued_total", n as u64, "kind" => self.kind.as_str());
                debug!(kind = %self.kind, dependency = %dependency, dependents = n, operation, "dependents enqueued");
                Outcome::Enqueued(n)
            }
            Err(e) => {
                self.sink.report(Diagnostic {
                    operation,
                    kind: self.kind,
                    dependency: dependency.clone(),
                    error: BridgeError::Index(e),
                });
                Outcome::Failed
            }
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for SelectiveBridge {
    /// A new dependency has no transition to compare yet; dependents are picked up through
    /// their own events or the index's initial population.
    fn on_create(&self, _state: &ObjectState) -> Outcome {
        Outcome::Ignored
    }

    async fn on_update(&self, old: &ObjectState, new: &ObjectState, cancel: &CancellationToken) -> Outcome {
        debug_assert_eq!(old.key, new.key, "update event must carry a single identity");
        if old.key != new.key {
            self.sink.report(Diagnostic {
                operation: "update",
                kind: self.kind,
                dependency: new.key.clone(),
                error: BridgeError::MalformedEvent { old: old.key.clone(), new: new.key.clone() },
            });
            return Outcome::Malformed;
        }
        if !self.predicate.is_relevant(old, new) {
            metrics::counter!("bridge_events_filtered_total", 1u64, "kind" => self.kind.as_str());
            trace!(kind = %self.kind, dependency = %new.key, predicate = self.predicate.name(), "irrelevant update");
            return Outcome::Filtered;
        }
        self.enqueue_dependents("update", &new.key, cancel).await
    }

    async fn on_delete(&self, state: &ObjectState, cancel: &CancellationToken) -> Outcome {
        match self.cfg.delete_policy {
            DeletePolicy::Ignore => Outcome::Ignored,
            DeletePolicy::EnqueueDependents => self.enqueue_dependents("delete", &state.key, cancel).await,
        }
    }

    fn on_generic(&self, _marker: Option<&ObjectKey>) -> Outcome {
        Outcome::Ignored
    }
}
