//! meshwire queue: reconcile requests keyed by object identity.
//!
//! A request that is already pending is not queued twice. A request being processed
//! is parked in `dirty` and re-queued when the worker calls [`WorkQueue::done`].

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use meshwire_core::ReconcileRequest;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, info};

/// Outbound edge used by event handlers. Fire-and-forget.
pub trait Enqueue: Send + Sync {
    fn enqueue(&self, req: ReconcileRequest);
}

/// Per-key exponential backoff for [`WorkQueue::add_rate_limited`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(5), max_delay: Duration::from_secs(1000) }
    }
}

impl QueueConfig {
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Default)]
struct State {
    order: VecDeque<ReconcileRequest>,
    dirty: FxHashSet<ReconcileRequest>,
    processing: FxHashSet<ReconcileRequest>,
    failures: FxHashMap<ReconcileRequest, u32>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: String,
    cfg: QueueConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, QueueConfig::default())
    }

    pub fn with_config(name: impl Into<String>, cfg: QueueConfig) -> Self {
        Self { name: name.into(), cfg, state: Mutex::new(State::default()), notify: Notify::new() }
    }

    pub fn name(&self) -> &str { &self.name }

    /// Number of requests waiting to be handed out.
    pub fn len(&self) -> usize { self.state().order.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn add(&self, req: ReconcileRequest) {
        let mut st = self.state();
        if st.shutting_down || st.dirty.contains(&req) {
            return;
        }
        st.dirty.insert(req.clone());
        metrics::counter!("queue_adds_total", 1u64, "queue" => self.name.clone());
        if st.processing.contains(&req) {
            debug!(queue = %self.name, key = %req.key, "parked while processing");
            return;
        }
        st.order.push_back(req);
        metrics::gauge!("queue_depth", st.order.len() as f64, "queue" => self.name.clone());
        drop(st);
        self.notify.notify_one();
    }

    /// Wait for the next request. Returns `None` once shut down and drained.
    pub async fn get(&self) -> Option<ReconcileRequest> {
        loop {
            let notified = self.notify.notified();
            {
                let mut st = self.state();
                if let Some(req) = st.order.pop_front() {
                    st.dirty.remove(&req);
                    st.processing.insert(req.clone());
                    metrics::gauge!("queue_depth", st.order.len() as f64, "queue" => self.name.clone());
                    return Some(req);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark processing finished; a request added meanwhile is queued again.
    pub fn done(&self, req: &ReconcileRequest) {
        let mut st = self.state();
        st.processing.remove(req);
        if st.dirty.contains(req) {
            st.order.push_back(req.clone());
            drop(st);
            self.notify.notify_one();
        }
    }

    /// Re-add after the key's current backoff and bump its failure count.
    pub fn add_rate_limited(self: &Arc<Self>, req: ReconcileRequest) {
        let delay = {
            let mut st = self.state();
            let n = st.failures.entry(req.clone()).or_insert(0);
            let delay = self.cfg.backoff(*n);
            *n = n.saturating_add(1);
            delay
        };
        metrics::counter!("queue_retries_total", 1u64, "queue" => self.name.clone());
        let me = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            me.add(req);
        });
    }

    /// Reset the failure count of a request.
    pub fn forget(&self, req: &ReconcileRequest) {
        self.state().failures.remove(req);
    }

    pub fn num_requeues(&self, req: &ReconcileRequest) -> u32 {
        self.state().failures.get(req).copied().unwrap_or(0)
    }

    /// Stop accepting requests; getters drain what is left and then see `None`.
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        info!(queue = %self.name, "queue shutting down");
        self.notify.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Enqueue for WorkQueue {
    fn enqueue(&self, req: ReconcileRequest) {
        self.add(req);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = QueueConfig { base_delay: Duration::from_millis(10), max_delay: Duration::from_millis(50) };
        assert_eq!(cfg.backoff(0), Duration::from_millis(10));
        assert_eq!(cfg.backoff(1), Duration::from_millis(20));
        assert_eq!(cfg.backoff(2), Duration::from_millis(40));
        assert_eq!(cfg.backoff(3), Duration::from_millis(50));
        assert_eq!(cfg.backoff(64), Duration::from_millis(50));
    }
}
