//! meshwire index: queryable mapping from a referenced object to the objects referencing it.
//!
//! Readers go through [`ReferenceIndex::fetch`]. [`MemoryIndex`] is the in-process
//! implementation, kept current by [`spawn_indexer`] from the dependents' watch stream.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use meshwire_core::{DependencyKind, LifecycleEvent, ObjectKey};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tracing::{debug, info};

mod extract;

pub use extract::{Reference, ReferenceExtractor, References, VirtualServiceReferences};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("reference index unavailable: {0}")]
    Unavailable(String),
    #[error("lookup cancelled")]
    Cancelled,
    #[error("lookup timed out after {0:?}")]
    Timeout(Duration),
}

/// Read side of the reference index.
///
/// `fetch` returns an empty set when nothing references `referenced`; errors are reserved
/// for genuine lookup failures.
#[async_trait::async_trait]
pub trait ReferenceIndex: Send + Sync {
    async fn fetch(
        &self,
        kind: DependencyKind,
        referenced: &ObjectKey,
    ) -> Result<BTreeSet<ObjectKey>, IndexError>;
}

type IndexKey = (DependencyKind, ObjectKey);

#[derive(Debug, Clone, Default)]
struct IndexSnapshot {
    /// referrer -> what it currently references
    forward: FxHashMap<ObjectKey, Vec<IndexKey>>,
    /// (kind, referenced) -> referrers
    reverse: FxHashMap<IndexKey, FxHashSet<ObjectKey>>,
}

impl IndexSnapshot {
    fn unlink(&mut self, referrer: &ObjectKey) {
        let Some(prev) = self.forward.remove(referrer) else { return };
        for key in prev {
            if let Some(set) = self.reverse.get_mut(&key) {
                set.remove(referrer);
                if set.is_empty() {
                    self.reverse.remove(&key);
                }
            }
        }
    }

    fn link(&mut self, referrer: &ObjectKey, refs: Vec<IndexKey>) {
        if refs.is_empty() {
            return;
        }
        for key in refs.iter() {
            self.reverse.entry(key.clone()).or_default().insert(referrer.clone());
        }
        self.forward.insert(referrer.clone(), refs);
    }
}

/// In-memory reference index. Reads load an immutable snapshot; writes are serialized,
/// applied to a copy and published atomically, so a reader never sees a half-applied write.
pub struct MemoryIndex {
    snap: ArcSwap<IndexSnapshot>,
    write: Mutex<()>,
}

impl Default for MemoryIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self { snap: ArcSwap::from_pointee(IndexSnapshot::default()), write: Mutex::new(()) }
    }

    /// Replace the full reference list declared by `referrer`.
    pub fn set_references<I>(&self, referrer: &ObjectKey, refs: I)
    where
        I: IntoIterator<Item = Reference>,
    {
        let mut keys: Vec<IndexKey> = refs.into_iter().map(|r| (r.kind, r.target)).collect();
        keys.sort_unstable();
        keys.dedup();
        self.mutate(|snap| {
            snap.unlink(referrer);
            snap.link(referrer, keys);
        });
    }

    pub fn remove_referrer(&self, referrer: &ObjectKey) {
        self.mutate(|snap| snap.unlink(referrer));
    }

    /// Synchronous read of the current snapshot, sorted.
    pub fn referrers_of(&self, kind: DependencyKind, referenced: &ObjectKey) -> BTreeSet<ObjectKey> {
        let snap = self.snap.load();
        snap.reverse
            .get(&(kind, referenced.clone()))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of referrers with at least one reference.
    pub fn len(&self) -> usize {
        self.snap.load().forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mutate(&self, f: impl FnOnce(&mut IndexSnapshot)) {
        // A poisoned guard protects no data of its own; keep publishing.
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snap.load_full();
        let mut next = IndexSnapshot::clone(&current);
        f(&mut next);
        metrics::gauge!("index_referrers", next.forward.len() as f64);
        metrics::gauge!("index_keys", next.reverse.len() as f64);
        self.snap.store(Arc::new(next));
    }
}

#[async_trait::async_trait]
impl ReferenceIndex for MemoryIndex {
    async fn fetch(
        &self,
        kind: DependencyKind,
        referenced: &ObjectKey,
    ) -> Result<BTreeSet<ObjectKey>, IndexError> {
        Ok(self.referrers_of(kind, referenced))
    }
}

/// Keep `index` in sync with the lifecycle stream of the referencing kind.
/// Runs until the sender side is dropped.
pub fn spawn_indexer<E>(
    index: Arc<MemoryIndex>,
    extractor: E,
    mut rx: mpsc::Receiver<LifecycleEvent>,
) -> tokio::task::JoinHandle<()>
where
    E: ReferenceExtractor + 'static,
{
    tokio::spawn(async move {
        while let Some(ev) = rx.recv().await {
            apply_event(&index, &extractor, ev);
        }
        info!(referrers = index.len(), "indexer stopped");
    })
}

/// Apply one lifecycle event of a referencing object to the index.
pub fn apply_event<E: ReferenceExtractor + ?Sized>(index: &MemoryIndex, extractor: &E, ev: LifecycleEvent) {
    match ev {
        LifecycleEvent::Created(state) | LifecycleEvent::Updated { new: state, .. } => {
            let refs = extractor.extract(&state);
            debug!(referrer = %state.key, refs = refs.len(), "index references");
            index.set_references(&state.key, refs);
        }
        LifecycleEvent::Deleted(state) => {
            debug!(referrer = %state.key, "index remove");
            index.remove_referrer(&state.key);
        }
        LifecycleEvent::Resynced(_) => {}
    }
}
