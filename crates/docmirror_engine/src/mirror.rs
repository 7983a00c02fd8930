//! Per-collection cache with a single mutation lane.

use docmirror_core::{Document, OrderedCache, ReactiveSet};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// The cache of one open collection.
///
/// The initial fetch and the change feed both mutate the cache, and only
/// while holding its lock. Once closed, every mutation is discarded.
pub(crate) struct Mirror {
    name: String,
    cache: Mutex<OrderedCache>,
    closed: AtomicBool,
    version: watch::Sender<u64>,
}

impl Mirror {
    pub(crate) fn new(name: impl Into<String>, setter: Arc<dyn ReactiveSet>) -> Self {
        let (version, _) = watch::channel(0);
        Self {
            name: name.into(),
            cache: Mutex::new(OrderedCache::with_setter(setter)),
            closed: AtomicBool::new(false),
            version,
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Runs `f` on the cache. `f` returns how many entries it changed.
    ///
    /// Returns `None` without running `f` if the mirror is closed.
    pub(crate) fn mutate(&self, f: impl FnOnce(&mut OrderedCache) -> usize) -> Option<usize> {
        let mut cache = self.cache.lock();
        // Checked under the lock so close() cannot slip in between
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        let changed = f(&mut cache);
        if changed > 0 {
            self.version.send_modify(|version| *version += 1);
        }
        Some(changed)
    }

    pub(crate) fn snapshot(&self) -> Vec<Document> {
        self.cache.lock().snapshot()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&OrderedCache) -> R) -> R {
        f(&self.cache.lock())
    }

    pub(crate) fn close(&self) {
        let _cache = self.cache.lock();
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

impl std::fmt::Debug for Mirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mirror")
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .field("version", &*self.version.borrow())
            .finish_non_exhaustive()
    }
}
