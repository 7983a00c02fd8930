//! Collection registry.
//!
//! A [`Bucket`] owns every open collection: its store handle, its cache, its
//! change feed and its replication. Collections are opened lazily by name and
//! released together on close.

use crate::error::{EngineError, EngineResult};
use crate::memory::MemoryStore;
use crate::mirror::Mirror;
use crate::query::QueryView;
use crate::reconciler::{fire, FeedHandle, FeedState, Reconciler};
use crate::replication::{ReplicationState, ReplicationStats, ReplicationSupervisor};
use crate::store::{DocumentStore, StoreHandle, StoreTarget};
use docmirror_core::{
    BucketConfig, CancelFn, CollectionConfig, DirectSet, Document, EffectiveConfig, Notice, OrderedCache, Predicate,
    ReactiveSet, Source,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builder for [`Bucket`].
#[derive(Default)]
pub struct BucketBuilder {
    config: Option<BucketConfig>,
    store: Option<Arc<dyn DocumentStore>>,
    runtime: Option<Handle>,
    setter: Option<Arc<dyn ReactiveSet>>,
}

impl BucketBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the bucket configuration. Required.
    #[must_use]
    pub fn config(mut self, config: BucketConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Sets the document store. Defaults to a fresh [`MemoryStore`].
    #[must_use]
    pub fn store(mut self, store: impl DocumentStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Sets a shared document store.
    #[must_use]
    pub fn shared_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the runtime background tasks are spawned on. Defaults to the
    /// runtime the bucket is built in.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the slot writer used by every cache.
    #[must_use]
    pub fn reactive_set(mut self, setter: Arc<dyn ReactiveSet>) -> Self {
        self.setter = Some(setter);
        self
    }

    /// Builds the bucket.
    pub fn build(self) -> EngineResult<Bucket> {
        let config = self.config.ok_or(EngineError::ConfigMissing)?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| EngineError::NoRuntime)?,
        };
        Ok(Bucket {
            inner: Arc::new(BucketInner {
                config,
                store: self
                    .store
                    .unwrap_or_else(|| Arc::new(MemoryStore::new())),
                runtime,
                setter: self.setter.unwrap_or_else(|| Arc::new(DirectSet)),
                collections: RwLock::new(HashMap::new()),
            }),
        })
    }
}

/// Registry of open collections. Cheap to clone.
#[derive(Clone)]
pub struct Bucket {
    inner: Arc<BucketInner>,
}

struct BucketInner {
    config: BucketConfig,
    store: Arc<dyn DocumentStore>,
    runtime: Handle,
    setter: Arc<dyn ReactiveSet>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
}

/// Everything owned by one open collection.
struct Collection {
    name: String,
    debounce: Duration,
    handle: Arc<dyn StoreHandle>,
    local: Option<Local>,
}

/// Parts that exist only for locally mirrored collections.
struct Local {
    mirror: Arc<Mirror>,
    feed: FeedHandle,
    replication: Option<ReplicationSupervisor>,
    fetch: Mutex<Option<JoinHandle<()>>>,
}

impl Collection {
    /// Stops feed and replication without closing the handle.
    fn cancel_sync(&self) {
        if let Some(local) = &self.local {
            local.feed.cancel();
            if let Some(replication) = &local.replication {
                replication.stop();
            }
        }
    }

    async fn release(&self) -> EngineResult<()> {
        if let Some(local) = &self.local {
            local.mirror.close();
            self.cancel_sync();
            if let Some(fetch) = local.fetch.lock().take() {
                fetch.abort();
            }
        }
        match self.handle.close().await {
            Ok(()) => {
                info!(collection = %self.name, "collection closed");
                Ok(())
            }
            Err(err) => {
                warn!(collection = %self.name, error = %err, "store handle failed to close");
                Err(EngineError::close_failure(&self.name, err.to_string()))
            }
        }
    }
}

impl Bucket {
    /// Returns a builder.
    pub fn builder() -> BucketBuilder {
        BucketBuilder::new()
    }

    /// The bucket configuration.
    pub fn config(&self) -> &BucketConfig {
        &self.inner.config
    }

    /// Effective configuration of `name`.
    pub fn effective(&self, name: &str) -> EffectiveConfig {
        self.inner.config.effective(name)
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub(crate) fn debounce_for(&self, name: &str) -> Duration {
        match self.collection(name) {
            Ok(collection) => collection.debounce,
            Err(_) => self.effective(name).debounce(),
        }
    }

    fn collection(&self, name: &str) -> EngineResult<Arc<Collection>> {
        self.inner
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::not_found(name))
    }

    fn local<R>(&self, name: &str, f: impl FnOnce(&Local) -> R) -> EngineResult<R> {
        let collection = self.collection(name)?;
        let local = collection
            .local
            .as_ref()
            .ok_or_else(|| EngineError::remote_only(name))?;
        Ok(f(local))
    }

    /// Opens `name`, or returns the handle of the already open collection.
    ///
    /// For a mirrored collection this subscribes to the change feed, starts
    /// the initial fetch and, when a remote is configured, replication. The
    /// fetch runs in the background, so the cache may still be empty when
    /// this returns.
    pub fn open(&self, name: &str) -> EngineResult<Arc<dyn StoreHandle>> {
        self.open_with(name, CollectionConfig::default())
    }

    /// Like [`Bucket::open`], with `overrides` layered over the bucket's
    /// configuration of `name`.
    ///
    /// The overrides only apply when this call creates the collection; an
    /// already open collection keeps the configuration it was opened with.
    pub fn open_with(
        &self,
        name: &str,
        overrides: CollectionConfig,
    ) -> EngineResult<Arc<dyn StoreHandle>> {
        if let Ok(collection) = self.collection(name) {
            return Ok(Arc::clone(&collection.handle));
        }

        let effective = self.effective(name).with_overrides(&overrides);
        let collection = {
            let mut collections = self.inner.collections.write();
            if let Some(existing) = collections.get(name) {
                return Ok(Arc::clone(&existing.handle));
            }
            let collection = self.create(&effective)?;
            collections.insert(name.to_string(), Arc::clone(&collection));
            collection
        };

        if collection.local.is_some() {
            let weak: Weak<Collection> = Arc::downgrade(&collection);
            let cancel: CancelFn = Arc::new(move || {
                if let Some(collection) = weak.upgrade() {
                    collection.cancel_sync();
                }
            });
            fire(&effective.callbacks().cancel, name, &cancel);
        }
        Ok(Arc::clone(&collection.handle))
    }

    fn create(&self, effective: &EffectiveConfig) -> EngineResult<Arc<Collection>> {
        let name = effective.name();
        let store = &self.inner.store;

        if effective.remote_only() {
            let url = effective.remote_url().ok_or_else(|| {
                EngineError::store_fatal(format!("{name} is remote-only but no remote is configured"))
            })?;
            let handle = store.open(&StoreTarget::Remote(url.clone()), effective.store())?;
            info!(collection = %name, remote = %url, "opened remote-only collection");
            return Ok(Arc::new(Collection {
                name: name.to_string(),
                debounce: effective.debounce(),
                handle,
                local: None,
            }));
        }

        let handle = store.open(&StoreTarget::Local(name.to_string()), effective.store())?;
        let mirror = Arc::new(Mirror::new(name, Arc::clone(&self.inner.setter)));
        let callbacks = effective.callbacks().clone();

        // Subscribe before fetching so nothing written during the fetch is missed
        let reconciler = Arc::new(Reconciler::new(Arc::clone(&mirror), callbacks.clone()));
        reconciler.subscribing();
        let stream = match handle.changes(effective.changes()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!(collection = %name, error = %err, "change feed subscription failed");
                let handle = Arc::clone(&handle);
                let name = name.to_string();
                self.inner.runtime.spawn(async move {
                    if let Err(err) = handle.close().await {
                        warn!(collection = %name, error = %err, "store handle failed to close");
                    }
                });
                return Err(err);
            }
        };
        let feed = FeedHandle::spawn(&self.inner.runtime, reconciler, stream);

        let fetch = self.inner.runtime.spawn(initial_fetch(
            Arc::clone(&handle),
            Arc::clone(&mirror),
            effective.clone(),
        ));

        let replication = effective.remote_url().map(|url| {
            ReplicationSupervisor::start(
                &self.inner.runtime,
                Arc::clone(store),
                name,
                url,
                effective.sync().clone(),
                callbacks,
            )
        });

        info!(collection = %name, replicated = replication.is_some(), "opened collection");
        Ok(Arc::new(Collection {
            name: name.to_string(),
            debounce: effective.debounce(),
            handle,
            local: Some(Local {
                mirror,
                feed,
                replication,
                fetch: Mutex::new(Some(fetch)),
            }),
        }))
    }

    /// Returns a snapshot of the cache of `name`.
    pub fn get(&self, name: &str) -> EngineResult<Vec<Document>> {
        self.local(name, |local| local.mirror.snapshot())
    }

    /// Runs `f` against the cache of `name` without copying it.
    ///
    /// The cache is lent read-only; it cannot be swapped out wholesale:
    ///
    /// ```compile_fail
    /// use docmirror_core::OrderedCache;
    /// # fn demo(bucket: &docmirror_engine::Bucket) {
    /// bucket.with_cache("projects", |cache| *cache = OrderedCache::new());
    /// # }
    /// ```
    pub fn with_cache<R>(&self, name: &str, f: impl FnOnce(&OrderedCache) -> R) -> EngineResult<R> {
        self.local(name, |local| local.mirror.read(f))
    }

    /// Returns the store handle of `name`.
    pub fn db(&self, name: &str) -> EngineResult<Arc<dyn StoreHandle>> {
        Ok(Arc::clone(&self.collection(name)?.handle))
    }

    /// Closes `name`. Closing a collection that is not open does nothing.
    ///
    /// Feed, replication and fetch are always released. If the store handle
    /// fails to close, the error is returned afterwards.
    pub async fn close(&self, name: &str) -> EngineResult<()> {
        let removed = self.inner.collections.write().remove(name);
        match removed {
            Some(collection) => collection.release().await,
            None => {
                debug!(collection = %name, "close of unopened collection ignored");
                Ok(())
            }
        }
    }

    /// Closes every collection. Returns the first close failure.
    pub async fn shutdown(&self) -> EngineResult<()> {
        let collections: Vec<Arc<Collection>> = self
            .inner
            .collections
            .write()
            .drain()
            .map(|(_, collection)| collection)
            .collect();
        let mut first_error = None;
        for collection in collections {
            if let Err(err) = collection.release().await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Snapshots of every mirrored collection, by name.
    pub fn state(&self) -> BTreeMap<String, Vec<Document>> {
        self.inner
            .collections
            .read()
            .iter()
            .filter_map(|(name, collection)| {
                let local = collection.local.as_ref()?;
                Some((name.clone(), local.mirror.snapshot()))
            })
            .collect()
    }

    /// Receiver of a version counter bumped after each cache change.
    pub fn watch(&self, name: &str) -> EngineResult<watch::Receiver<u64>> {
        self.local(name, |local| local.mirror.subscribe())
    }

    /// Names of open collections, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Returns true if `name` is open.
    pub fn is_open(&self, name: &str) -> bool {
        self.inner.collections.read().contains_key(name)
    }

    /// Change feed state of `name`.
    pub fn feed_state(&self, name: &str) -> EngineResult<FeedState> {
        self.local(name, |local| local.feed.state())
    }

    /// Replication state of `name`, `None` when it has no remote.
    pub fn replication_state(&self, name: &str) -> EngineResult<Option<ReplicationState>> {
        self.local(name, |local| local.replication.as_ref().map(|r| r.state()))
    }

    /// Replication statistics of `name`, `None` when it has no remote.
    pub fn replication_stats(&self, name: &str) -> EngineResult<Option<ReplicationStats>> {
        self.local(name, |local| local.replication.as_ref().map(|r| r.stats()))
    }

    /// Waits until replication of `name` reaches a terminal state.
    pub async fn wait_replication(&self, name: &str) -> EngineResult<Option<ReplicationState>> {
        let collection = self.collection(name)?;
        let local = collection
            .local
            .as_ref()
            .ok_or_else(|| EngineError::remote_only(name))?;
        match &local.replication {
            Some(replication) => Ok(Some(replication.wait().await)),
            None => Ok(None),
        }
    }

    /// Defines a query view over this bucket.
    pub fn define(&self, predicate: impl Predicate + 'static) -> QueryView {
        QueryView::new(self.clone(), Arc::new(predicate))
    }
}

impl std::fmt::Debug for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bucket")
            .field("collections", &self.names())
            .finish_non_exhaustive()
    }
}

/// Loads the current documents into a fresh cache.
async fn initial_fetch(handle: Arc<dyn StoreHandle>, mirror: Arc<Mirror>, effective: EffectiveConfig) {
    let name = effective.name();
    match handle.all_docs(effective.all_docs()).await {
        Ok(docs) => {
            let fetched = docs.len();
            match mirror.mutate(|cache| cache.extend(docs)) {
                Some(changed) => debug!(collection = %name, fetched, changed, "initial fetch applied"),
                None => debug!(collection = %name, fetched, "initial fetch discarded after close"),
            }
        }
        Err(err) => {
            if mirror.is_closed() {
                return;
            }
            warn!(collection = %name, error = %err, "initial fetch failed");
            fire(
                &effective.callbacks().on_error,
                name,
                &Notice::with_message(Source::Feed, err.to_string()),
            );
        }
    }
}
