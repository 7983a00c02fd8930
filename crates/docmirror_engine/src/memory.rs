//! In-memory document store.
//!
//! [`MemoryStore`] implements [`DocumentStore`] without any I/O. Local names
//! and remote URLs share one namespace of databases, so a "remote" is just
//! another in-memory database that replication copies to and from.
//!
//! Revisions follow the CouchDB shape `{generation}-{digest}`, where the
//! digest is a SHA-256 prefix over the previous revision and the new body.
//! Local writes must name the current revision or they fail with
//! `conflict`. Replicated writes keep their revision and win when their
//! generation (then revision string) is higher.
//!
//! Named filters cannot be executed here. When a feed or replication leg has
//! a `filter`, its `query_params` are applied as field equality instead.
//! Deletions always pass filters.
//!
//! Faults can be injected per database address for tests: failing closes,
//! failing fetches, change feeds and writes, refusing replicated documents,
//! delaying fetches, and queued replication session failures.

use crate::error::{EngineError, EngineResult};
use crate::store::{
    ChangeStream, DocumentStore, ReplicationSession, StoreHandle, StoreTarget, WriteResult,
};
use async_trait::async_trait;
use docmirror_core::{
    Change, ChangesComplete, ChangesOptions, Direction, DirectionOptions, Document, FeedEvent,
    FetchOptions, ReplicationEvent, ReplicationInfo, StoreOptions, SyncOptions,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, trace};

type Params = Map<String, Value>;

/// An in-memory [`DocumentStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    databases: RwLock<HashMap<String, Arc<MemoryDb>>>,
    faults: Faults,
    next_handle: AtomicU64,
    sessions: AtomicU64,
}

#[derive(Default)]
struct Faults {
    close: Mutex<HashSet<String>>,
    fetch: Mutex<HashSet<String>>,
    changes: Mutex<HashSet<String>>,
    writes: Mutex<HashSet<String>>,
    denied: Mutex<HashSet<String>>,
    fetch_delay: Mutex<Option<Duration>>,
    sessions: Mutex<VecDeque<(String, bool)>>,
}

impl Faults {
    fn has(set: &Mutex<HashSet<String>>, address: &str) -> bool {
        set.lock().contains(address)
    }
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn database(&self, address: &str) -> Arc<MemoryDb> {
        if let Some(db) = self.inner.databases.read().get(address) {
            return Arc::clone(db);
        }
        let mut databases = self.inner.databases.write();
        Arc::clone(
            databases
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(MemoryDb::new(address))),
        )
    }

    fn existing(&self, address: &str) -> Option<Arc<MemoryDb>> {
        self.inner.databases.read().get(address).cloned()
    }

    /// Writes documents straight into a database, bypassing revision checks.
    ///
    /// Documents without a revision get a fresh one.
    pub fn seed(&self, address: &str, docs: impl IntoIterator<Item = Document>) {
        let db = self.database(address);
        let mut state = db.state.lock();
        for mut doc in docs {
            if doc.rev.is_none() {
                doc.rev = Some(next_rev(None, &doc));
            }
            state.record(doc);
        }
        drop(state);
        db.notify.notify_waiters();
    }

    /// Returns the stored snapshot of `id`, tombstones included.
    pub fn document(&self, address: &str, id: &str) -> Option<Document> {
        self.existing(address)?.state.lock().docs.get(id).map(|s| s.doc.clone())
    }

    /// Returns the ids of the live documents in `address`.
    pub fn ids(&self, address: &str) -> Vec<String> {
        self.existing(address).map_or_else(Vec::new, |db| {
            db.state
                .lock()
                .docs
                .iter()
                .filter(|(_, stored)| !stored.doc.deleted)
                .map(|(id, _)| id.clone())
                .collect()
        })
    }

    /// Latest sequence number of `address`.
    pub fn update_seq(&self, address: &str) -> u64 {
        self.existing(address).map_or(0, |db| db.state.lock().update_seq)
    }

    /// Number of handles opened on `address`.
    pub fn open_count(&self, address: &str) -> u64 {
        self.existing(address)
            .map_or(0, |db| db.counters.opened.load(Ordering::SeqCst))
    }

    /// Number of `all_docs` calls on `address`.
    pub fn fetch_count(&self, address: &str) -> u64 {
        self.existing(address)
            .map_or(0, |db| db.counters.fetches.load(Ordering::SeqCst))
    }

    /// Number of handles on `address` that were closed.
    pub fn close_count(&self, address: &str) -> u64 {
        self.existing(address)
            .map_or(0, |db| db.counters.closed.load(Ordering::SeqCst))
    }

    /// Number of `bulk_docs` calls on `address`.
    pub fn bulk_count(&self, address: &str) -> u64 {
        self.existing(address)
            .map_or(0, |db| db.counters.bulk_writes.load(Ordering::SeqCst))
    }

    /// Number of replication sessions requested.
    pub fn session_count(&self) -> u64 {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    /// Number of live change feeds subscribed to `address`.
    pub fn feed_count(&self, address: &str) -> usize {
        self.existing(address).map_or(0, |db| {
            let mut state = db.state.lock();
            state.feeds.retain(|feed| !feed.tx.is_closed());
            state.feeds.len()
        })
    }

    /// Sends `event` to every live feed of `address`.
    pub fn broadcast(&self, address: &str, event: FeedEvent) {
        if let Some(db) = self.existing(address) {
            db.state
                .lock()
                .feeds
                .retain(|feed| feed.tx.send(event.clone()).is_ok());
        }
    }

    /// Makes closing handles on `address` fail.
    pub fn fail_close(&self, address: &str) {
        self.inner.faults.close.lock().insert(address.to_string());
    }

    /// Makes `all_docs` on `address` fail.
    pub fn fail_fetch(&self, address: &str) {
        self.inner.faults.fetch.lock().insert(address.to_string());
    }

    /// Makes change feed subscriptions on `address` fail.
    pub fn fail_changes(&self, address: &str) {
        self.inner.faults.changes.lock().insert(address.to_string());
    }

    /// Makes writes to `address` fail.
    pub fn fail_writes(&self, address: &str) {
        self.inner.faults.writes.lock().insert(address.to_string());
    }

    /// Makes `address` refuse replicated documents.
    pub fn deny_replication(&self, address: &str) {
        self.inner.faults.denied.lock().insert(address.to_string());
    }

    /// Delays every `all_docs` call.
    pub fn delay_fetch(&self, delay: Duration) {
        *self.inner.faults.fetch_delay.lock() = Some(delay);
    }

    /// Makes the next replication session fail immediately.
    pub fn fail_next_session(&self, message: impl Into<String>, retryable: bool) {
        self.inner
            .faults
            .sessions
            .lock()
            .push_back((message.into(), retryable));
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        let faults = &self.inner.faults;
        faults.close.lock().clear();
        faults.fetch.lock().clear();
        faults.changes.lock().clear();
        faults.writes.lock().clear();
        faults.denied.lock().clear();
        faults.sessions.lock().clear();
        *faults.fetch_delay.lock() = None;
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<String> = self.inner.databases.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("MemoryStore")
            .field("databases", &names)
            .finish_non_exhaustive()
    }
}

impl DocumentStore for MemoryStore {
    fn open(
        &self,
        target: &StoreTarget,
        options: &StoreOptions,
    ) -> EngineResult<Arc<dyn StoreHandle>> {
        let db = self.database(target.address());
        db.counters.opened.fetch_add(1, Ordering::SeqCst);
        let id = self.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        debug!(address = %target, handle = id, ajax_cache = options.ajax_cache(), "opened memory handle");
        Ok(Arc::new(MemoryHandle {
            id,
            target: target.clone(),
            db,
            store: Arc::clone(&self.inner),
            closed: AtomicBool::new(false),
        }))
    }

    fn replicate(
        &self,
        local: &str,
        remote: &str,
        options: &SyncOptions,
    ) -> EngineResult<ReplicationSession> {
        self.inner.sessions.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        if let Some((message, retryable)) = self.inner.faults.sessions.lock().pop_front() {
            let _ = tx.send(ReplicationEvent::Error { message, retryable });
            return Ok(rx);
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let local_db = self.database(local);
        let remote_db = self.database(remote);
        let legs = [
            Leg::new(
                Direction::Pull,
                Arc::clone(&remote_db),
                Arc::clone(&local_db),
                options,
                options.pull.as_ref(),
            ),
            Leg::new(Direction::Push, local_db, remote_db, options, options.push.as_ref()),
        ];
        let session = Session {
            store: Arc::clone(&self.inner),
            legs,
            live: options.is_live(),
            batch_size: options.batch_size(),
            tx,
        };
        runtime.spawn(session.run());
        Ok(rx)
    }
}

#[derive(Default)]
struct Counters {
    opened: AtomicU64,
    closed: AtomicU64,
    fetches: AtomicU64,
    bulk_writes: AtomicU64,
}

struct MemoryDb {
    address: String,
    state: Mutex<DbState>,
    notify: Notify,
    counters: Counters,
}

impl MemoryDb {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            state: Mutex::new(DbState::default()),
            notify: Notify::new(),
            counters: Counters::default(),
        }
    }
}

struct Stored {
    doc: Document,
    seq: u64,
}

struct Feed {
    owner: u64,
    include_docs: bool,
    params: Option<Params>,
    tx: mpsc::UnboundedSender<FeedEvent>,
}

#[derive(Default)]
struct DbState {
    docs: BTreeMap<String, Stored>,
    seqs: BTreeMap<u64, String>,
    update_seq: u64,
    feeds: Vec<Feed>,
}

impl DbState {
    /// Stores `doc` under a new sequence number and notifies feeds.
    fn record(&mut self, doc: Document) -> u64 {
        self.update_seq += 1;
        let seq = self.update_seq;
        if let Some(previous) = self.docs.get(&doc.id) {
            self.seqs.remove(&previous.seq);
        }
        self.seqs.insert(seq, doc.id.clone());
        self.feeds.retain(|feed| {
            if !passes(feed.params.as_ref(), &doc) {
                return !feed.tx.is_closed();
            }
            feed.tx
                .send(FeedEvent::Change(change_for(seq, &doc, feed.include_docs)))
                .is_ok()
        });
        self.docs.insert(doc.id.clone(), Stored { doc, seq });
        seq
    }

    /// Applies a local edit.
    fn write(&mut self, mut doc: Document) -> WriteResult {
        if doc.id.is_empty() {
            doc.id = uuid::Uuid::new_v4().simple().to_string();
        }
        let current = self.docs.get(&doc.id).map(|stored| &stored.doc);
        let accepted = match current {
            Some(existing) if existing.deleted && doc.rev.is_none() => true,
            Some(existing) => existing.rev == doc.rev,
            None => doc.rev.is_none(),
        };
        if !accepted {
            return WriteResult::failed(doc.id, "conflict");
        }
        let rev = next_rev(current, &doc);
        doc.rev = Some(rev.clone());
        if doc.deleted {
            doc.fields.clear();
        }
        let id = doc.id.clone();
        self.record(doc);
        WriteResult::ok(id, rev)
    }

    /// Applies a replicated document. Returns true if it was stored.
    fn apply_replicated(&mut self, doc: Document) -> bool {
        let wins = match self.docs.get(&doc.id) {
            None => true,
            Some(stored) if stored.doc.rev == doc.rev => false,
            Some(stored) => {
                (doc.generation(), doc.rev.as_deref())
                    > (stored.doc.generation(), stored.doc.rev.as_deref())
            }
        };
        if wins {
            self.record(doc);
        }
        wins
    }

    /// Changes after `since`, oldest first.
    fn changes_since(&self, since: u64, limit: usize) -> Vec<(u64, Document)> {
        self.seqs
            .range(since.saturating_add(1)..)
            .filter_map(|(seq, id)| self.docs.get(id).map(|stored| (*seq, stored.doc.clone())))
            .take(limit)
            .collect()
    }
}

fn change_for(seq: u64, doc: &Document, include_docs: bool) -> Change {
    if include_docs {
        Change::upsert(seq, doc.clone())
    } else {
        Change {
            id: doc.id.clone(),
            seq,
            deleted: doc.deleted,
            doc: None,
        }
    }
}

fn passes(params: Option<&Params>, doc: &Document) -> bool {
    match params {
        None => true,
        Some(_) if doc.deleted => true,
        Some(params) => params
            .iter()
            .all(|(key, expected)| doc.field(key) == Some(expected)),
    }
}

/// Field-equality parameters, when a filter is named.
fn filter_params(filter: Option<&String>, params: Option<&Params>) -> Option<Params> {
    filter.map(|_| params.cloned().unwrap_or_default())
}

fn next_rev(previous: Option<&Document>, doc: &Document) -> String {
    let generation = previous.map_or(0, Document::generation) + 1;
    let mut hasher = Sha256::new();
    if let Some(rev) = previous.and_then(|p| p.rev.as_deref()) {
        hasher.update(rev.as_bytes());
    }
    hasher.update(doc.id.as_bytes());
    hasher.update([u8::from(doc.deleted)]);
    hasher.update(Value::Object(doc.fields.clone()).to_string().as_bytes());
    let digest = hasher.finalize();
    let mut rev = format!("{generation}-");
    for byte in &digest[..16] {
        let _ = write!(rev, "{byte:02x}");
    }
    rev
}

struct MemoryHandle {
    id: u64,
    target: StoreTarget,
    db: Arc<MemoryDb>,
    store: Arc<StoreInner>,
    closed: AtomicBool,
}

impl MemoryHandle {
    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::store_fatal(format!(
                "handle on {} is closed",
                self.db.address
            )))
        } else {
            Ok(())
        }
    }

    fn ensure_writable(&self) -> EngineResult<()> {
        self.ensure_open()?;
        if Faults::has(&self.store.faults.writes, &self.db.address) {
            return Err(EngineError::store_retryable(format!(
                "writes to {} rejected",
                self.db.address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    fn target(&self) -> &StoreTarget {
        &self.target
    }

    async fn all_docs(&self, options: &FetchOptions) -> EngineResult<Vec<Document>> {
        self.ensure_open()?;
        self.db.counters.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.store.faults.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if Faults::has(&self.store.faults.fetch, &self.db.address) {
            return Err(EngineError::store_retryable(format!(
                "fetch from {} failed",
                self.db.address
            )));
        }

        let state = self.db.state.lock();
        let docs = state
            .docs
            .values()
            .map(|stored| &stored.doc)
            .filter(|doc| !doc.deleted && options.in_range(&doc.id))
            .take(options.limit.unwrap_or(usize::MAX))
            .map(|doc| {
                if options.include_docs() {
                    doc.clone()
                } else {
                    Document {
                        id: doc.id.clone(),
                        rev: doc.rev.clone(),
                        ..Document::default()
                    }
                }
            })
            .collect();
        Ok(docs)
    }

    fn changes(&self, options: &ChangesOptions) -> EngineResult<ChangeStream> {
        self.ensure_open()?;
        if Faults::has(&self.store.faults.changes, &self.db.address) {
            return Err(EngineError::store_retryable(format!(
                "change feed on {} refused",
                self.db.address
            )));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let params = filter_params(options.filter.as_ref(), options.query_params.as_ref());
        let include_docs = options.include_docs();

        let mut state = self.db.state.lock();
        let since = options.since().resolve(state.update_seq);
        let backlog: Vec<Change> = state
            .changes_since(since, usize::MAX)
            .into_iter()
            .filter(|(_, doc)| passes(params.as_ref(), doc))
            .map(|(seq, doc)| change_for(seq, &doc, include_docs))
            .collect();
        trace!(address = %self.db.address, since, backlog = backlog.len(), "change feed opened");

        if options.is_live() {
            for change in backlog {
                let _ = tx.send(FeedEvent::Change(change));
            }
            state.feeds.push(Feed {
                owner: self.id,
                include_docs,
                params,
                tx,
            });
        } else {
            let _ = tx.send(FeedEvent::Complete(ChangesComplete {
                results: Some(backlog),
                last_seq: state.update_seq,
            }));
        }
        Ok(rx)
    }

    async fn get(&self, id: &str) -> EngineResult<Option<Document>> {
        self.ensure_open()?;
        Ok(self
            .db
            .state
            .lock()
            .docs
            .get(id)
            .map(|stored| stored.doc.clone())
            .filter(|doc| !doc.deleted))
    }

    async fn put(&self, doc: Document) -> EngineResult<WriteResult> {
        self.ensure_writable()?;
        let result = self.db.state.lock().write(doc);
        self.db.notify.notify_waiters();
        Ok(result)
    }

    async fn bulk_docs(&self, docs: Vec<Document>) -> EngineResult<Vec<WriteResult>> {
        self.ensure_writable()?;
        self.db.counters.bulk_writes.fetch_add(1, Ordering::SeqCst);
        let results = {
            let mut state = self.db.state.lock();
            docs.into_iter().map(|doc| state.write(doc)).collect()
        };
        self.db.notify.notify_waiters();
        Ok(results)
    }

    async fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.db.state.lock().feeds.retain(|feed| feed.owner != self.id);
        self.db.counters.closed.fetch_add(1, Ordering::SeqCst);
        if Faults::has(&self.store.faults.close, &self.db.address) {
            return Err(EngineError::store_fatal(format!(
                "close of {} failed",
                self.db.address
            )));
        }
        debug!(address = %self.target, handle = self.id, "closed memory handle");
        Ok(())
    }
}

/// One direction of a replication session.
struct Leg {
    direction: Direction,
    source: Arc<MemoryDb>,
    target: Arc<MemoryDb>,
    params: Option<Params>,
    checkpoint: u64,
}

impl Leg {
    fn new(
        direction: Direction,
        source: Arc<MemoryDb>,
        target: Arc<MemoryDb>,
        options: &SyncOptions,
        leg: Option<&DirectionOptions>,
    ) -> Self {
        let latest = source.state.lock().update_seq;
        Self {
            direction,
            params: leg.and_then(|l| filter_params(l.filter.as_ref(), l.query_params.as_ref())),
            checkpoint: options.since_for(leg).resolve(latest),
            source,
            target,
        }
    }

    /// Replicates one batch. Returns `None` when caught up.
    fn step(&mut self, batch_size: usize, denied: bool) -> Option<(ReplicationInfo, Vec<String>)> {
        let batch = self.source.state.lock().changes_since(self.checkpoint, batch_size);
        let (last_seq, _) = batch.last()?;
        self.checkpoint = *last_seq;

        let docs_read = batch.len() as u64;
        let mut docs_written = 0;
        let mut refused = Vec::new();
        {
            let mut target = self.target.state.lock();
            for (_, doc) in batch {
                if !passes(self.params.as_ref(), &doc) {
                    continue;
                }
                if denied {
                    refused.push(doc.id);
                } else if target.apply_replicated(doc) {
                    docs_written += 1;
                }
            }
        }
        if docs_written > 0 {
            self.target.notify.notify_waiters();
        }
        Some((
            ReplicationInfo {
                direction: self.direction,
                docs_read,
                docs_written,
                last_seq: self.checkpoint,
            },
            refused,
        ))
    }
}

struct Session {
    store: Arc<StoreInner>,
    legs: [Leg; 2],
    live: bool,
    batch_size: usize,
    tx: mpsc::UnboundedSender<ReplicationEvent>,
}

impl Session {
    async fn run(mut self) {
        if self.tx.send(ReplicationEvent::Active).is_err() {
            return;
        }
        loop {
            // Created before scanning so writes during the scan still wake us
            let remote = Arc::clone(&self.legs[0].source);
            let local = Arc::clone(&self.legs[1].source);
            let remote_changed = remote.notify.notified();
            let local_changed = local.notify.notified();

            if !self.drain() {
                return;
            }
            if !self.live {
                let _ = self.tx.send(ReplicationEvent::Complete);
                return;
            }
            if self.tx.send(ReplicationEvent::Paused(None)).is_err() {
                return;
            }
            tokio::select! {
                _ = remote_changed => {}
                _ = local_changed => {}
                _ = self.tx.closed() => return,
            }
            if self.tx.send(ReplicationEvent::Active).is_err() {
                return;
            }
        }
    }

    /// Replicates until both legs are caught up. Returns false if the
    /// session was dropped.
    fn drain(&mut self) -> bool {
        for leg in &mut self.legs {
            let denied = Faults::has(&self.store.faults.denied, &leg.target.address);
            while let Some((info, refused)) = leg.step(self.batch_size, denied) {
                for id in refused {
                    let reason = format!("{id}: forbidden by {}", leg.target.address);
                    if self.tx.send(ReplicationEvent::Denied(reason)).is_err() {
                        return false;
                    }
                }
                if self.tx.send(ReplicationEvent::Change(info)).is_err() {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmirror_core::Checkpoint;
    use serde_json::json;

    fn local(store: &MemoryStore, name: &str) -> Arc<dyn StoreHandle> {
        store
            .open(&StoreTarget::Local(name.into()), &StoreOptions::default())
            .unwrap()
    }

    #[tokio::test]
    async fn put_assigns_revisions() {
        let store = MemoryStore::new();
        let db = local(&store, "a");

        let first = db.put(Document::new("x").with_field("n", 1)).await.unwrap();
        assert!(first.is_ok());
        assert!(first.rev.as_deref().unwrap().starts_with("1-"));

        let stale = db.put(Document::new("x").with_field("n", 2)).await.unwrap();
        assert_eq!(stale.error.as_deref(), Some("conflict"));

        let second = db
            .put(Document::new("x").with_rev(first.rev.unwrap()).with_field("n", 2))
            .await
            .unwrap();
        assert!(second.rev.as_deref().unwrap().starts_with("2-"));
        assert_eq!(store.update_seq("a"), 2);
    }

    #[tokio::test]
    async fn put_without_id_generates_one() {
        let store = MemoryStore::new();
        let db = local(&store, "a");
        let result = db.put(Document::default().with_field("n", 1)).await.unwrap();
        assert_eq!(result.id.len(), 32);
        assert!(db.get(&result.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn all_docs_skips_tombstones_and_sorts() {
        let store = MemoryStore::new();
        store.seed(
            "a",
            [
                Document::new("c"),
                Document::new("a"),
                Document::new("b").deleted(),
            ],
        );
        let db = local(&store, "a");
        let docs = db.all_docs(&FetchOptions::default()).await.unwrap();
        let ids: Vec<_> = docs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(store.fetch_count("a"), 1);
    }

    #[tokio::test]
    async fn live_feed_delivers_backlog_and_new_writes() {
        let store = MemoryStore::new();
        store.seed("a", [Document::new("x")]);
        let db = local(&store, "a");
        let mut feed = db
            .changes(&ChangesOptions {
                since: Some(Checkpoint::Seq(0)),
                ..Default::default()
            })
            .unwrap();

        match feed.recv().await {
            Some(FeedEvent::Change(change)) => assert_eq!(change.id, "x"),
            other => panic!("unexpected {other:?}"),
        }

        db.put(Document::new("y")).await.unwrap();
        match feed.recv().await {
            Some(FeedEvent::Change(change)) => {
                assert_eq!(change.id, "y");
                assert_eq!(change.seq, 2);
                assert!(change.doc.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn one_shot_feed_completes_with_results() {
        let store = MemoryStore::new();
        store.seed("a", [Document::new("x"), Document::new("y")]);
        let db = local(&store, "a");
        let mut feed = db
            .changes(&ChangesOptions {
                since: Some(Checkpoint::Seq(0)),
                live: Some(false),
                ..Default::default()
            })
            .unwrap();
        match feed.recv().await {
            Some(FeedEvent::Complete(complete)) => {
                assert_eq!(complete.results.map(|r| r.len()), Some(2));
                assert_eq!(complete.last_seq, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(feed.recv().await.is_none());
    }

    #[tokio::test]
    async fn close_ends_feeds_of_that_handle() {
        let store = MemoryStore::new();
        let db = local(&store, "a");
        let mut feed = db.changes(&ChangesOptions::default()).unwrap();
        assert_eq!(store.feed_count("a"), 1);
        db.close().await.unwrap();
        assert!(feed.recv().await.is_none());
        assert!(db.put(Document::new("x")).await.is_err());
    }

    #[tokio::test]
    async fn injected_close_failure() {
        let store = MemoryStore::new();
        store.fail_close("a");
        let db = local(&store, "a");
        assert!(db.close().await.is_err());
    }

    #[tokio::test]
    async fn one_shot_replication_copies_both_ways() {
        let store = MemoryStore::new();
        store.seed("local", [Document::new("mine")]);
        store.seed("http://remote/db", [Document::new("theirs")]);

        let mut session = store
            .replicate(
                "local",
                "http://remote/db",
                &SyncOptions {
                    live: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = session.recv().await {
            events.push(event);
        }
        assert_eq!(events.first(), Some(&ReplicationEvent::Active));
        assert_eq!(events.last(), Some(&ReplicationEvent::Complete));
        assert_eq!(store.ids("local"), vec!["mine", "theirs"]);
        assert_eq!(store.ids("http://remote/db"), vec!["mine", "theirs"]);
        assert_eq!(
            store.document("local", "theirs").unwrap().rev,
            store.document("http://remote/db", "theirs").unwrap().rev
        );
    }

    #[tokio::test]
    async fn pull_filter_uses_query_params() {
        let store = MemoryStore::new();
        store.seed(
            "remote",
            [
                Document::new("p1").with_field("owner", "ann"),
                Document::new("p2").with_field("owner", "bob"),
            ],
        );
        let options = SyncOptions {
            live: Some(false),
            pull: Some(DirectionOptions {
                filter: Some("projects/by_owner".into()),
                query_params: json!({"owner": "ann"}).as_object().cloned(),
                since: None,
            }),
            ..Default::default()
        };
        let mut session = store.replicate("local", "remote", &options).unwrap();
        while session.recv().await.is_some() {}
        assert_eq!(store.ids("local"), vec!["p1"]);
    }

    #[tokio::test]
    async fn denied_documents_are_reported() {
        let store = MemoryStore::new();
        store.seed("local", [Document::new("secret")]);
        store.deny_replication("remote");
        let mut session = store
            .replicate(
                "local",
                "remote",
                &SyncOptions {
                    live: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut denied = 0;
        while let Some(event) = session.recv().await {
            if matches!(event, ReplicationEvent::Denied(_)) {
                denied += 1;
            }
        }
        assert_eq!(denied, 1);
        assert!(store.ids("remote").is_empty());
    }

    #[tokio::test]
    async fn queued_session_failure() {
        let store = MemoryStore::new();
        store.fail_next_session("connection refused", true);
        let mut session = store.replicate("l", "r", &SyncOptions::default()).unwrap();
        assert_eq!(
            session.recv().await,
            Some(ReplicationEvent::Error {
                message: "connection refused".into(),
                retryable: true,
            })
        );
        assert!(session.recv().await.is_none());
        assert_eq!(store.session_count(), 1);
    }

    #[test]
    fn replicated_writes_prefer_higher_generation() {
        let mut state = DbState::default();
        assert!(state.apply_replicated(Document::new("a").with_rev("2-b")));
        assert!(!state.apply_replicated(Document::new("a").with_rev("2-b")));
        assert!(!state.apply_replicated(Document::new("a").with_rev("1-z")));
        assert!(state.apply_replicated(Document::new("a").with_rev("3-a")));
        assert_eq!(state.update_seq, 2);
        assert_eq!(state.seqs.len(), 1);
    }
}
