//! Query views.
//!
//! A [`QueryView`] is a filtered projection of one collection's cache. Reads
//! filter the cache as it is at call time. Writes go back to the collection's
//! store through a debouncer: every call within the window replaces the
//! pending payload, and only the last one is written, as a single
//! `bulk_docs`, once the window elapses.

use crate::error::{EngineError, EngineResult};
use crate::registry::Bucket;
use crate::store::WriteResult;
use docmirror_core::{Document, Predicate};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Documents handed to [`QueryView::set`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// A single document.
    One(Document),
    /// A batch of documents.
    Many(Vec<Document>),
}

impl Payload {
    fn into_docs(self) -> Vec<Document> {
        match self {
            Payload::One(doc) => vec![doc],
            Payload::Many(docs) => docs,
        }
    }
}

impl From<Document> for Payload {
    fn from(doc: Document) -> Self {
        Payload::One(doc)
    }
}

impl From<Vec<Document>> for Payload {
    fn from(docs: Vec<Document>) -> Self {
        Payload::Many(docs)
    }
}

/// What happened to a scheduled write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The payload was written. Per-document failures such as conflicts are
    /// reported in the results.
    Written(Vec<WriteResult>),
    /// A later call replaced the payload before it was written.
    Superseded,
}

/// Resolves once a scheduled write is written, superseded or failed.
#[derive(Debug)]
pub struct WriteTicket {
    rx: oneshot::Receiver<EngineResult<WriteOutcome>>,
}

impl WriteTicket {
    /// Waits for the outcome.
    pub async fn outcome(self) -> EngineResult<WriteOutcome> {
        self.rx.await.map_err(|_| EngineError::Cancelled)?
    }
}

struct Pending {
    generation: u64,
    collection: String,
    docs: Vec<Document>,
    reply: oneshot::Sender<EngineResult<WriteOutcome>>,
    timer: JoinHandle<()>,
}

#[derive(Default)]
struct DebounceState {
    generation: u64,
    pending: Option<Pending>,
}

/// Debounced writer of one view.
struct Debouncer {
    bucket: Bucket,
    state: Mutex<DebounceState>,
}

impl Debouncer {
    fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            state: Mutex::new(DebounceState::default()),
        }
    }

    fn schedule(
        self: &Arc<Self>,
        collection: &str,
        docs: Vec<Document>,
        window: Duration,
    ) -> WriteTicket {
        let (reply, rx) = oneshot::channel();
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        // The timer cannot observe the state before the new payload is in place
        let timer = self.bucket.runtime().spawn({
            let debouncer = Arc::clone(self);
            async move {
                tokio::time::sleep(window).await;
                debouncer.fire(generation).await;
            }
        });
        let replaced = state.pending.replace(Pending {
            generation,
            collection: collection.to_string(),
            docs,
            reply,
            timer,
        });
        drop(state);

        if let Some(previous) = replaced {
            previous.timer.abort();
            debug!(collection = %previous.collection, "pending write superseded");
            let _ = previous.reply.send(Ok(WriteOutcome::Superseded));
        }
        WriteTicket { rx }
    }

    fn take(&self, generation: Option<u64>) -> Option<Pending> {
        let mut state = self.state.lock();
        match (state.pending.as_ref(), generation) {
            (Some(current), Some(generation)) if current.generation != generation => None,
            _ => state.pending.take(),
        }
    }

    async fn fire(&self, generation: u64) {
        if let Some(pending) = self.take(Some(generation)) {
            self.write(pending).await;
        }
    }

    async fn flush(&self) -> bool {
        match self.take(None) {
            Some(pending) => {
                pending.timer.abort();
                self.write(pending).await;
                true
            }
            None => false,
        }
    }

    fn cancel(&self) -> bool {
        match self.take(None) {
            Some(pending) => {
                pending.timer.abort();
                let _ = pending.reply.send(Err(EngineError::Cancelled));
                true
            }
            None => false,
        }
    }

    async fn write(&self, pending: Pending) {
        let Pending {
            collection,
            docs,
            reply,
            ..
        } = pending;
        let count = docs.len();
        let result = match self.bucket.db(&collection) {
            Ok(handle) => handle.bulk_docs(docs).await.map_err(|err| {
                warn!(collection = %collection, error = %err, "write-back failed");
                EngineError::write_failure(err.to_string())
            }),
            Err(err) => Err(err),
        };
        debug!(collection = %collection, count, ok = result.is_ok(), "write-back issued");
        let _ = reply.send(result.map(WriteOutcome::Written));
    }
}

/// A filtered, writable projection of one collection.
pub struct QueryView {
    predicate: Arc<dyn Predicate>,
    collection: RwLock<Option<String>>,
    writer: Arc<Debouncer>,
}

impl QueryView {
    pub(crate) fn new(bucket: Bucket, predicate: Arc<dyn Predicate>) -> Self {
        Self {
            predicate,
            collection: RwLock::new(None),
            writer: Arc::new(Debouncer::new(bucket)),
        }
    }

    /// Binds the view to `collection`.
    #[must_use]
    pub fn bind(self, collection: impl Into<String>) -> Self {
        *self.collection.write() = Some(collection.into());
        self
    }

    /// Rebinds the view. A pending write keeps its original target.
    pub fn rebind(&self, collection: impl Into<String>) {
        *self.collection.write() = Some(collection.into());
    }

    /// The bound collection.
    pub fn collection(&self) -> Option<String> {
        self.collection.read().clone()
    }

    fn bound(&self) -> EngineResult<String> {
        self.collection().ok_or(EngineError::ConfigurationMissing)
    }

    /// Matching documents in id order, evaluated against the current cache.
    pub fn get(&self) -> EngineResult<Vec<Document>> {
        let collection = self.bound()?;
        self.writer.bucket.with_cache(&collection, |cache| {
            cache
                .iter()
                .filter(|doc| self.predicate.matches(doc))
                .cloned()
                .collect()
        })
    }

    /// Schedules `payload` to be written after the debounce window.
    ///
    /// A pending payload from an earlier call is dropped and its ticket
    /// resolves to [`WriteOutcome::Superseded`].
    pub fn set(&self, payload: impl Into<Payload>) -> EngineResult<WriteTicket> {
        let collection = self.bound()?;
        let window = self.writer.bucket.debounce_for(&collection);
        Ok(self
            .writer
            .schedule(&collection, payload.into().into_docs(), window))
    }

    /// Writes the pending payload now. Returns false if nothing was pending.
    pub async fn flush(&self) -> bool {
        self.writer.flush().await
    }

    /// Drops the pending payload. Its ticket resolves to
    /// [`EngineError::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.writer.cancel()
    }

    /// Returns true if a write is waiting for its window to elapse.
    pub fn is_pending(&self) -> bool {
        self.writer.state.lock().pending.is_some()
    }
}

impl std::fmt::Debug for QueryView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryView")
            .field("collection", &self.collection())
            .field("pending", &self.is_pending())
            .finish_non_exhaustive()
    }
}
