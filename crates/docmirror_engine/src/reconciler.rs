//! Change feed reconciliation.
//!
//! The reconciler turns change feed events into cache mutations and forwards
//! every event to the collection's callbacks:
//!
//! - `change`: deletions remove the document, everything else with a body
//!   is upserted. The raw change then goes to `on_change`.
//! - `complete`: a carried batch is applied in order with the same rules,
//!   then `on_complete` is always invoked.
//! - `paused`, `active`, `denied`, `error`: forwarded only.
//!
//! Callbacks run after the cache lock is released, so they may read the
//! bucket.

use crate::mirror::Mirror;
use crate::signal::CancelSignal;
use crate::store::ChangeStream;
use docmirror_core::{Callback, Callbacks, Change, Completion, FeedEvent, Notice, Source};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// State of a collection's change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// Not subscribed yet.
    Idle,
    /// Subscription requested.
    Subscribing,
    /// Receiving changes.
    Active,
    /// Idle upstream.
    Paused,
    /// Access was refused. Recovers on the next change.
    Denied,
    /// The feed reported an error. Recovers on the next change.
    Error,
    /// Cancelled or finished.
    Closed,
}

impl FeedState {
    /// Returns true unless the feed is closed.
    pub fn is_open(&self) -> bool {
        !matches!(self, FeedState::Closed)
    }

    /// Returns true if the last event reported a problem.
    pub fn is_degraded(&self) -> bool {
        matches!(self, FeedState::Denied | FeedState::Error)
    }
}

/// Invokes a callback slot, if set.
pub(crate) fn fire<T>(slot: &Option<Callback<T>>, name: &str, payload: &T) {
    if let Some(callback) = slot {
        callback(name, payload);
    }
}

/// Applies feed events to one collection's cache.
pub(crate) struct Reconciler {
    mirror: Arc<Mirror>,
    callbacks: Callbacks,
    state: watch::Sender<FeedState>,
    last_seq: AtomicU64,
}

impl Reconciler {
    pub(crate) fn new(mirror: Arc<Mirror>, callbacks: Callbacks) -> Self {
        let (state, _) = watch::channel(FeedState::Idle);
        Self {
            mirror,
            callbacks,
            state,
            last_seq: AtomicU64::new(0),
        }
    }

    fn name(&self) -> &str {
        self.mirror.name()
    }

    fn set_state(&self, next: FeedState) {
        self.state.send_if_modified(|state| {
            // Closed is terminal
            if *state == next || *state == FeedState::Closed {
                return false;
            }
            trace!(collection = %self.mirror.name(), from = ?*state, to = ?next, "feed state");
            *state = next;
            true
        });
    }

    pub(crate) fn state(&self) -> FeedState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<FeedState> {
        self.state.subscribe()
    }

    pub(crate) fn last_seq(&self) -> u64 {
        self.last_seq.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribing(&self) {
        self.set_state(FeedState::Subscribing);
    }

    /// Applies a single event.
    pub(crate) fn apply(&self, event: FeedEvent) {
        if self.mirror.is_closed() {
            trace!(collection = %self.name(), "discarding event for closed collection");
            return;
        }
        match event {
            FeedEvent::Change(change) => {
                self.apply_change(&change);
                self.set_state(FeedState::Active);
                fire(&self.callbacks.on_change, self.name(), &change);
            }
            FeedEvent::Complete(complete) => {
                let results = complete.results.as_deref().unwrap_or_default();
                for change in results {
                    self.apply_change(change);
                }
                self.last_seq.fetch_max(complete.last_seq, Ordering::SeqCst);
                debug!(collection = %self.name(), applied = results.len(), last_seq = complete.last_seq, "change feed complete");
                self.set_state(FeedState::Closed);
                fire(
                    &self.callbacks.on_complete,
                    self.name(),
                    &Completion::Feed(complete),
                );
            }
            FeedEvent::Paused(message) => {
                self.set_state(FeedState::Paused);
                let notice = Notice {
                    source: Source::Feed,
                    message,
                };
                fire(&self.callbacks.on_paused, self.name(), &notice);
            }
            FeedEvent::Active => {
                self.set_state(FeedState::Active);
                fire(
                    &self.callbacks.on_active,
                    self.name(),
                    &Notice::new(Source::Feed),
                );
            }
            FeedEvent::Denied(message) => {
                warn!(collection = %self.name(), %message, "change feed denied");
                self.set_state(FeedState::Denied);
                fire(
                    &self.callbacks.on_denied,
                    self.name(),
                    &Notice::with_message(Source::Feed, message),
                );
            }
            FeedEvent::Error(message) => {
                warn!(collection = %self.name(), %message, "change feed error");
                self.set_state(FeedState::Error);
                fire(
                    &self.callbacks.on_error,
                    self.name(),
                    &Notice::with_message(Source::Feed, message),
                );
            }
        }
    }

    /// Mirrors one change into the cache.
    fn apply_change(&self, change: &Change) {
        self.last_seq.fetch_max(change.seq, Ordering::SeqCst);
        if change.is_deletion() {
            self.mirror
                .mutate(|cache| usize::from(cache.remove(&change.id).is_some()));
            return;
        }
        match &change.doc {
            Some(doc) => {
                self.mirror
                    .mutate(|cache| usize::from(cache.upsert(doc.clone()).is_change()));
            }
            None => {
                debug!(collection = %self.name(), id = %change.id, seq = change.seq, "change without document body skipped");
            }
        }
    }

    fn close(&self) {
        self.set_state(FeedState::Closed);
    }

    async fn run(self: Arc<Self>, mut stream: ChangeStream, signal: Arc<CancelSignal>) {
        loop {
            tokio::select! {
                biased;
                _ = signal.cancelled() => break,
                event = stream.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
            }
        }
        debug!(collection = %self.name(), "change feed stopped");
        self.close();
    }
}

/// Handle to a running change feed subscription.
pub struct FeedHandle {
    reconciler: Arc<Reconciler>,
    signal: Arc<CancelSignal>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FeedHandle {
    /// Spawns the reconciliation loop over `stream`.
    pub(crate) fn spawn(runtime: &Handle, reconciler: Arc<Reconciler>, stream: ChangeStream) -> Self {
        let signal = Arc::new(CancelSignal::new());
        reconciler.set_state(FeedState::Active);
        let task = runtime.spawn(Arc::clone(&reconciler).run(stream, Arc::clone(&signal)));
        Self {
            reconciler,
            signal,
            task: Mutex::new(Some(task)),
        }
    }

    /// Current feed state.
    pub fn state(&self) -> FeedState {
        self.reconciler.state()
    }

    /// Receiver notified on every state change.
    pub fn state_receiver(&self) -> watch::Receiver<FeedState> {
        self.reconciler.subscribe_state()
    }

    /// Highest sequence applied so far.
    pub fn last_seq(&self) -> u64 {
        self.reconciler.last_seq()
    }

    /// Stops delivery. Safe to call more than once.
    pub fn cancel(&self) {
        if self.signal.cancel() {
            debug!(collection = %self.reconciler.name(), "cancelling change feed");
        }
        self.reconciler.close();
    }

    /// Returns true once [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }

    /// Waits for the reconciliation loop to exit.
    pub async fn join(&self) {
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for FeedHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedHandle")
            .field("collection", &self.reconciler.name())
            .field("state", &self.state())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
