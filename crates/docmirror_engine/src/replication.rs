//! Replication supervision.
//!
//! A [`ReplicationSupervisor`] owns the bidirectional replication of one
//! collection. It asks the store for a session, forwards every session event
//! to the collection callbacks and re-establishes the session when it ends:
//!
//! - Live sessions that end unexpectedly are restarted.
//! - Failed sessions are retried with exponential backoff when `retry` is
//!   on and the error is retryable. Otherwise the supervisor stops in
//!   [`ReplicationState::Failed`] after forwarding the error.
//! - `denied` is forwarded and never ends a session.
//!
//! Each new session resumes from the last checkpoint seen per direction.

use crate::error::{EngineError, EngineResult};
use crate::reconciler::fire;
use crate::signal::CancelSignal;
use crate::store::{DocumentStore, ReplicationSession};
use docmirror_core::{
    Callbacks, Checkpoint, Completion, Direction, DirectionOptions, Notice, ReplicationEvent,
    ReplicationInfo, Source, SyncOptions,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The current state of a collection's replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationState {
    /// Not started.
    Idle,
    /// Requesting a session from the store.
    Connecting,
    /// Replicating.
    Active,
    /// Caught up and waiting for changes.
    Paused,
    /// Waiting before retrying a failed session.
    RetryWait,
    /// A one-shot replication finished.
    Complete,
    /// Replication gave up after an error.
    Failed,
    /// Stopped by the owner.
    Stopped,
}

impl ReplicationState {
    /// Returns true while a session is running or being established.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ReplicationState::Connecting
                | ReplicationState::Active
                | ReplicationState::Paused
                | ReplicationState::RetryWait
        )
    }

    /// Returns true once replication can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReplicationState::Complete | ReplicationState::Failed | ReplicationState::Stopped
        )
    }
}

/// Statistics about a collection's replication.
#[derive(Debug, Clone, Default)]
pub struct ReplicationStats {
    /// Sessions requested from the store.
    pub sessions_started: u64,
    /// Sessions re-established after a failure.
    pub retries: u64,
    /// Documents read, both directions.
    pub docs_read: u64,
    /// Documents written, both directions.
    pub docs_written: u64,
    /// Documents refused by the target.
    pub docs_denied: u64,
    /// Last pull checkpoint.
    pub pull_checkpoint: Option<u64>,
    /// Last push checkpoint.
    pub push_checkpoint: Option<u64>,
    /// Time of the last replicated batch.
    pub last_change: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// How a session ended.
enum Outcome {
    Cancelled,
    Complete,
    Ended,
    Failed { message: String, retryable: bool },
}

struct Shared {
    name: String,
    state: watch::Sender<ReplicationState>,
    stats: RwLock<ReplicationStats>,
    signal: CancelSignal,
}

impl Shared {
    fn set_state(&self, state: ReplicationState) {
        self.state.send_if_modified(|current| {
            // Stopped is final
            if *current == state || *current == ReplicationState::Stopped {
                return false;
            }
            *current = state;
            true
        });
    }
}

/// Supervises the replication of one collection.
pub struct ReplicationSupervisor {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationSupervisor {
    /// Creates a supervisor that has not started.
    pub fn idle(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ReplicationState::Idle);
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state,
                stats: RwLock::new(ReplicationStats::default()),
                signal: CancelSignal::new(),
            }),
            task: Mutex::new(None),
        }
    }

    /// Starts replicating the local database `name` with `remote`.
    pub fn start(
        runtime: &Handle,
        store: Arc<dyn DocumentStore>,
        name: impl Into<String>,
        remote: impl Into<String>,
        options: SyncOptions,
        callbacks: Callbacks,
    ) -> Self {
        let supervisor = Self::idle(name);
        let worker = Worker {
            shared: Arc::clone(&supervisor.shared),
            store,
            remote: remote.into(),
            options,
            callbacks,
        };
        info!(collection = %supervisor.shared.name, remote = %worker.remote, live = worker.options.is_live(), "starting replication");
        supervisor.shared.set_state(ReplicationState::Connecting);
        *supervisor.task.lock() = Some(runtime.spawn(worker.run()));
        supervisor
    }

    /// Current state.
    pub fn state(&self) -> ReplicationState {
        *self.shared.state.borrow()
    }

    /// Receiver notified on every state change.
    pub fn state_receiver(&self) -> watch::Receiver<ReplicationState> {
        self.shared.state.subscribe()
    }

    /// Current statistics.
    pub fn stats(&self) -> ReplicationStats {
        self.shared.stats.read().clone()
    }

    /// Returns true while replication is running.
    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Stops replication. Safe on stopped or never-started supervisors.
    pub fn stop(&self) {
        if self.shared.signal.cancel() {
            debug!(collection = %self.shared.name, "stopping replication");
        }
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.shared.set_state(ReplicationState::Stopped);
    }

    /// Waits until replication reaches a terminal state.
    pub async fn wait(&self) -> ReplicationState {
        let mut rx = self.state_receiver();
        let state = rx.wait_for(|state| state.is_terminal()).await.map(|s| *s);
        state.unwrap_or(ReplicationState::Stopped)
    }
}

impl Drop for ReplicationSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ReplicationSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationSupervisor")
            .field("collection", &self.shared.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

struct Worker {
    shared: Arc<Shared>,
    store: Arc<dyn DocumentStore>,
    remote: String,
    options: SyncOptions,
    callbacks: Callbacks,
}

impl Worker {
    fn name(&self) -> &str {
        &self.shared.name
    }

    /// Session options resuming from the recorded checkpoints.
    fn session_options(&self) -> SyncOptions {
        let stats = self.shared.stats.read();
        let resume = |leg: &Option<DirectionOptions>, checkpoint: Option<u64>| {
            checkpoint.map_or_else(
                || leg.clone(),
                |seq| {
                    Some(DirectionOptions {
                        since: Some(Checkpoint::Seq(seq)),
                        ..leg.clone().unwrap_or_default()
                    })
                },
            )
        };
        SyncOptions {
            pull: resume(&self.options.pull, stats.pull_checkpoint),
            push: resume(&self.options.push, stats.push_checkpoint),
            ..self.options.clone()
        }
    }

    fn connect(&self) -> EngineResult<ReplicationSession> {
        self.shared.set_state(ReplicationState::Connecting);
        self.shared.stats.write().sessions_started += 1;
        self.store
            .replicate(self.name(), &self.remote, &self.session_options())
    }

    async fn run(self) {
        let backoff = self.options.backoff();
        let mut attempt = 0u32;

        loop {
            let outcome = match self.connect() {
                Ok(session) => self.drive(session, &mut attempt).await,
                Err(err) => {
                    let outcome = Outcome::Failed {
                        message: err.to_string(),
                        retryable: err.is_retryable(),
                    };
                    self.report_error(&err.to_string());
                    outcome
                }
            };

            let (message, retryable) = match outcome {
                Outcome::Cancelled => return,
                Outcome::Complete => {
                    info!(collection = %self.name(), "replication complete");
                    self.shared.set_state(ReplicationState::Complete);
                    fire(&self.callbacks.on_complete, self.name(), &Completion::Replication);
                    return;
                }
                Outcome::Ended => ("replication session ended".to_string(), true),
                Outcome::Failed { message, retryable } => (message, retryable),
            };

            if !(self.options.retries() && retryable && backoff.allows(attempt)) {
                warn!(collection = %self.name(), %message, attempt, "replication failed");
                self.shared.set_state(ReplicationState::Failed);
                return;
            }

            attempt = attempt.saturating_add(1);
            let delay = backoff.delay_for_attempt(attempt);
            debug!(collection = %self.name(), attempt, delay_ms = delay.as_millis() as u64, "retrying replication");
            self.shared.set_state(ReplicationState::RetryWait);
            self.shared.stats.write().retries += 1;
            tokio::select! {
                biased;
                _ = self.shared.signal.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Forwards session events until the session ends.
    async fn drive(&self, mut session: ReplicationSession, attempt: &mut u32) -> Outcome {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.shared.signal.cancelled() => return Outcome::Cancelled,
                event = session.recv() => event,
            };
            let Some(event) = event else {
                return if self.options.is_live() {
                    Outcome::Ended
                } else {
                    Outcome::Complete
                };
            };

            match event {
                ReplicationEvent::Change(info) => {
                    *attempt = 0;
                    self.record(&info);
                    self.shared.set_state(ReplicationState::Active);
                    fire(&self.callbacks.on_replicate, self.name(), &info);
                }
                ReplicationEvent::Active => {
                    self.shared.set_state(ReplicationState::Active);
                    fire(
                        &self.callbacks.on_active,
                        self.name(),
                        &Notice::new(Source::Replication),
                    );
                }
                ReplicationEvent::Paused(message) => {
                    *attempt = 0;
                    self.shared.set_state(ReplicationState::Paused);
                    let notice = Notice {
                        source: Source::Replication,
                        message,
                    };
                    fire(&self.callbacks.on_paused, self.name(), &notice);
                }
                ReplicationEvent::Denied(message) => {
                    let denied = EngineError::ReplicationDenied {
                        message: message.clone(),
                    };
                    warn!(collection = %self.name(), error = %denied, "document denied");
                    self.shared.stats.write().docs_denied += 1;
                    fire(
                        &self.callbacks.on_denied,
                        self.name(),
                        &Notice::with_message(Source::Replication, message),
                    );
                }
                ReplicationEvent::Error { message, retryable } => {
                    let err = EngineError::ReplicationError { message, retryable };
                    self.report_error(&err.to_string());
                    return Outcome::Failed {
                        message: err.to_string(),
                        retryable: err.is_retryable(),
                    };
                }
                ReplicationEvent::Complete => return Outcome::Complete,
            }
        }
    }

    fn record(&self, info: &ReplicationInfo) {
        let mut stats = self.shared.stats.write();
        stats.docs_read += info.docs_read;
        stats.docs_written += info.docs_written;
        stats.last_change = Some(Instant::now());
        let checkpoint = match info.direction {
            Direction::Pull => &mut stats.pull_checkpoint,
            Direction::Push => &mut stats.push_checkpoint,
        };
        *checkpoint = Some(checkpoint.map_or(info.last_seq, |seq| seq.max(info.last_seq)));
    }

    fn report_error(&self, message: &str) {
        warn!(collection = %self.name(), %message, "replication error");
        self.shared.stats.write().last_error = Some(message.to_string());
        fire(
            &self.callbacks.on_error,
            self.name(),
            &Notice::with_message(Source::Replication, message),
        );
    }
}
