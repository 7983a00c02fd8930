//! Bucket and collection configuration.
//!
//! Configuration is layered. A [`BucketConfig`] holds a bucket-wide
//! [`CollectionConfig`] plus optional per-collection overrides. The effective
//! configuration of a collection is the bucket-wide layer merged with its
//! override, where a value set on the override (the leaf) wins over the same
//! value on the bucket layer (the parent). Nested option groups merge field
//! by field, and JSON parameter maps merge key by key.
//!
//! Every field is optional so that "unset" can be told apart from "set to the
//! default"; the accessor methods apply the defaults.

use crate::event::{Change, Completion, Notice, ReplicationInfo};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default debounce window for query view write-back.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Layered merge where `leaf` overrides `self`.
pub trait Merge {
    /// Returns `self` overridden by `leaf`.
    fn merge(&self, leaf: &Self) -> Self;
}

fn pick<T: Clone>(parent: &Option<T>, leaf: &Option<T>) -> Option<T> {
    leaf.clone().or_else(|| parent.clone())
}

fn merge_nested<T: Merge + Clone>(parent: &Option<T>, leaf: &Option<T>) -> Option<T> {
    match (parent, leaf) {
        (Some(parent), Some(leaf)) => Some(parent.merge(leaf)),
        _ => pick(parent, leaf),
    }
}

/// Deep-merges two JSON objects; leaf values win, nested objects recurse.
pub fn merge_json(parent: &Map<String, Value>, leaf: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = parent.clone();
    for (key, value) in leaf {
        let combined = match (merged.get(key), value) {
            (Some(Value::Object(p)), Value::Object(l)) => Value::Object(merge_json(p, l)),
            _ => value.clone(),
        };
        merged.insert(key.clone(), combined);
    }
    merged
}

fn merge_params(
    parent: &Option<Map<String, Value>>,
    leaf: &Option<Map<String, Value>>,
) -> Option<Map<String, Value>> {
    match (parent, leaf) {
        (Some(parent), Some(leaf)) => Some(merge_json(parent, leaf)),
        _ => pick(parent, leaf),
    }
}

/// A position in a change feed or replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Checkpoint {
    /// The current end of the stream.
    Now,
    /// An explicit sequence number.
    #[serde(untagged)]
    Seq(u64),
}

impl Checkpoint {
    /// Resolves the checkpoint against the stream's latest sequence.
    pub fn resolve(self, latest: u64) -> u64 {
        match self {
            Checkpoint::Now => latest,
            Checkpoint::Seq(seq) => seq,
        }
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Checkpoint::Seq(0)
    }
}

/// Options for opening a store handle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOptions {
    /// Whether HTTP responses may be cached (remote handles).
    pub ajax_cache: Option<bool>,
    /// Whether the store compacts old revisions automatically.
    pub auto_compaction: Option<bool>,
    /// Number of revisions the store keeps per document.
    pub revs_limit: Option<u32>,
}

impl StoreOptions {
    /// HTTP caching, off unless enabled.
    pub fn ajax_cache(&self) -> bool {
        self.ajax_cache.unwrap_or(false)
    }

    /// Automatic compaction, off unless enabled.
    pub fn auto_compaction(&self) -> bool {
        self.auto_compaction.unwrap_or(false)
    }
}

impl Merge for StoreOptions {
    fn merge(&self, leaf: &Self) -> Self {
        Self {
            ajax_cache: pick(&self.ajax_cache, &leaf.ajax_cache),
            auto_compaction: pick(&self.auto_compaction, &leaf.auto_compaction),
            revs_limit: pick(&self.revs_limit, &leaf.revs_limit),
        }
    }
}

/// Options for the initial bulk fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Whether document bodies are returned.
    pub include_docs: Option<bool>,
    /// Lowest id to return (inclusive).
    pub start_key: Option<String>,
    /// Highest id to return (inclusive).
    pub end_key: Option<String>,
    /// Maximum number of documents.
    pub limit: Option<usize>,
}

impl FetchOptions {
    /// Document bodies are included unless disabled.
    pub fn include_docs(&self) -> bool {
        self.include_docs.unwrap_or(true)
    }

    /// Returns true if `id` lies within the configured key range.
    pub fn in_range(&self, id: &str) -> bool {
        self.start_key.as_deref().map_or(true, |start| id >= start)
            && self.end_key.as_deref().map_or(true, |end| id <= end)
    }
}

impl Merge for FetchOptions {
    fn merge(&self, leaf: &Self) -> Self {
        Self {
            include_docs: pick(&self.include_docs, &leaf.include_docs),
            start_key: pick(&self.start_key, &leaf.start_key),
            end_key: pick(&self.end_key, &leaf.end_key),
            limit: pick(&self.limit, &leaf.limit),
        }
    }
}

/// Options for the live change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangesOptions {
    /// Where the feed starts.
    pub since: Option<Checkpoint>,
    /// Whether the feed stays open for new changes.
    pub live: Option<bool>,
    /// Whether changes carry document bodies.
    pub include_docs: Option<bool>,
    /// Named filter applied by the store.
    pub filter: Option<String>,
    /// Parameters for the filter.
    pub query_params: Option<Map<String, Value>>,
}

impl ChangesOptions {
    /// Starts at [`Checkpoint::Now`] unless set.
    pub fn since(&self) -> Checkpoint {
        self.since.unwrap_or(Checkpoint::Now)
    }

    /// Live unless disabled.
    pub fn is_live(&self) -> bool {
        self.live.unwrap_or(true)
    }

    /// Document bodies are included unless disabled.
    pub fn include_docs(&self) -> bool {
        self.include_docs.unwrap_or(true)
    }
}

impl Merge for ChangesOptions {
    fn merge(&self, leaf: &Self) -> Self {
        Self {
            since: pick(&self.since, &leaf.since),
            live: pick(&self.live, &leaf.live),
            include_docs: pick(&self.include_docs, &leaf.include_docs),
            filter: pick(&self.filter, &leaf.filter),
            query_params: merge_params(&self.query_params, &leaf.query_params),
        }
    }
}

/// Per-direction replication options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectionOptions {
    /// Named filter applied to replicated documents.
    pub filter: Option<String>,
    /// Parameters for the filter.
    pub query_params: Option<Map<String, Value>>,
    /// Where this direction starts; overrides the shared checkpoint.
    pub since: Option<Checkpoint>,
}

impl Merge for DirectionOptions {
    fn merge(&self, leaf: &Self) -> Self {
        Self {
            filter: pick(&self.filter, &leaf.filter),
            query_params: merge_params(&self.query_params, &leaf.query_params),
            since: pick(&self.since, &leaf.since),
        }
    }
}

/// Replication options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncOptions {
    /// Keep replicating new changes indefinitely.
    pub live: Option<bool>,
    /// Retry failed sessions with backoff.
    pub retry: Option<bool>,
    /// Shared starting checkpoint for both directions.
    pub since: Option<Checkpoint>,
    /// Documents per replicated batch.
    pub batch_size: Option<usize>,
    /// Pull-specific options.
    pub pull: Option<DirectionOptions>,
    /// Push-specific options.
    pub push: Option<DirectionOptions>,
    /// Backoff policy used when `retry` is on.
    pub backoff: Option<RetryConfig>,
}

impl SyncOptions {
    /// Live unless disabled.
    pub fn is_live(&self) -> bool {
        self.live.unwrap_or(true)
    }

    /// Retries unless disabled.
    pub fn retries(&self) -> bool {
        self.retry.unwrap_or(true)
    }

    /// Starting checkpoint for `direction`, falling back to the shared one.
    pub fn since_for(&self, direction: Option<&DirectionOptions>) -> Checkpoint {
        direction
            .and_then(|d| d.since)
            .or(self.since)
            .unwrap_or_default()
    }

    /// Batch size, 100 unless set.
    pub fn batch_size(&self) -> usize {
        self.batch_size.unwrap_or(100).max(1)
    }

    /// Backoff policy, unbounded retries unless set.
    pub fn backoff(&self) -> RetryConfig {
        self.backoff.clone().unwrap_or_else(RetryConfig::unbounded)
    }
}

impl Merge for SyncOptions {
    fn merge(&self, leaf: &Self) -> Self {
        Self {
            live: pick(&self.live, &leaf.live),
            retry: pick(&self.retry, &leaf.retry),
            since: pick(&self.since, &leaf.since),
            batch_size: pick(&self.batch_size, &leaf.batch_size),
            pull: merge_nested(&self.pull, &leaf.pull),
            push: merge_nested(&self.push, &leaf.push),
            backoff: pick(&self.backoff, &leaf.backoff),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never gives up.
    pub fn unbounded() -> Self {
        Self::new(u32::MAX)
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    #[must_use]
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns true if another attempt is allowed after `attempt` (0-indexed).
    pub fn allows(&self, attempt: u32) -> bool {
        attempt.saturating_add(1) < self.max_attempts
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% on top
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// A user callback receiving the collection name and an event payload.
pub type Callback<T> = Arc<dyn Fn(&str, &T) + Send + Sync>;

/// Function that cancels a collection's feed and replication.
pub type CancelFn = Arc<dyn Fn() + Send + Sync>;

/// User callbacks for feed and replication events.
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Raw feed change, after the cache was updated.
    pub on_change: Option<Callback<Change>>,
    /// Replicated batch.
    pub on_replicate: Option<Callback<ReplicationInfo>>,
    /// Feed or replication went idle.
    pub on_paused: Option<Callback<Notice>>,
    /// Feed or replication resumed.
    pub on_active: Option<Callback<Notice>>,
    /// Replication or feed access was refused.
    pub on_denied: Option<Callback<Notice>>,
    /// Feed or replication finished.
    pub on_complete: Option<Callback<Completion>>,
    /// Feed or replication failed.
    pub on_error: Option<Callback<Notice>>,
    /// Receives the cancel function once the collection is syncing.
    pub cancel: Option<Callback<CancelFn>>,
}

impl Callbacks {
    /// Sets the change callback.
    #[must_use]
    pub fn on_change(mut self, f: impl Fn(&str, &Change) + Send + Sync + 'static) -> Self {
        self.on_change = Some(Arc::new(f));
        self
    }

    /// Sets the replication progress callback.
    #[must_use]
    pub fn on_replicate(
        mut self,
        f: impl Fn(&str, &ReplicationInfo) + Send + Sync + 'static,
    ) -> Self {
        self.on_replicate = Some(Arc::new(f));
        self
    }

    /// Sets the paused callback.
    #[must_use]
    pub fn on_paused(mut self, f: impl Fn(&str, &Notice) + Send + Sync + 'static) -> Self {
        self.on_paused = Some(Arc::new(f));
        self
    }

    /// Sets the active callback.
    #[must_use]
    pub fn on_active(mut self, f: impl Fn(&str, &Notice) + Send + Sync + 'static) -> Self {
        self.on_active = Some(Arc::new(f));
        self
    }

    /// Sets the denied callback.
    #[must_use]
    pub fn on_denied(mut self, f: impl Fn(&str, &Notice) + Send + Sync + 'static) -> Self {
        self.on_denied = Some(Arc::new(f));
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn on_complete(mut self, f: impl Fn(&str, &Completion) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(f));
        self
    }

    /// Sets the error callback.
    #[must_use]
    pub fn on_error(mut self, f: impl Fn(&str, &Notice) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Sets the cancel-function receiver.
    #[must_use]
    pub fn cancel(mut self, f: impl Fn(&str, &CancelFn) + Send + Sync + 'static) -> Self {
        self.cancel = Some(Arc::new(f));
        self
    }
}

impl Merge for Callbacks {
    fn merge(&self, leaf: &Self) -> Self {
        Self {
            on_change: pick(&self.on_change, &leaf.on_change),
            on_replicate: pick(&self.on_replicate, &leaf.on_replicate),
            on_paused: pick(&self.on_paused, &leaf.on_paused),
            on_active: pick(&self.on_active, &leaf.on_active),
            on_denied: pick(&self.on_denied, &leaf.on_denied),
            on_complete: pick(&self.on_complete, &leaf.on_complete),
            on_error: pick(&self.on_error, &leaf.on_error),
            cancel: pick(&self.cancel, &leaf.cancel),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_change", &self.on_change.is_some())
            .field("on_replicate", &self.on_replicate.is_some())
            .field("on_paused", &self.on_paused.is_some())
            .field("on_active", &self.on_active.is_some())
            .field("on_denied", &self.on_denied.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// One configuration layer for a collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectionConfig {
    /// Base URL of the remote server; the collection name is appended.
    pub remote: Option<String>,
    /// Bind the handle to the remote only: no cache, feed or replication.
    pub remote_only: Option<bool>,
    /// Store handle options.
    pub options: StoreOptions,
    /// Initial fetch options.
    pub all_docs: FetchOptions,
    /// Replication options.
    pub sync: SyncOptions,
    /// Change feed options.
    pub changes: ChangesOptions,
    /// Query view write-back debounce window in milliseconds.
    pub debounce_ms: Option<u64>,
    /// User callbacks.
    #[serde(skip)]
    pub callbacks: Callbacks,
}

impl CollectionConfig {
    /// Creates an empty layer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the remote server URL.
    #[must_use]
    pub fn remote(mut self, url: impl Into<String>) -> Self {
        self.remote = Some(url.into());
        self
    }

    /// Sets remote-only mode.
    #[must_use]
    pub fn remote_only(mut self, value: bool) -> Self {
        self.remote_only = Some(value);
        self
    }

    /// Sets the store options.
    #[must_use]
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the initial fetch options.
    #[must_use]
    pub fn all_docs(mut self, all_docs: FetchOptions) -> Self {
        self.all_docs = all_docs;
        self
    }

    /// Sets the replication options.
    #[must_use]
    pub fn sync(mut self, sync: SyncOptions) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the change feed options.
    #[must_use]
    pub fn changes(mut self, changes: ChangesOptions) -> Self {
        self.changes = changes;
        self
    }

    /// Sets the write-back debounce window.
    #[must_use]
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce_ms = Some(window.as_millis() as u64);
        self
    }

    /// Sets the callbacks.
    #[must_use]
    pub fn callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

impl Merge for CollectionConfig {
    fn merge(&self, leaf: &Self) -> Self {
        Self {
            remote: pick(&self.remote, &leaf.remote),
            remote_only: pick(&self.remote_only, &leaf.remote_only),
            options: self.options.merge(&leaf.options),
            all_docs: self.all_docs.merge(&leaf.all_docs),
            sync: self.sync.merge(&leaf.sync),
            changes: self.changes.merge(&leaf.changes),
            debounce_ms: pick(&self.debounce_ms, &leaf.debounce_ms),
            callbacks: self.callbacks.merge(&leaf.callbacks),
        }
    }
}

/// Bucket-wide configuration with per-collection overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Layer shared by every collection.
    #[serde(rename = "config", default)]
    pub defaults: CollectionConfig,
    /// Per-collection overrides, keyed by collection name.
    #[serde(flatten)]
    pub collections: BTreeMap<String, CollectionConfig>,
}

impl BucketConfig {
    /// Creates a bucket configuration from its shared layer.
    pub fn new(defaults: CollectionConfig) -> Self {
        Self {
            defaults,
            collections: BTreeMap::new(),
        }
    }

    /// Parses a configuration from JSON (`{"config": {...}, "<name>": {...}}`).
    pub fn from_json(value: Value) -> crate::CoreResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Adds an override for `name`.
    #[must_use]
    pub fn collection(mut self, name: impl Into<String>, config: CollectionConfig) -> Self {
        self.collections.insert(name.into(), config);
        self
    }

    /// Returns the effective configuration of `name`.
    pub fn effective(&self, name: &str) -> EffectiveConfig {
        let config = match self.collections.get(name) {
            Some(leaf) => self.defaults.merge(leaf),
            None => self.defaults.clone(),
        };
        EffectiveConfig {
            name: name.to_string(),
            config,
        }
    }
}

/// Fully merged configuration of one collection.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    name: String,
    config: CollectionConfig,
}

impl EffectiveConfig {
    /// Layers `leaf` over this configuration, as a per-call override.
    #[must_use]
    pub fn with_overrides(mut self, leaf: &CollectionConfig) -> Self {
        self.config = self.config.merge(leaf);
        self
    }

    /// Collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// URL of the collection on the remote server, if a remote is set.
    pub fn remote_url(&self) -> Option<String> {
        self.config
            .remote
            .as_deref()
            .map(|base| format!("{}/{}", base.trim_end_matches('/'), self.name))
    }

    /// Remote-only mode, off unless enabled.
    pub fn remote_only(&self) -> bool {
        self.config.remote_only.unwrap_or(false)
    }

    /// Store handle options.
    pub fn store(&self) -> &StoreOptions {
        &self.config.options
    }

    /// Initial fetch options.
    pub fn all_docs(&self) -> &FetchOptions {
        &self.config.all_docs
    }

    /// Change feed options.
    pub fn changes(&self) -> &ChangesOptions {
        &self.config.changes
    }

    /// Replication options.
    pub fn sync(&self) -> &SyncOptions {
        &self.config.sync
    }

    /// Write-back debounce window.
    pub fn debounce(&self) -> Duration {
        self.config
            .debounce_ms
            .map_or(DEFAULT_DEBOUNCE, Duration::from_millis)
    }

    /// User callbacks.
    pub fn callbacks(&self) -> &Callbacks {
        &self.config.callbacks
    }
}
