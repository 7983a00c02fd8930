//! # DocMirror Core
//!
//! Data model for DocMirror, an in-memory mirror of document collections.
//!
//! This crate provides:
//! - Document snapshots with CouchDB-style reserved keys
//! - The ordered cache (sorted by id, binary-search upsert and remove)
//! - Mango-style selectors for query views
//! - Change feed and replication event payloads
//! - Layered bucket and collection configuration
//!
//! ## Key Invariants
//!
//! - Cache entries are strictly ascending by id
//! - The cache is only ever changed one document at a time
//! - Documents are immutable snapshots; updates replace them whole
//!
//! Nothing in this crate performs I/O. The background processes that keep
//! caches current live in `docmirror_engine`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod document;
mod error;
mod event;
mod selector;

pub use cache::{DirectSet, OrderedCache, ReactiveSet, Upsert};
pub use config::{
    merge_json, BucketConfig, Callback, Callbacks, CancelFn, ChangesOptions, Checkpoint,
    CollectionConfig, DirectionOptions, EffectiveConfig, FetchOptions, Merge, RetryConfig,
    StoreOptions, SyncOptions, DEFAULT_DEBOUNCE,
};
pub use document::{Document, DELETED_KEY, ID_KEY, REV_KEY};
pub use error::{CoreError, CoreResult};
pub use event::{
    Change, ChangesComplete, Completion, Direction, FeedEvent, Notice, ReplicationEvent,
    ReplicationInfo, Source,
};
pub use selector::{Predicate, Selector};
