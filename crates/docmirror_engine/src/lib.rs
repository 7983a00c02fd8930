//! # DocMirror Engine
//!
//! Keeps in-memory caches of document collections in step with a replicating
//! document store.
//!
//! This crate provides:
//! - The collection registry ([`Bucket`]): open, read, close
//! - Change feed reconciliation into each collection's ordered cache
//! - Supervised bidirectional replication with backoff retry
//! - Query views with debounced bulk write-back
//! - A store abstraction and an in-memory store
//!
//! ## Architecture
//!
//! Opening a collection subscribes to its change feed, starts the initial
//! fetch and, when a remote is configured, replication. All three run as
//! tokio tasks. The fetch and the feed both mutate the collection's cache,
//! one document at a time, under the collection's lock.
//!
//! ```no_run
//! use docmirror_core::{BucketConfig, CollectionConfig};
//! use docmirror_engine::{Bucket, MemoryStore};
//!
//! # async fn demo() -> docmirror_engine::EngineResult<()> {
//! let bucket = Bucket::builder()
//!     .config(BucketConfig::new(CollectionConfig::new().remote("http://couch:5984")))
//!     .store(MemoryStore::new())
//!     .build()?;
//! bucket.open("projects")?;
//! let projects = bucket.get("projects")?;
//! # let _ = projects;
//! bucket.close("projects").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Key Invariants
//!
//! - One open collection per name; opening twice returns the same handle
//! - Caches are only mutated per document, never replaced
//! - Close releases feed, replication and fetch even if the store fails
//! - Nothing fetched after close reaches the cache

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod install;
mod memory;
mod mirror;
mod query;
mod reconciler;
mod registry;
mod replication;
mod signal;
mod store;

pub use error::{EngineError, EngineResult};
pub use install::Integration;
pub use memory::MemoryStore;
pub use query::{Payload, QueryView, WriteOutcome, WriteTicket};
pub use reconciler::{FeedHandle, FeedState};
pub use registry::{Bucket, BucketBuilder};
pub use replication::{ReplicationState, ReplicationStats, ReplicationSupervisor};
pub use store::{
    ChangeStream, DocumentStore, ReplicationSession, StoreHandle, StoreTarget, WriteResult,
};
