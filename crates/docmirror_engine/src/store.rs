//! Document store abstraction.
//!
//! The engine never talks to a database directly. It opens handles through a
//! [`DocumentStore`], reads and writes through [`StoreHandle`], and consumes
//! change feeds and replication sessions as channels of events. Dropping the
//! receiving side of a channel tells the producer to stop.

use crate::error::EngineResult;
use async_trait::async_trait;
use docmirror_core::{
    ChangesOptions, Document, FeedEvent, FetchOptions, ReplicationEvent, StoreOptions, SyncOptions,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Receiving side of a change feed.
pub type ChangeStream = mpsc::UnboundedReceiver<FeedEvent>;

/// Receiving side of a replication session.
pub type ReplicationSession = mpsc::UnboundedReceiver<ReplicationEvent>;

/// What a store handle is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreTarget {
    /// A local database, by name.
    Local(String),
    /// A remote database, by URL.
    Remote(String),
}

impl StoreTarget {
    /// The database name or URL.
    pub fn address(&self) -> &str {
        match self {
            StoreTarget::Local(name) | StoreTarget::Remote(name) => name,
        }
    }

    /// Returns true for remote targets.
    pub fn is_remote(&self) -> bool {
        matches!(self, StoreTarget::Remote(_))
    }
}

impl fmt::Display for StoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreTarget::Local(name) => write!(f, "local:{name}"),
            StoreTarget::Remote(url) => write!(f, "{url}"),
        }
    }
}

/// Per-document result of a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteResult {
    /// Document id.
    pub id: String,
    /// New revision, when the write succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Error name, when the write failed (for example `conflict`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WriteResult {
    /// A successful write.
    pub fn ok(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: Some(rev.into()),
            error: None,
        }
    }

    /// A failed write.
    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: None,
            error: Some(error.into()),
        }
    }

    /// Returns true if the write succeeded.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Factory for store handles and replication sessions.
pub trait DocumentStore: Send + Sync + 'static {
    /// Opens a handle to `target`.
    fn open(&self, target: &StoreTarget, options: &StoreOptions)
        -> EngineResult<Arc<dyn StoreHandle>>;

    /// Starts bidirectional replication between the local database `local`
    /// and the remote database at `remote`.
    fn replicate(
        &self,
        local: &str,
        remote: &str,
        options: &SyncOptions,
    ) -> EngineResult<ReplicationSession>;
}

/// An open handle to one database.
#[async_trait]
pub trait StoreHandle: Send + Sync + 'static {
    /// The target this handle is bound to.
    fn target(&self) -> &StoreTarget;

    /// Fetches every live document in id order.
    async fn all_docs(&self, options: &FetchOptions) -> EngineResult<Vec<Document>>;

    /// Subscribes to the change feed.
    fn changes(&self, options: &ChangesOptions) -> EngineResult<ChangeStream>;

    /// Reads one document.
    async fn get(&self, id: &str) -> EngineResult<Option<Document>>;

    /// Writes one document.
    async fn put(&self, doc: Document) -> EngineResult<WriteResult>;

    /// Writes a batch of documents. Per-document failures are reported in
    /// the results, not as an error.
    async fn bulk_docs(&self, docs: Vec<Document>) -> EngineResult<Vec<WriteResult>>;

    /// Releases the handle.
    async fn close(&self) -> EngineResult<()>;
}
