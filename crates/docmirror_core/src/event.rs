//! Change feed and replication events.
//!
//! These are the payloads a document store delivers to the engine and that
//! the engine forwards, unchanged, to user callbacks.

use crate::document::Document;
use serde::{Deserialize, Serialize};

/// One per-document notification from a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// Document id.
    pub id: String,
    /// Feed sequence number of this change.
    pub seq: u64,
    /// Whether the change deleted the document.
    #[serde(default)]
    pub deleted: bool,
    /// Document body, when the feed includes documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Document>,
}

impl Change {
    /// Creates a change carrying `doc`.
    pub fn upsert(seq: u64, doc: Document) -> Self {
        Self {
            id: doc.id.clone(),
            seq,
            deleted: doc.deleted,
            doc: Some(doc),
        }
    }

    /// Creates a deletion of `id`.
    pub fn delete(seq: u64, id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            doc: Some(Document::tombstone(id.clone(), None)),
            id,
            seq,
            deleted: true,
        }
    }

    /// Returns true if the change removes the document.
    ///
    /// Either the change itself or the carried snapshot may mark deletion.
    pub fn is_deletion(&self) -> bool {
        self.deleted || self.doc.as_ref().is_some_and(|doc| doc.deleted)
    }
}

/// Payload of a feed `complete` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangesComplete {
    /// Batch of results, for one-shot feeds that report them at the end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<Change>>,
    /// Last sequence number the feed reached.
    pub last_seq: u64,
}

/// Which background process produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The local change feed.
    Feed,
    /// The replication process.
    Replication,
}

/// A lifecycle notification (`paused`, `active`, `denied`, `error`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    /// Producer of the notice.
    pub source: Source,
    /// Attached message, typically an error description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Notice {
    /// Creates a notice without a message.
    pub fn new(source: Source) -> Self {
        Self {
            source,
            message: None,
        }
    }

    /// Creates a notice with a message.
    pub fn with_message(source: Source, message: impl Into<String>) -> Self {
        Self {
            source,
            message: Some(message.into()),
        }
    }
}

/// Events delivered by a change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A document changed.
    Change(Change),
    /// The feed finished.
    Complete(ChangesComplete),
    /// The feed is idle, optionally because of an error.
    Paused(Option<String>),
    /// The feed resumed.
    Active,
    /// The feed was refused access.
    Denied(String),
    /// The feed failed.
    Error(String),
}

/// Direction of a replicated batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Remote to local.
    Pull,
    /// Local to remote.
    Push,
}

/// Progress report for a replicated batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationInfo {
    /// Direction of the batch.
    pub direction: Direction,
    /// Documents read from the source.
    pub docs_read: u64,
    /// Documents written to the target.
    pub docs_written: u64,
    /// Source sequence reached (the resume checkpoint).
    pub last_seq: u64,
}

/// Events delivered by a replication session.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    /// A batch was replicated.
    Change(ReplicationInfo),
    /// Replication is idle, optionally because of an error.
    Paused(Option<String>),
    /// Replication resumed.
    Active,
    /// A document was refused by the target.
    Denied(String),
    /// The session failed.
    Error {
        /// Error description.
        message: String,
        /// Whether the failure is transient.
        retryable: bool,
    },
    /// A one-shot session finished.
    Complete,
}

/// What finished, for completion callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    /// The change feed completed.
    Feed(ChangesComplete),
    /// A replication session completed.
    Replication,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_from_flag_or_doc() {
        assert!(Change::delete(3, "a").is_deletion());

        let mut change = Change::upsert(4, Document::new("b"));
        assert!(!change.is_deletion());
        change.doc = Some(Document::new("b").deleted());
        assert!(change.is_deletion());
    }

    #[test]
    fn upsert_copies_id() {
        let change = Change::upsert(1, Document::new("x"));
        assert_eq!(change.id, "x");
        assert_eq!(change.seq, 1);
    }
}
