//! Document snapshots.
//!
//! A [`Document`] is an immutable value snapshot of one record in a
//! collection. The cache never edits a document in place; every mutation
//! swaps the stored snapshot for a new one.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved key holding the document id.
pub const ID_KEY: &str = "_id";
/// Reserved key holding the revision.
pub const REV_KEY: &str = "_rev";
/// Reserved key holding the deletion marker.
pub const DELETED_KEY: &str = "_deleted";

/// A document snapshot.
///
/// Serializes with CouchDB-style reserved keys (`_id`, `_rev`, `_deleted`)
/// and the user fields flattened alongside them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Unique id within the collection.
    #[serde(rename = "_id", default)]
    pub id: String,
    /// Opaque revision assigned by the store.
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    /// Whether this snapshot is a tombstone.
    #[serde(rename = "_deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,
    /// User fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Document {
    /// Creates an empty document with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Creates a tombstone for `id` at revision `rev`.
    pub fn tombstone(id: impl Into<String>, rev: Option<String>) -> Self {
        Self {
            id: id.into(),
            rev,
            deleted: true,
            fields: Map::new(),
        }
    }

    /// Sets the revision.
    #[must_use]
    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    /// Sets a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Marks the snapshot as deleted.
    #[must_use]
    pub fn deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Returns a field value.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Builds a document from a JSON object.
    ///
    /// The object must carry a string `_id`.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        if !value.is_object() {
            return Err(CoreError::invalid_document("document must be a JSON object"));
        }
        match value.get(ID_KEY) {
            Some(Value::String(_)) => {}
            Some(_) => return Err(CoreError::invalid_document("_id must be a string")),
            None => return Err(CoreError::invalid_document("missing _id")),
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Returns the JSON form used for selector matching.
    ///
    /// Unlike the serialized form, `_deleted` is always present so that
    /// selectors on it behave the same for live documents and tombstones.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        object.insert(ID_KEY.into(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            object.insert(REV_KEY.into(), Value::String(rev.clone()));
        }
        object.insert(DELETED_KEY.into(), Value::Bool(self.deleted));
        Value::Object(object)
    }

    /// Returns the numeric generation of the revision (`"3-abc"` → 3).
    pub fn generation(&self) -> u64 {
        self.rev
            .as_deref()
            .and_then(|rev| rev.split_once('-'))
            .and_then(|(generation, _)| generation.parse().ok())
            .unwrap_or(0)
    }
}
