//! Document fixtures.

use docmirror_core::Document;
use serde_json::Value;

/// An empty document.
pub fn doc(id: &str) -> Document {
    Document::new(id)
}

/// Empty documents, one per id, in the given order.
pub fn docs<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<Document> {
    ids.into_iter().map(doc).collect()
}

/// A project document as used throughout the tests.
pub fn project(id: &str, owner: &str, year: i64) -> Document {
    Document::new(id)
        .with_field("type", "project")
        .with_field("owner", owner)
        .with_field("year", year)
}

/// A document with a single field.
pub fn doc_with(id: &str, key: &str, value: impl Into<Value>) -> Document {
    Document::new(id).with_field(key, value)
}

/// The ids of `docs`, in order.
pub fn ids_of(docs: &[Document]) -> Vec<String> {
    docs.iter().map(|doc| doc.id.clone()).collect()
}
