//! Ordered document cache.
//!
//! The cache keeps one collection's documents sorted ascending by id with no
//! duplicates. Every position is found by a lower-bound binary search: when
//! the probe id is less than the target the search continues right,
//! otherwise left, so it converges on the first slot whose id is `>=` the
//! target.
//!
//! Writes into the backing vector go through a [`ReactiveSet`], which lets a
//! host UI framework observe individual slot changes. [`DirectSet`] is the
//! plain, non-reactive implementation.

use crate::document::Document;
use std::fmt;
use std::sync::Arc;

/// Capability for writing cache slots observably.
///
/// The cache calls [`reserve`](Self::reserve) followed by
/// [`set`](Self::set) for an insertion, so observers see neither a gap nor a
/// stale duplicate of a neighbouring entry. All default methods perform the
/// plain vector operation.
pub trait ReactiveSet: Send + Sync {
    /// Inserts an empty placeholder at `index`, shifting later entries.
    fn reserve(&self, entries: &mut Vec<Document>, index: usize) {
        entries.insert(index, Document::default());
    }

    /// Stores `value` at `index`.
    fn set(&self, entries: &mut Vec<Document>, index: usize, value: Document) {
        entries[index] = value;
    }

    /// Deletes the entry at `index`.
    fn delete(&self, entries: &mut Vec<Document>, index: usize) -> Document {
        entries.remove(index)
    }
}

/// Non-reactive [`ReactiveSet`]: direct assignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectSet;

impl ReactiveSet for DirectSet {}

/// Outcome of [`OrderedCache::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new entry was inserted at this position.
    Inserted(usize),
    /// The existing entry at this position was replaced.
    Replaced(usize),
    /// The existing entry at this position already held identical content.
    Unchanged(usize),
}

impl Upsert {
    /// Returns the position of the document.
    pub fn position(&self) -> usize {
        match *self {
            Upsert::Inserted(i) | Upsert::Replaced(i) | Upsert::Unchanged(i) => i,
        }
    }

    /// Returns true if the cache contents changed.
    pub fn is_change(&self) -> bool {
        !matches!(self, Upsert::Unchanged(_))
    }
}

/// Documents of one collection, sorted by id.
pub struct OrderedCache {
    entries: Vec<Document>,
    setter: Arc<dyn ReactiveSet>,
}

impl OrderedCache {
    /// Creates an empty cache writing through [`DirectSet`].
    pub fn new() -> Self {
        Self::with_setter(Arc::new(DirectSet))
    }

    /// Creates an empty cache writing through `setter`.
    pub fn with_setter(setter: Arc<dyn ReactiveSet>) -> Self {
        Self {
            entries: Vec::new(),
            setter,
        }
    }

    /// Lower-bound search for `id`.
    fn search(&self, id: &str) -> usize {
        self.entries.partition_point(|doc| doc.id.as_str() < id)
    }

    fn matches_at(&self, index: usize, id: &str) -> bool {
        self.entries.get(index).is_some_and(|doc| doc.id == id)
    }

    /// Inserts `doc`, or replaces the entry with the same id.
    pub fn upsert(&mut self, doc: Document) -> Upsert {
        let index = self.search(&doc.id);
        if self.matches_at(index, &doc.id) {
            if self.entries[index] == doc {
                return Upsert::Unchanged(index);
            }
            self.setter.set(&mut self.entries, index, doc);
            Upsert::Replaced(index)
        } else {
            self.setter.reserve(&mut self.entries, index);
            self.setter.set(&mut self.entries, index, doc);
            Upsert::Inserted(index)
        }
    }

    /// Removes the entry with `id`. Missing ids are ignored.
    pub fn remove(&mut self, id: &str) -> Option<Document> {
        let index = self.search(id);
        if self.matches_at(index, id) {
            Some(self.setter.delete(&mut self.entries, index))
        } else {
            None
        }
    }

    /// Upserts every document, in order. Returns how many changed the cache.
    pub fn extend<I>(&mut self, docs: I) -> usize
    where
        I: IntoIterator<Item = Document>,
    {
        docs.into_iter()
            .map(|doc| self.upsert(doc))
            .filter(Upsert::is_change)
            .count()
    }

    /// Returns the document with `id`.
    pub fn get(&self, id: &str) -> Option<&Document> {
        self.position(id).map(|index| &self.entries[index])
    }

    /// Returns the position of `id`.
    pub fn position(&self, id: &str) -> Option<usize> {
        let index = self.search(id);
        self.matches_at(index, id).then_some(index)
    }

    /// Returns true if a document with `id` is cached.
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    /// Number of cached documents.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates documents in id order.
    pub fn iter(&self) -> std::slice::Iter<'_, Document> {
        self.entries.iter()
    }

    /// Returns the documents as a slice.
    pub fn as_slice(&self) -> &[Document] {
        &self.entries
    }

    /// Returns an owned copy of the documents.
    pub fn snapshot(&self) -> Vec<Document> {
        self.entries.clone()
    }

    /// Returns the ids in order.
    pub fn ids(&self) -> Vec<&str> {
        self.entries.iter().map(|doc| doc.id.as_str()).collect()
    }
}

impl Default for OrderedCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OrderedCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderedCache")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}

impl<'a> IntoIterator for &'a OrderedCache {
    type Item = &'a Document;
    type IntoIter = std::slice::Iter<'a, Document>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
