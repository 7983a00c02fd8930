//! Cache invariant checkers and a reference model.

use crate::generators::CacheOp;
use docmirror_core::{Document, OrderedCache};
use std::collections::BTreeMap;
use std::fmt;

/// A broken cache invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    /// Two adjacent entries are out of order.
    Unsorted {
        /// Position of the first entry
        index: usize,
        /// Id at `index`
        left: String,
        /// Id at `index + 1`
        right: String,
    },
    /// The same id appears twice.
    Duplicate {
        /// The repeated id
        id: String,
    },
    /// The cache and the model disagree.
    ModelMismatch {
        /// Ids in the cache
        actual: Vec<String>,
        /// Ids in the model
        expected: Vec<String>,
    },
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::Unsorted { index, left, right } => {
                write!(f, "entries {index} and {} out of order: {left:?} > {right:?}", index + 1)
            }
            InvariantViolation::Duplicate { id } => write!(f, "duplicate id {id:?}"),
            InvariantViolation::ModelMismatch { actual, expected } => {
                write!(f, "cache {actual:?} differs from model {expected:?}")
            }
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Checks that the cache is strictly ascending by id.
pub fn check_sorted_unique(cache: &OrderedCache) -> Result<(), InvariantViolation> {
    for (index, pair) in cache.as_slice().windows(2).enumerate() {
        let (left, right) = (&pair[0].id, &pair[1].id);
        if left == right {
            return Err(InvariantViolation::Duplicate { id: left.clone() });
        }
        if left > right {
            return Err(InvariantViolation::Unsorted {
                index,
                left: left.clone(),
                right: right.clone(),
            });
        }
    }
    Ok(())
}

/// Reference model of a cache: a map keyed by id.
#[derive(Debug, Clone, Default)]
pub struct CacheModel {
    docs: BTreeMap<String, Document>,
}

impl CacheModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one operation.
    pub fn apply(&mut self, op: &CacheOp) {
        match op {
            CacheOp::Upsert(doc) => {
                self.docs.insert(doc.id.clone(), doc.clone());
            }
            CacheOp::Remove(id) => {
                self.docs.remove(id);
            }
        }
    }

    /// Documents in id order.
    pub fn docs(&self) -> Vec<Document> {
        self.docs.values().cloned().collect()
    }
}

/// Applies `op` to a cache.
pub fn apply_op(cache: &mut OrderedCache, op: &CacheOp) {
    match op {
        CacheOp::Upsert(doc) => {
            cache.upsert(doc.clone());
        }
        CacheOp::Remove(id) => {
            cache.remove(id);
        }
    }
}

/// Checks that the cache holds exactly the documents of the model.
pub fn check_matches_model(
    cache: &OrderedCache,
    model: &CacheModel,
) -> Result<(), InvariantViolation> {
    check_sorted_unique(cache)?;
    if cache.as_slice() != model.docs().as_slice() {
        return Err(InvariantViolation::ModelMismatch {
            actual: cache.ids().into_iter().map(str::to_string).collect(),
            expected: model.docs.keys().cloned().collect(),
        });
    }
    Ok(())
}
